use std::{
    collections::BTreeMap,
    fmt::{self, Debug, Display},
    net::SocketAddr,
    sync::Arc,
};

use serde::Serialize;
use ulid::Ulid;

/// Per-connection context supplied by the protocol engine.
///
/// The engine owns and mutates this; the core only reads it when evaluating
/// checkpoints and attaches a copy to the events it emits.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Session {
    pub id: Arc<str>,
    pub remote_address: SocketAddr,
    /// Name given by the client in HELO/EHLO/LHLO, once known
    pub client_hostname: Option<String>,
    /// Whether the connection is protected by TLS
    pub secure: bool,
    /// Identity established by a successful authentication
    pub user: Option<String>,
    /// Anything else the engine wants to carry along
    pub metadata: BTreeMap<String, String>,
}

impl Session {
    #[must_use]
    pub fn new(remote_address: SocketAddr) -> Self {
        Self {
            id: Ulid::new().to_string().into(),
            remote_address,
            client_hostname: None,
            secure: false,
            user: None,
            metadata: BTreeMap::default(),
        }
    }

    #[must_use]
    pub const fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    #[must_use]
    pub fn with_client_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.client_hostname = Some(hostname.into());
        self
    }

    #[must_use]
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// An envelope address from MAIL FROM or RCPT TO, with its ESMTP parameters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Address {
    pub address: String,
    pub args: BTreeMap<String, Option<String>>,
}

impl Address {
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            args: BTreeMap::default(),
        }
    }

    #[must_use]
    pub fn with_arg(mut self, key: impl Into<String>, value: Option<String>) -> Self {
        self.args.insert(key.into(), value);
        self
    }

    /// The part after the final `@`, or an empty string when there is none
    #[must_use]
    pub fn domain(&self) -> &str {
        self.address
            .rsplit_once('@')
            .map_or("", |(_, domain)| domain)
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}>", self.address)
    }
}

impl From<&str> for Address {
    fn from(address: &str) -> Self {
        Self::new(address)
    }
}

/// SASL mechanism the client used.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum Mechanism {
    Plain,
    Login,
    XOAuth2,
    CramMd5,
    Other(String),
}

/// Credentials presented at the authenticate checkpoint.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub mechanism: Mechanism,
    pub username: String,
    pub secret: String,
}

impl Credentials {
    #[must_use]
    pub fn plain(username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            mechanism: Mechanism::Plain,
            username: username.into(),
            secret: secret.into(),
        }
    }

    #[must_use]
    pub fn with_mechanism(mut self, mechanism: Mechanism) -> Self {
        self.mechanism = mechanism;
        self
    }
}

impl Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("mechanism", &self.mechanism)
            .field("username", &self.username)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::{Address, Credentials};

    #[test]
    fn domain_is_after_final_at() {
        assert_eq!(Address::new("user@example.com").domain(), "example.com");
        assert_eq!(Address::new("\"a@b\"@example.com").domain(), "example.com");
        assert_eq!(Address::new("postmaster").domain(), "");
        assert_eq!(Address::new("user@").domain(), "");
    }

    #[test]
    fn credentials_debug_hides_secret() {
        let creds = Credentials::plain("alice", "s3cret");
        let debug = format!("{creds:?}");
        assert!(debug.contains("alice"));
        assert!(!debug.contains("s3cret"));
    }
}
