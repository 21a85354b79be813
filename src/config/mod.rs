//! Configuration intake.
//!
//! [`Options`] is what callers hand to [`Server::configure`](crate::server::Server::configure):
//! loosely typed, every field optional, deserializable from TOML. Each
//! configure call turns it into an immutable [`Configuration`], resolving
//! defaults and loading TLS material. A configuration is never mutated; the
//! next configure call supersedes it.

use std::{
    collections::HashMap,
    fmt::{self, Display},
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use serde::{Deserialize, Deserializer, Serialize};

use crate::{
    error::ConfigError,
    policy::{Override, Overrides},
    session::{Address, Credentials},
    store::{AccessPolicy, Domain},
};

pub mod tls;

pub use self::tls::TlsMaterial;

mod defaults {
    pub const PORT: u16 = 25;
    pub const SECURE_PORT: u16 = 465;

    pub fn host() -> String {
        String::from("0.0.0.0")
    }

    pub fn name() -> String {
        String::from("skyfall-smtp-server")
    }

    /// 10 MiB
    pub const fn size() -> usize {
        10 * 1024 * 1024
    }

    pub const fn socket_timeout_ms() -> u64 {
        60_000
    }

    pub const fn close_timeout_ms() -> u64 {
        30_000
    }

    pub const fn enabled() -> bool {
        true
    }
}

/// Settings for a configure call.
///
/// Keys are camelCase, with snake_case accepted as well:
///
/// ```
/// use skyfall_smtp::config::Options;
///
/// let options = Options::from_toml(
///     r#"
///     port = 2525
///     authOptional = false
///     domain = "example.com"
///
///     [users]
///     alice = "s3cret"
///
///     [access]
///     deny = ["203.0.113.0/24"]
///     "#,
/// )
/// .unwrap();
///
/// assert_eq!(options.port, Some(2525));
/// assert!(!options.auth_optional);
/// ```
#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Options {
    /// Defaults to 25, or 465 when secure
    pub port: Option<u16>,
    pub host: String,
    /// Implicit TLS. Defaults to whether a key and certificate were given.
    pub secure: Option<bool>,
    pub key: Option<PathBuf>,
    #[serde(alias = "cert")]
    pub certificate: Option<PathBuf>,
    pub name: String,
    /// Maximum message size in bytes; 0 means the default
    pub size: usize,
    #[serde(alias = "auth_optional")]
    pub auth_optional: bool,
    #[serde(alias = "allow_insecure_auth")]
    pub allow_insecure_auth: bool,
    #[serde(alias = "disable_reverse_lookup")]
    pub disable_reverse_lookup: bool,
    #[serde(alias = "max_clients")]
    pub max_clients: Option<usize>,
    #[serde(alias = "use_proxy")]
    pub use_proxy: bool,
    pub lmtp: bool,
    /// Milliseconds; 0 means the default
    #[serde(alias = "socket_timeout")]
    pub socket_timeout: u64,
    /// Milliseconds; 0 means the default
    #[serde(alias = "close_timeout")]
    pub close_timeout: u64,
    pub users: HashMap<String, String>,
    #[serde(alias = "domain", deserialize_with = "one_or_many")]
    pub domains: Vec<Domain>,
    pub access: Option<AccessPolicy>,
    #[serde(skip)]
    pub overrides: Overrides,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            port: None,
            host: defaults::host(),
            secure: None,
            key: None,
            certificate: None,
            name: defaults::name(),
            size: defaults::size(),
            auth_optional: defaults::enabled(),
            allow_insecure_auth: defaults::enabled(),
            disable_reverse_lookup: false,
            max_clients: None,
            use_proxy: false,
            lmtp: false,
            socket_timeout: defaults::socket_timeout_ms(),
            close_timeout: defaults::close_timeout_ms(),
            users: HashMap::default(),
            domains: Vec::default(),
            access: None,
            overrides: Overrides::default(),
        }
    }
}

impl Options {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse options from a TOML document.
    ///
    /// # Errors
    /// If the document is not valid TOML or a value has the wrong shape.
    pub fn from_toml(document: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(document)?)
    }

    /// Read and parse a TOML options file.
    ///
    /// # Errors
    /// If the file cannot be read, or see [`Options::from_toml`].
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_toml(&std::fs::read_to_string(path)?)
    }

    #[must_use]
    pub const fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn with_tls(mut self, certificate: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        self.certificate = Some(certificate.into());
        self.key = Some(key.into());
        self
    }

    #[must_use]
    pub const fn with_secure(mut self, secure: bool) -> Self {
        self.secure = Some(secure);
        self
    }

    #[must_use]
    pub const fn with_lmtp(mut self, lmtp: bool) -> Self {
        self.lmtp = lmtp;
        self
    }

    #[must_use]
    pub const fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    #[must_use]
    pub const fn with_max_clients(mut self, max_clients: usize) -> Self {
        self.max_clients = Some(max_clients);
        self
    }

    #[must_use]
    pub const fn with_auth_optional(mut self, optional: bool) -> Self {
        self.auth_optional = optional;
        self
    }

    #[must_use]
    pub fn with_user(mut self, username: impl Into<String>, secret: impl Into<String>) -> Self {
        self.users.insert(username.into(), secret.into());
        self
    }

    #[must_use]
    pub fn with_domain(mut self, domain: impl Into<Domain>) -> Self {
        self.domains.push(domain.into());
        self
    }

    #[must_use]
    pub fn with_access(mut self, access: AccessPolicy) -> Self {
        self.access = Some(access);
        self
    }

    #[must_use]
    pub fn on_auth(mut self, hook: Override<Credentials>) -> Self {
        self.overrides.on_auth = Some(hook);
        self
    }

    #[must_use]
    pub fn on_connect(mut self, hook: Override<SocketAddr>) -> Self {
        self.overrides.on_connect = Some(hook);
        self
    }

    #[must_use]
    pub fn on_mail_from(mut self, hook: Override<Address>) -> Self {
        self.overrides.on_mail_from = Some(hook);
        self
    }

    #[must_use]
    pub fn on_rcpt_to(mut self, hook: Override<Address>) -> Self {
        self.overrides.on_rcpt_to = Some(hook);
        self
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

fn one_or_many<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(value) => vec![value],
        OneOrMany::Many(values) => values,
    })
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Smtp,
    Lmtp,
}

impl Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Smtp => "smtp",
            Self::Lmtp => "lmtp",
        })
    }
}

/// Limits handed to the protocol engine to enforce.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Limits {
    pub size: usize,
    /// `None` is unbounded
    pub max_clients: Option<usize>,
    pub socket_timeout: Duration,
    pub close_timeout: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Admission {
    pub auth_optional: bool,
    pub allow_insecure_auth: bool,
}

/// A resolved, immutable configuration.
#[derive(Clone, Debug)]
pub struct Configuration {
    /// Identifier of the server this configuration belongs to
    pub id: Arc<str>,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub secure: bool,
    pub mode: Mode,
    pub tls: Option<TlsMaterial>,
    pub limits: Limits,
    pub admission: Admission,
    pub disable_reverse_lookup: bool,
    pub use_proxy: bool,
}

impl Configuration {
    /// Resolve `options` for the server identified by `id`.
    ///
    /// # Errors
    /// If the host is blank, TLS is requested without both a key and a
    /// certificate, or the TLS material cannot be loaded.
    pub fn from_options(id: Arc<str>, options: &Options) -> Result<Self, ConfigError> {
        let host = options.host.trim();
        if host.is_empty() {
            return Err(ConfigError::InvalidConfiguration {
                field: String::from("host"),
                reason: String::from("must not be empty"),
            });
        }

        let tls = match (&options.certificate, &options.key) {
            (Some(certificate), Some(key)) => Some(TlsMaterial::load(certificate, key)?),
            (Some(_), None) => return Err(ConfigError::MissingField("key")),
            (None, Some(_)) => return Err(ConfigError::MissingField("certificate")),
            (None, None) => None,
        };

        let secure = options.secure.unwrap_or(tls.is_some());
        if secure && tls.is_none() {
            return Err(ConfigError::MissingField("certificate"));
        }

        let port = options.port.unwrap_or(if secure {
            defaults::SECURE_PORT
        } else {
            defaults::PORT
        });

        let name = match options.name.trim() {
            "" => defaults::name(),
            name => name.to_string(),
        };

        let or_default = |value: u64, default: u64| {
            Duration::from_millis(if value == 0 { default } else { value })
        };

        Ok(Self {
            id,
            name,
            host: host.to_string(),
            port,
            secure,
            mode: if options.lmtp { Mode::Lmtp } else { Mode::Smtp },
            tls,
            limits: Limits {
                size: if options.size == 0 {
                    defaults::size()
                } else {
                    options.size
                },
                max_clients: options.max_clients.filter(|max| *max > 0),
                socket_timeout: or_default(options.socket_timeout, defaults::socket_timeout_ms()),
                close_timeout: or_default(options.close_timeout, defaults::close_timeout_ms()),
            },
            admission: Admission {
                auth_optional: options.auth_optional,
                allow_insecure_auth: options.allow_insecure_auth,
            },
            disable_reverse_lookup: options.disable_reverse_lookup,
            use_proxy: options.use_proxy,
        })
    }

    /// `host:port`, bracketing IPv6 literals
    #[must_use]
    pub fn address(&self) -> String {
        match self.host.parse::<IpAddr>() {
            Ok(IpAddr::V6(host)) => format!("[{host}]:{}", self.port),
            _ => format!("{}:{}", self.host, self.port),
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            id: Arc::clone(&self.id),
            port: self.port,
            host: self.host.clone(),
            mode: self.mode,
        }
    }
}

/// What a configure call installed, as reported back to the caller and
/// carried by lifecycle events.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub id: Arc<str>,
    pub port: u16,
    pub host: String,
    pub mode: Mode,
}
