//! Accepted recipient domains.
//!
//! [`Domain`] wraps domain strings so an address can never be passed where a
//! domain is expected. Domains are ASCII-lowercased on construction, since
//! DNS names compare case-insensitively.

use std::{
    fmt::{self, Display},
    ops::Deref,
    sync::Arc,
};

use dashmap::DashSet;
use serde::{Deserialize, Serialize};

/// A lowercased domain name.
///
/// # Examples
///
/// ```
/// use skyfall_smtp::store::Domain;
///
/// let domain = Domain::new("Example.COM");
/// assert_eq!(domain.as_str(), "example.com");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Domain(Arc<str>);

impl Domain {
    #[must_use]
    pub fn new(domain: impl AsRef<str>) -> Self {
        Self(domain.as_ref().trim().to_ascii_lowercase().into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Domain {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Deref for Domain {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<String> for Domain {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for Domain {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<Domain> for String {
    fn from(domain: Domain) -> Self {
        domain.0.to_string()
    }
}

/// Set of domains the server accepts mail for.
#[derive(Clone, Debug, Default)]
pub struct DomainSet {
    domains: DashSet<Domain>,
}

impl DomainSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_domain(&self, domain: impl Into<Domain>) {
        self.domains.insert(domain.into());
    }

    /// Whether the domain of `address` (everything after the final `@`) is a
    /// member. An address without `@` has an empty domain and never matches.
    #[must_use]
    pub fn accepts(&self, address: &str) -> bool {
        let domain = address.rsplit_once('@').map_or("", |(_, domain)| domain);

        !domain.is_empty() && self.domains.contains(&Domain::new(domain))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.domains.len()
    }
}
