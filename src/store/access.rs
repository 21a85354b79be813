//! Connection admission by remote address.
//!
//! [`AccessRules`] is the seam: anything that can answer "may this address
//! connect?" can be installed into [`AccessControl`]. The bundled
//! [`AccessPolicy`] evaluates allow/deny network lists where the most
//! specific matching network decides, and deny wins between equally specific
//! rules.

use std::{
    fmt::{self, Debug, Display},
    net::IpAddr,
    str::FromStr,
    sync::Arc,
};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Evaluates whether a remote address may connect.
pub trait AccessRules: Send + Sync + Debug {
    fn permits(&self, remote: IpAddr) -> bool;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Allow,
    Deny,
}

/// An address block in CIDR notation, or a single address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Network {
    addr: IpAddr,
    prefix: u8,
}

impl Network {
    #[must_use]
    pub const fn prefix(&self) -> u8 {
        self.prefix
    }

    #[must_use]
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip.to_canonical()) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = mask(self.prefix, 32) as u32;
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = mask(self.prefix, 128);
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

const fn mask(prefix: u8, width: u32) -> u128 {
    if prefix == 0 {
        0
    } else {
        (u128::MAX << (128 - prefix as u32)) >> (128 - width)
    }
}

impl FromStr for Network {
    type Err = ConfigError;

    fn from_str(network: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: String| ConfigError::InvalidNetwork {
            network: network.to_string(),
            reason,
        };

        let (addr, prefix) = match network.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (network, None),
        };

        let addr = addr
            .trim()
            .parse::<IpAddr>()
            .map_err(|err| invalid(err.to_string()))?;
        let width = if addr.is_ipv4() { 32 } else { 128 };

        let prefix = match prefix {
            Some(prefix) => prefix
                .trim()
                .parse::<u8>()
                .map_err(|err| invalid(err.to_string()))?,
            None => width,
        };

        if prefix > width {
            return Err(invalid(format!("prefix length {prefix} exceeds {width}")));
        }

        // IPv4-mapped blocks are matched as plain IPv4
        match addr.to_canonical() {
            IpAddr::V4(v4) if addr.is_ipv6() && prefix >= 96 => Ok(Self {
                addr: IpAddr::V4(v4),
                prefix: prefix - 96,
            }),
            _ => Ok(Self { addr, prefix }),
        }
    }
}

impl TryFrom<String> for Network {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Network> for String {
    fn from(network: Network) -> Self {
        network.to_string()
    }
}

impl Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

/// Allow/deny network lists.
///
/// When nothing matches, `default` decides. Left unset, it denies if any
/// allow rule exists and allows otherwise.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessPolicy {
    #[serde(default)]
    pub allow: Vec<Network>,
    #[serde(default)]
    pub deny: Vec<Network>,
    #[serde(default)]
    pub default: Option<Action>,
}

impl AccessPolicy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn allow(mut self, network: Network) -> Self {
        self.allow.push(network);
        self
    }

    #[must_use]
    pub fn deny(mut self, network: Network) -> Self {
        self.deny.push(network);
        self
    }

    #[must_use]
    pub const fn with_default(mut self, action: Action) -> Self {
        self.default = Some(action);
        self
    }

    fn default_action(&self) -> Action {
        self.default.unwrap_or(if self.allow.is_empty() {
            Action::Allow
        } else {
            Action::Deny
        })
    }

    fn most_specific(networks: &[Network], ip: IpAddr) -> Option<u8> {
        networks
            .iter()
            .filter(|network| network.contains(ip))
            .map(Network::prefix)
            .max()
    }
}

impl AccessRules for AccessPolicy {
    fn permits(&self, remote: IpAddr) -> bool {
        match (
            Self::most_specific(&self.allow, remote),
            Self::most_specific(&self.deny, remote),
        ) {
            (None, None) => self.default_action() == Action::Allow,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (Some(allow), Some(deny)) => allow > deny,
        }
    }
}

/// Holder for the active access rules; replaced as a whole.
#[derive(Debug, Default)]
pub struct AccessControl {
    rules: RwLock<Option<Arc<dyn AccessRules>>>,
}

impl AccessControl {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(&self, rules: impl AccessRules + 'static) {
        self.replace_shared(Arc::new(rules));
    }

    pub fn replace_shared(&self, rules: Arc<dyn AccessRules>) {
        *self.rules.write() = Some(rules);
    }

    pub fn clear(&self) {
        *self.rules.write() = None;
    }

    /// The installed rules, if any
    #[must_use]
    pub fn current(&self) -> Option<Arc<dyn AccessRules>> {
        self.rules.read().clone()
    }

    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.rules.read().is_some()
    }
}

impl Clone for AccessControl {
    fn clone(&self) -> Self {
        Self {
            rules: RwLock::new(self.current()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    use super::*;

    fn net(s: &str) -> Network {
        s.parse().unwrap()
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_network_parsing() {
        assert_eq!(net("10.0.0.0/8").prefix(), 8);
        assert_eq!(net("127.0.0.1").prefix(), 32);
        assert_eq!(net("::1").prefix(), 128);
        assert_eq!(net("::ffff:10.0.0.0/104"), net("10.0.0.0/8"));

        assert!("10.0.0.0/33".parse::<Network>().is_err());
        assert!("example.com".parse::<Network>().is_err());
        assert!("10.0.0.0/x".parse::<Network>().is_err());
    }

    #[test]
    fn test_network_contains() {
        assert!(net("10.0.0.0/8").contains(ip("10.255.1.2")));
        assert!(!net("10.0.0.0/8").contains(ip("11.0.0.1")));
        assert!(net("0.0.0.0/0").contains(ip("203.0.113.9")));
        assert!(!net("0.0.0.0/0").contains(ip("2001:db8::1")));
        assert!(net("2001:db8::/32").contains(ip("2001:db8:ffff::1")));
        assert!(net("192.0.2.1").contains(IpAddr::V6(Ipv4Addr::new(192, 0, 2, 1).to_ipv6_mapped())));
        assert!(!net("192.0.2.1").contains(ip("192.0.2.2")));
    }

    #[test]
    fn test_most_specific_match_wins() {
        let policy = AccessPolicy::new()
            .deny(net("10.0.0.0/8"))
            .allow(net("10.1.0.0/16"));

        assert!(policy.permits(ip("10.1.2.3")));
        assert!(!policy.permits(ip("10.2.0.1")));
    }

    #[test]
    fn test_deny_wins_ties() {
        let policy = AccessPolicy::new()
            .allow(net("192.0.2.0/24"))
            .deny(net("192.0.2.0/24"));

        assert!(!policy.permits(ip("192.0.2.10")));
    }

    #[test]
    fn test_default_action() {
        let open = AccessPolicy::new().deny(net("198.51.100.0/24"));
        assert!(open.permits(ip("203.0.113.1")));

        let closed = AccessPolicy::new().allow(net("127.0.0.1"));
        assert!(!closed.permits(ip("203.0.113.1")));
        assert!(closed.permits(IpAddr::V4(Ipv4Addr::LOCALHOST)));

        let explicit = AccessPolicy::new()
            .allow(net("127.0.0.1"))
            .with_default(Action::Allow);
        assert!(explicit.permits(IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1))));
    }

    #[test]
    fn test_replace_is_wholesale() {
        let control = AccessControl::new();
        assert!(!control.is_configured());

        control.replace(AccessPolicy::new().deny(net("0.0.0.0/0")));
        assert!(!control.current().unwrap().permits(ip("127.0.0.1")));

        control.replace(AccessPolicy::new());
        assert!(control.current().unwrap().permits(ip("127.0.0.1")));

        control.clear();
        assert!(control.current().is_none());
    }

    #[test]
    fn test_policy_from_toml() {
        let policy: AccessPolicy = toml::from_str(
            r#"
            allow = ["10.0.0.0/8", "::1"]
            deny = ["10.9.0.0/16"]
            default = "deny"
            "#,
        )
        .unwrap();

        assert_eq!(policy.allow.len(), 2);
        assert_eq!(policy.default, Some(Action::Deny));
        assert!(policy.permits(ip("10.1.1.1")));
        assert!(!policy.permits(ip("10.9.1.1")));
        assert!(policy.permits(ip("::1")));
    }
}
