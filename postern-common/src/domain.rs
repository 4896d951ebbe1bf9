//! Domain newtype
//!
//! Outbound work is keyed by recipient domain, so domains are normalised to
//! lower case on construction and compare cheaply by value.

use std::{
    fmt::{self, Display},
    ops::Deref,
    sync::Arc,
};

use serde::{Deserialize, Serialize};

/// A lower-cased domain name.
///
/// ```
/// use postern_common::Domain;
///
/// let domain = Domain::new("Example.COM");
/// assert_eq!(domain.as_str(), "example.com");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Domain(Arc<str>);

impl Domain {
    #[must_use]
    pub fn new(s: impl AsRef<str>) -> Self {
        Self(Arc::from(s.as_ref().trim().to_ascii_lowercase()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The domain part of an address, with or without angle brackets.
    ///
    /// Returns `None` for local-only addresses such as `postmaster`.
    #[must_use]
    pub fn of_address(address: &str) -> Option<Self> {
        let address = address.trim().trim_start_matches('<').trim_end_matches('>');
        address
            .rsplit_once('@')
            .map(|(_, domain)| domain)
            .filter(|domain| !domain.is_empty())
            .map(Self::new)
    }

    /// Whether this is an address literal (`[192.0.2.1]`) or a bare IP.
    #[must_use]
    pub fn ip_literal(&self) -> Option<std::net::IpAddr> {
        let inner = self
            .0
            .strip_prefix('[')
            .and_then(|s| s.strip_suffix(']'))
            .unwrap_or(&self.0);
        let inner = inner.strip_prefix("ipv6:").unwrap_or(inner);

        inner.parse().ok()
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

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    use super::*;

    #[test]
    fn normalises_case() {
        assert_eq!(Domain::new("Mail.Example.COM"), Domain::new("mail.example.com"));
    }

    #[test]
    fn from_address() {
        assert_eq!(
            Domain::of_address("<User@Example.com>"),
            Some(Domain::new("example.com"))
        );
        assert_eq!(Domain::of_address("a@b"), Some(Domain::new("b")));
        assert_eq!(Domain::of_address("<postmaster>"), None);
        assert_eq!(Domain::of_address("broken@"), None);
    }

    #[test]
    fn ip_literals() {
        assert_eq!(
            Domain::new("[192.0.2.1]").ip_literal(),
            Some(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)))
        );
        assert_eq!(
            Domain::new("[IPv6:::1]").ip_literal(),
            Some(IpAddr::V6(Ipv6Addr::LOCALHOST))
        );
        assert_eq!(Domain::new("example.com").ip_literal(), None);
    }

    #[test]
    fn serde() {
        let domain = Domain::new("serde.example.com");
        let serialized = serde_json::to_string(&domain).unwrap();
        assert_eq!(serialized, "\"serde.example.com\"");

        let deserialized: Domain = serde_json::from_str("\"SERDE.example.com\"").unwrap();
        assert_eq!(deserialized, domain);
    }
}
