//! Proxy data models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Proxy scheme enumeration
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum ProxyType {
    #[default]
    Http,
    Https,
    Socks5,
}

impl fmt::Display for ProxyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyType::Http => write!(f, "http"),
            ProxyType::Https => write!(f, "https"),
            ProxyType::Socks5 => write!(f, "socks5"),
        }
    }
}

impl FromStr for ProxyType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(ProxyType::Http),
            "https" => Ok(ProxyType::Https),
            "socks5" | "socks" => Ok(ProxyType::Socks5),
            other => Err(format!("unsupported proxy scheme: {other}")),
        }
    }
}

/// Identity of a proxy endpoint: `(host, port, scheme)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProxyId {
    pub host: String,
    pub port: u16,
    pub scheme: ProxyType,
}

impl fmt::Display for ProxyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// Unvalidated proxy endpoint produced by the harvester
///
/// Equality and hashing follow [`ProxyId`]; country metadata does not take
/// part in identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyCandidate {
    pub host: String,
    pub port: u16,
    pub scheme: ProxyType,
    /// ISO country code reported by the source, if it provides one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
}

impl ProxyCandidate {
    pub fn new(host: impl Into<String>, port: u16, scheme: ProxyType) -> Self {
        Self {
            host: host.into(),
            port,
            scheme,
            country: None,
        }
    }

    pub fn with_country(mut self, country: impl Into<String>) -> Self {
        self.country = Some(country.into());
        self
    }

    pub fn id(&self) -> ProxyId {
        ProxyId {
            host: self.host.clone(),
            port: self.port,
            scheme: self.scheme,
        }
    }

    /// Proxy URL suitable for `reqwest::Proxy`
    pub fn url(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }

    /// `host:port` form
    pub fn to_simple_string(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl PartialEq for ProxyCandidate {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.port == other.port && self.scheme == other.scheme
    }
}

impl Eq for ProxyCandidate {}

impl std::hash::Hash for ProxyCandidate {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.port.hash(state);
        self.scheme.hash(state);
    }
}

impl fmt::Display for ProxyCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url())
    }
}

/// Anonymity classification, ordered from least to most anonymous
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnonymityLevel {
    /// Real client IP visible to the target
    Transparent,
    /// Forwarding headers present, real IP hidden
    Anonymous,
    /// No forwarding headers, real IP hidden
    Elite,
}

impl fmt::Display for AnonymityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnonymityLevel::Transparent => write!(f, "transparent"),
            AnonymityLevel::Anonymous => write!(f, "anonymous"),
            AnonymityLevel::Elite => write!(f, "elite"),
        }
    }
}

/// Minimum anonymity a proxy needs to enter the pool (`--proxy-type`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnonymityFilter {
    Elite,
    Anonymous,
    #[default]
    All,
}

impl AnonymityFilter {
    pub fn accepts(&self, level: AnonymityLevel) -> bool {
        match self {
            AnonymityFilter::Elite => level == AnonymityLevel::Elite,
            AnonymityFilter::Anonymous => level >= AnonymityLevel::Anonymous,
            AnonymityFilter::All => true,
        }
    }
}

impl FromStr for AnonymityFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "elite" => Ok(AnonymityFilter::Elite),
            "anonymous" => Ok(AnonymityFilter::Anonymous),
            "all" => Ok(AnonymityFilter::All),
            other => Err(format!("invalid proxy type: {other}. Use: elite, anonymous, all")),
        }
    }
}

/// A candidate that answered the test endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatedProxy {
    pub candidate: ProxyCandidate,
    pub latency_ms: u64,
    pub anonymity_level: AnonymityLevel,
    pub last_checked_at: DateTime<Utc>,
    pub consecutive_failures: u32,
}

impl ValidatedProxy {
    pub fn new(candidate: ProxyCandidate, latency_ms: u64, anonymity_level: AnonymityLevel) -> Self {
        Self {
            candidate,
            latency_ms,
            anonymity_level,
            last_checked_at: Utc::now(),
            consecutive_failures: 0,
        }
    }

    pub fn id(&self) -> ProxyId {
        self.candidate.id()
    }

    pub fn url(&self) -> String {
        self.candidate.url()
    }
}

impl fmt::Display for ValidatedProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}ms, {})",
            self.candidate, self.latency_ms, self.anonymity_level
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_candidate_url() {
        let proxy = ProxyCandidate::new("127.0.0.1", 8080, ProxyType::Http);
        assert_eq!(proxy.url(), "http://127.0.0.1:8080");
        assert_eq!(proxy.to_simple_string(), "127.0.0.1:8080");

        let socks = ProxyCandidate::new("192.168.1.1", 1080, ProxyType::Socks5);
        assert_eq!(socks.url(), "socks5://192.168.1.1:1080");
    }

    #[test]
    fn test_identity_ignores_country() {
        let a = ProxyCandidate::new("10.0.0.1", 3128, ProxyType::Http).with_country("US");
        let b = ProxyCandidate::new("10.0.0.1", 3128, ProxyType::Http);
        let c = ProxyCandidate::new("10.0.0.1", 3128, ProxyType::Https);
        assert_eq!(a, b);
        assert_ne!(a, c);

        let set: HashSet<_> = [a, b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_proxy_type_from_str() {
        assert_eq!("HTTP".parse::<ProxyType>(), Ok(ProxyType::Http));
        assert_eq!("socks5".parse::<ProxyType>(), Ok(ProxyType::Socks5));
        assert!("socks4".parse::<ProxyType>().is_err());
    }

    #[test]
    fn test_anonymity_filter() {
        assert!(AnonymityFilter::All.accepts(AnonymityLevel::Transparent));
        assert!(AnonymityFilter::Anonymous.accepts(AnonymityLevel::Elite));
        assert!(!AnonymityFilter::Anonymous.accepts(AnonymityLevel::Transparent));
        assert!(AnonymityFilter::Elite.accepts(AnonymityLevel::Elite));
        assert!(!AnonymityFilter::Elite.accepts(AnonymityLevel::Anonymous));
    }

    #[test]
    fn test_validated_proxy_starts_clean() {
        let proxy = ValidatedProxy::new(
            ProxyCandidate::new("10.0.0.1", 8080, ProxyType::Http),
            50,
            AnonymityLevel::Elite,
        );
        assert_eq!(proxy.consecutive_failures, 0);
        assert_eq!(proxy.to_string(), "http://10.0.0.1:8080 (50ms, elite)");
    }
}
