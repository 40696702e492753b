use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

use serde::{Deserialize, Serialize};

use crate::error::{PoolError, Result};

/// Lowest score a stored record can carry
pub const MIN_SCORE: i32 = 0;

/// Highest score a stored record can carry
pub const MAX_SCORE: i32 = 100;

/// Score given to a freshly admitted candidate
pub const DEFAULT_INITIAL_SCORE: u8 = 10;

/// Proxy transport kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Schema {
    #[default]
    Http,
    Https,
    Socks4,
    Socks5,
}

impl Schema {
    pub fn as_str(&self) -> &'static str {
        match self {
            Schema::Http => "http",
            Schema::Https => "https",
            Schema::Socks4 => "socks4",
            Schema::Socks5 => "socks5",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "http" => Some(Schema::Http),
            "https" => Some(Schema::Https),
            "socks4" => Some(Schema::Socks4),
            "socks5" => Some(Schema::Socks5),
            _ => None,
        }
    }

    pub fn is_socks(&self) -> bool {
        matches!(self, Schema::Socks4 | Schema::Socks5)
    }

    pub fn is_http(&self) -> bool {
        matches!(self, Schema::Http | Schema::Https)
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Identity of a pool member: `ip:port`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProxyKey {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl ProxyKey {
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self { ip, port }
    }

    /// Parse an `ip:port` pair. Port 0 is rejected.
    pub fn parse(s: &str) -> Result<Self> {
        let (ip, port) = s
            .rsplit_once(':')
            .ok_or_else(|| PoolError::InvalidProxyAddress(s.to_string()))?;
        Self::from_parts(ip, port)
    }

    /// Build a key from separate ip and port strings
    pub fn from_parts(ip: &str, port: &str) -> Result<Self> {
        let ip: Ipv4Addr = ip
            .parse()
            .map_err(|_| PoolError::InvalidProxyAddress(format!("not an IPv4 address: {}", ip)))?;
        let port: u16 = port
            .parse()
            .map_err(|_| PoolError::InvalidProxyAddress(format!("invalid port: {}", port)))?;
        if port == 0 {
            return Err(PoolError::InvalidProxyAddress("port must be 1-65535".into()));
        }
        Ok(Self { ip, port })
    }

    pub fn socket_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.ip, self.port)
    }
}

impl fmt::Display for ProxyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// A scored pool member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyRecord {
    pub ip: Ipv4Addr,
    pub port: u16,
    pub schema: Schema,
    pub country: String,
    pub source: String,
    pub score: u8,
}

impl ProxyRecord {
    pub fn new(key: ProxyKey, source: impl Into<String>) -> Self {
        Self {
            ip: key.ip,
            port: key.port,
            schema: Schema::default(),
            country: String::new(),
            source: source.into(),
            score: DEFAULT_INITIAL_SCORE,
        }
    }

    pub fn key(&self) -> ProxyKey {
        ProxyKey::new(self.ip, self.port)
    }

    /// `ip:port` address used for dialing
    pub fn address(&self) -> String {
        self.key().to_string()
    }

    /// Proxy URL understood by HTTP clients
    pub fn url(&self) -> String {
        let scheme = match self.schema {
            Schema::Http | Schema::Https => "http",
            Schema::Socks4 => "socks4",
            Schema::Socks5 => "socks5",
        };
        format!("{}://{}:{}", scheme, self.ip, self.port)
    }

    pub fn with_schema(mut self, schema: Schema) -> Self {
        self.schema = schema;
        self
    }

    pub fn with_country(mut self, country: impl Into<String>) -> Self {
        self.country = country.into();
        self
    }

    pub fn with_score(mut self, score: u8) -> Self {
        self.score = score.min(MAX_SCORE as u8);
        self
    }
}

/// Unvalidated `ip:port` pair extracted by a source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub ip: String,
    pub port: String,
    pub source: String,
}

impl Candidate {
    pub fn new(ip: impl Into<String>, port: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            port: port.into(),
            source: source.into(),
        }
    }

    /// Split a matched `ip:port` token. Returns `None` without a colon.
    pub fn from_pair(pair: &str, source: &str) -> Option<Self> {
        let (ip, port) = pair.split_once(':')?;
        Some(Self::new(ip, port, source))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> ProxyKey {
        ProxyKey::parse(s).unwrap()
    }

    #[test]
    fn test_schema_parsing_and_helpers() {
        assert_eq!(Schema::from_str("HTTP"), Some(Schema::Http));
        assert_eq!(Schema::from_str("https"), Some(Schema::Https));
        assert_eq!(Schema::from_str("Socks5"), Some(Schema::Socks5));
        assert_eq!(Schema::from_str("socks4a"), None);

        assert!(Schema::Socks4.is_socks());
        assert!(!Schema::Https.is_socks());
        assert!(Schema::Https.is_http());

        assert_eq!(Schema::Socks4.to_string(), "socks4");
    }

    #[test]
    fn test_proxy_key_parsing() {
        let k = key("1.2.3.4:8080");
        assert_eq!(k.ip, Ipv4Addr::new(1, 2, 3, 4));
        assert_eq!(k.port, 8080);
        assert_eq!(k.to_string(), "1.2.3.4:8080");

        assert!(ProxyKey::parse("1.2.3.4").is_err());
        assert!(ProxyKey::parse("1.2.3:80").is_err());
        assert!(ProxyKey::parse("256.1.1.1:80").is_err());
        assert!(ProxyKey::parse("1.2.3.4:0").is_err());
        assert!(ProxyKey::parse("1.2.3.4:65536").is_err());
        assert!(ProxyKey::parse("::1:80").is_err());
    }

    #[test]
    fn test_record_defaults_and_url() {
        let record = ProxyRecord::new(key("1.2.3.4:1234"), "clarketm");
        assert_eq!(record.schema, Schema::Http);
        assert_eq!(record.score, DEFAULT_INITIAL_SCORE);
        assert_eq!(record.address(), "1.2.3.4:1234");
        assert_eq!(record.url(), "http://1.2.3.4:1234");

        let record = record.with_schema(Schema::Https);
        assert_eq!(record.url(), "http://1.2.3.4:1234");

        let record = record.with_schema(Schema::Socks5);
        assert_eq!(record.url(), "socks5://1.2.3.4:1234");
    }

    #[test]
    fn test_record_score_is_capped() {
        let record = ProxyRecord::new(key("1.2.3.4:1234"), "xseo").with_score(250);
        assert_eq!(record.score, 100);
    }

    #[test]
    fn test_record_serializes_flat_fields() {
        let record = ProxyRecord::new(key("5.6.7.8:3128"), "xseo").with_country("cn");
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["ip"], "5.6.7.8");
        assert_eq!(value["port"], 3128);
        assert_eq!(value["schema"], "http");
        assert_eq!(value["country"], "cn");
        assert_eq!(value["source"], "xseo");
        assert_eq!(value["score"], 10);
    }

    #[test]
    fn test_candidate_from_pair() {
        let c = Candidate::from_pair("1.2.3.4:8080", "clarketm").unwrap();
        assert_eq!(c.ip, "1.2.3.4");
        assert_eq!(c.port, "8080");
        assert_eq!(c.source, "clarketm");
        assert!(Candidate::from_pair("1.2.3.4", "clarketm").is_none());
    }
}
