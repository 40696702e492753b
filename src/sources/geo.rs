//! Country lookup for admitted candidates

use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::sync::Arc;

use maxminddb::{geoip2, Reader};
use tracing::info;

use crate::error::{PoolError, Result};

/// Label used when an address has no country on record
pub const UNKNOWN_COUNTRY: &str = "unknown";

/// Location facts the pool cares about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeoInfo {
    /// Lower-case ISO 3166-1 alpha-2 code, or [`UNKNOWN_COUNTRY`]
    pub country: String,
    /// Country name in English
    pub country_name: Option<String>,
}

impl GeoInfo {
    pub fn new(country: &str) -> Self {
        Self {
            country: country.to_lowercase(),
            country_name: None,
        }
    }

    pub fn unknown() -> Self {
        Self::new(UNKNOWN_COUNTRY)
    }
}

/// Resolves an address to its country
pub trait GeoLookup: Send + Sync {
    fn lookup(&self, ip: Ipv4Addr) -> Result<GeoInfo>;
}

/// MaxMind City/Country database reader
#[derive(Clone)]
pub struct MaxMindGeo {
    reader: Arc<Reader<Vec<u8>>>,
}

impl MaxMindGeo {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let reader = Reader::open_readfile(path).map_err(|e| {
            PoolError::InvalidConfig(format!("cannot open geoip database {}: {}", path.display(), e))
        })?;
        info!(path = %path.display(), "Loaded geoip database");
        Ok(Self {
            reader: Arc::new(reader),
        })
    }
}

impl GeoLookup for MaxMindGeo {
    fn lookup(&self, ip: Ipv4Addr) -> Result<GeoInfo> {
        let found = self
            .reader
            .lookup(IpAddr::V4(ip))
            .map_err(|e| PoolError::GeoLookup(format!("{}: {}", ip, e)))?;

        let city: Option<geoip2::City> = found
            .decode()
            .map_err(|e| PoolError::GeoLookup(format!("{}: {}", ip, e)))?;

        let Some(city) = city else {
            return Ok(GeoInfo::unknown());
        };

        Ok(GeoInfo {
            country: city
                .country
                .iso_code
                .map(str::to_lowercase)
                .unwrap_or_else(|| UNKNOWN_COUNTRY.to_string()),
            country_name: city.country.names.english.map(String::from),
        })
    }
}

/// Fallback when no geoip database is configured
#[derive(Debug, Clone, Copy, Default)]
pub struct UnresolvedGeo;

impl GeoLookup for UnresolvedGeo {
    fn lookup(&self, _ip: Ipv4Addr) -> Result<GeoInfo> {
        Ok(GeoInfo::unknown())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geo_info_lowercases_country() {
        assert_eq!(GeoInfo::new("CN").country, "cn");
        assert_eq!(GeoInfo::unknown().country, UNKNOWN_COUNTRY);
    }

    #[test]
    fn test_unresolved_geo_labels_unknown() {
        let info = UnresolvedGeo.lookup(Ipv4Addr::new(1, 2, 3, 4)).unwrap();
        assert_eq!(info, GeoInfo::unknown());
    }

    #[test]
    fn test_missing_database_is_a_config_error() {
        let err = MaxMindGeo::from_path("/nonexistent/GeoLite2-City.mmdb").err().unwrap();
        assert!(matches!(err, PoolError::InvalidConfig(_)));
    }
}
