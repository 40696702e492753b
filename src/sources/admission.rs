//! Admission filter between source parsing and the store

use std::sync::Arc;

use tracing::debug;

use super::geo::GeoLookup;
use crate::error::{PoolError, Result};
use crate::models::{Candidate, ProxyKey, ProxyRecord};

/// Turns raw candidates into records fit for the pool
#[derive(Clone)]
pub struct AdmissionFilter {
    geo: Arc<dyn GeoLookup>,
    home_country: String,
    restrict_to_home: bool,
}

impl AdmissionFilter {
    pub fn new(geo: Arc<dyn GeoLookup>, home_country: &str, restrict_to_home: bool) -> Self {
        Self {
            geo,
            home_country: home_country.to_lowercase(),
            restrict_to_home,
        }
    }

    /// Validate the address, resolve the country and build the record.
    ///
    /// Home-country results are always kept. Other countries are rejected only
    /// when the filter is restricted to the home country.
    pub fn admit(&self, candidate: &Candidate) -> Result<ProxyRecord> {
        let key = ProxyKey::from_parts(&candidate.ip, &candidate.port)?;
        let geo = self.geo.lookup(key.ip)?;

        if geo.country != self.home_country && self.restrict_to_home {
            debug!(
                proxy = %key,
                country = %geo.country,
                "Rejected candidate outside home country"
            );
            return Err(PoolError::InvalidProxyAddress(format!(
                "{} is outside {}",
                key, self.home_country
            )));
        }

        Ok(ProxyRecord::new(key, &candidate.source).with_country(geo.country))
    }
}
