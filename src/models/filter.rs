//! Query filters over pool records
//!
//! Each option maps to a builder that produces a self-contained predicate.
//! Adding a filter is one more row in [`FILTER_OPTIONS`].

use std::fmt;
use std::num::IntErrorKind;
use std::sync::Arc;

use crate::error::{PoolError, Result};
use crate::models::ProxyRecord;

/// A single record predicate
pub type Predicate = Arc<dyn Fn(&ProxyRecord) -> bool + Send + Sync>;

/// Builds a predicate from an option value. `Ok(None)` means "no constraint".
type PredicateBuilder = fn(&str) -> Result<Option<Predicate>>;

const FILTER_OPTIONS: &[(&str, PredicateBuilder)] = &[
    ("schema", schema_filter),
    ("country", country_filter),
    ("source", source_filter),
    ("score", score_filter),
];

fn schema_filter(value: &str) -> Result<Option<Predicate>> {
    let wanted = value.to_lowercase();
    Ok(Some(Arc::new(move |p: &ProxyRecord| {
        p.schema.as_str() == wanted
    })))
}

fn country_filter(value: &str) -> Result<Option<Predicate>> {
    let wanted = value.to_lowercase();
    Ok(Some(Arc::new(move |p: &ProxyRecord| p.country == wanted)))
}

fn source_filter(value: &str) -> Result<Option<Predicate>> {
    let wanted = value.to_lowercase();
    Ok(Some(Arc::new(move |p: &ProxyRecord| {
        p.source.to_lowercase() == wanted
    })))
}

fn score_filter(value: &str) -> Result<Option<Predicate>> {
    match value.parse::<i64>() {
        Ok(min) => Ok(Some(Arc::new(move |p: &ProxyRecord| {
            i64::from(p.score) >= min
        }))),
        // Non-numeric thresholds are treated as absent
        Err(e) if *e.kind() == IntErrorKind::InvalidDigit => Ok(None),
        Err(e) => Err(PoolError::InvalidFilter(format!(
            "score {:?}: {}",
            value, e
        ))),
    }
}

/// AND-composed set of record predicates
#[derive(Clone, Default)]
pub struct FilterSpec {
    predicates: Vec<(&'static str, Predicate)>,
}

impl FilterSpec {
    /// A filter that matches every record
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a filter from option name / value pairs.
    ///
    /// Unknown names and empty values are ignored.
    pub fn from_options<I, K, V>(options: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut predicates = Vec::new();

        for (name, value) in options {
            let (name, value) = (name.as_ref(), value.as_ref());
            if value.is_empty() {
                continue;
            }
            let Some((option, build)) = FILTER_OPTIONS.iter().find(|(n, _)| *n == name) else {
                continue;
            };
            if let Some(predicate) = build(value)? {
                predicates.push((*option, predicate));
            }
        }

        Ok(Self { predicates })
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    pub fn len(&self) -> usize {
        self.predicates.len()
    }

    /// True when every predicate accepts the record
    pub fn matches(&self, record: &ProxyRecord) -> bool {
        self.predicates.iter().all(|(_, p)| p(record))
    }

    /// Keep only matching records
    pub fn apply(&self, records: Vec<ProxyRecord>) -> Vec<ProxyRecord> {
        if self.is_empty() {
            return records;
        }
        records.into_iter().filter(|r| self.matches(r)).collect()
    }
}

impl fmt::Debug for FilterSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.predicates.iter().map(|(name, _)| name))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ProxyKey, Schema};
    use std::collections::HashMap;

    fn record(addr: &str, schema: Schema, country: &str, source: &str, score: u8) -> ProxyRecord {
        ProxyRecord::new(ProxyKey::parse(addr).unwrap(), source)
            .with_schema(schema)
            .with_country(country)
            .with_score(score)
    }

    fn sample() -> Vec<ProxyRecord> {
        vec![
            record("1.1.1.1:80", Schema::Http, "cn", "clarketm", 60),
            record("2.2.2.2:80", Schema::Http, "us", "xseo", 40),
            record("3.3.3.3:443", Schema::Https, "cn", "Clarketm", 90),
            record("4.4.4.4:1080", Schema::Socks5, "de", "speedx", 50),
        ]
    }

    fn keys(records: &[ProxyRecord]) -> Vec<String> {
        records.iter().map(|r| r.address()).collect()
    }

    #[test]
    fn test_empty_options_match_everything() {
        let filter = FilterSpec::from_options(HashMap::<String, String>::new()).unwrap();
        assert!(filter.is_empty());
        assert_eq!(filter.apply(sample()), sample());
    }

    #[test]
    fn test_schema_and_score_compose_with_and() {
        let filter = FilterSpec::from_options([("schema", "HTTP"), ("score", "50")]).unwrap();
        assert_eq!(filter.len(), 2);
        assert_eq!(keys(&filter.apply(sample())), vec!["1.1.1.1:80"]);
    }

    #[test]
    fn test_source_is_case_insensitive() {
        let filter = FilterSpec::from_options([("source", "CLARKETM")]).unwrap();
        assert_eq!(
            keys(&filter.apply(sample())),
            vec!["1.1.1.1:80", "3.3.3.3:443"]
        );
    }

    #[test]
    fn test_country_filter_lowercases_value() {
        let filter = FilterSpec::from_options([("country", "DE")]).unwrap();
        assert_eq!(keys(&filter.apply(sample())), vec!["4.4.4.4:1080"]);
    }

    #[test]
    fn test_unknown_and_empty_options_are_ignored() {
        let filter =
            FilterSpec::from_options([("colour", "blue"), ("schema", ""), ("score", "")]).unwrap();
        assert!(filter.is_empty());
    }

    #[test]
    fn test_non_numeric_score_means_no_threshold() {
        let filter = FilterSpec::from_options([("score", "high")]).unwrap();
        assert!(filter.is_empty());
        assert_eq!(filter.apply(sample()).len(), 4);
    }

    #[test]
    fn test_overflowing_score_is_an_error() {
        let err = FilterSpec::from_options([("score", "99999999999999999999999")]).unwrap_err();
        assert!(matches!(err, PoolError::InvalidFilter(_)));
    }

    #[test]
    fn test_debug_lists_active_options() {
        let filter = FilterSpec::from_options([("schema", "http")]).unwrap();
        assert_eq!(format!("{:?}", filter), "[\"schema\"]");
    }
}
