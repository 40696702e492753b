//! Proxy sources
//!
//! A source names its start pages, the referer to send, how often it runs and
//! how to pull `ip:port` candidates out of a page body. Crawling, admission and
//! storage are shared by every source through [`Crawler`].

pub mod admission;
pub mod crawler;
pub mod geo;

mod clarketm;
mod speedx;
mod xseo;

pub use admission::AdmissionFilter;
pub use clarketm::Clarketm;
pub use crawler::{CrawlReport, Crawler};
pub use geo::{GeoInfo, GeoLookup, MaxMindGeo, UnresolvedGeo};
pub use speedx::SpeedX;
pub use xseo::Xseo;

use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::Candidate;

/// `ip:port` tokens anywhere in a body
static PROXY_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}):(\d{1,5})\b")
        .expect("Invalid ip:port regex")
});

/// Every `ip:port` token of `body`, attributed to `source`
pub fn extract_candidates(body: &str, source: &str) -> Vec<Candidate> {
    PROXY_REGEX
        .find_iter(body)
        .filter_map(|m| Candidate::from_pair(m.as_str(), source))
        .collect()
}

/// Capability contract of a proxy source
#[async_trait]
pub trait Source: Send + Sync {
    fn name(&self) -> &'static str;

    fn start_urls(&self) -> &[&'static str];

    fn referer(&self) -> &'static str;

    /// Cron-style cadence, e.g. `@every 5m`
    fn cron_spec(&self) -> &'static str;

    fn parse(&self, body: &str) -> Vec<Candidate>;

    /// One crawl of every start URL
    async fn run(&self, crawler: &Crawler) -> CrawlReport {
        crawler.get_proxy(self).await
    }
}

/// Built-in sources
pub fn registry() -> Vec<Arc<dyn Source>> {
    vec![Arc::new(Clarketm), Arc::new(Xseo), Arc::new(SpeedX)]
}
