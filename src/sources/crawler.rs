//! Generic crawl shared by every source

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{REFERER, USER_AGENT};
use reqwest::Client;
use tokio::sync::Notify;
use tracing::{debug, info, instrument, warn};

use super::{AdmissionFilter, Source};
use crate::error::Result;
use crate::store::{AddOutcome, ProxyStore};

/// Default user agent for source requests
const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Counters of one crawl
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrawlReport {
    pub source: String,
    /// Start URLs fetched successfully
    pub pages: usize,
    /// Start URLs that failed to fetch
    pub failed_pages: usize,
    /// Candidates parsed out of the fetched bodies
    pub candidates: usize,
    /// Candidates turned away by the admission filter
    pub rejected: usize,
    /// New records
    pub created: usize,
    /// Records that were already pooled
    pub rediscovered: usize,
}

impl CrawlReport {
    fn new(source: &str) -> Self {
        Self {
            source: source.to_string(),
            ..Default::default()
        }
    }

    fn merge(&mut self, other: CrawlReport) {
        self.pages += other.pages;
        self.failed_pages += other.failed_pages;
        self.candidates += other.candidates;
        self.rejected += other.rejected;
        self.created += other.created;
        self.rediscovered += other.rediscovered;
    }
}

/// Fetches source pages and feeds admitted candidates into the store
#[derive(Clone)]
pub struct Crawler {
    client: Client,
    admission: AdmissionFilter,
    store: Arc<dyn ProxyStore>,
    fresh_wakeup: Arc<Notify>,
}

impl Crawler {
    pub fn new(
        store: Arc<dyn ProxyStore>,
        admission: AdmissionFilter,
        fresh_wakeup: Arc<Notify>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .user_agent(DEFAULT_USER_AGENT)
            .build()?;

        Ok(Self {
            client,
            admission,
            store,
            fresh_wakeup,
        })
    }

    /// Fetch every start URL of `source` and ingest what it lists.
    ///
    /// A failing URL is logged and skipped; the rest of the crawl goes on.
    #[instrument(skip(self, source), fields(source = source.name()))]
    pub async fn get_proxy<S: Source + ?Sized>(&self, source: &S) -> CrawlReport {
        let mut report = CrawlReport::new(source.name());

        for url in source.start_urls() {
            match self.fetch(url, source.referer()).await {
                Ok(body) => {
                    report.pages += 1;
                    report.merge(self.ingest(source, &body).await);
                }
                Err(e) => {
                    report.failed_pages += 1;
                    warn!(url = %url, error = %e, "Failed to fetch source page");
                }
            }
        }

        info!(
            pages = report.pages,
            failed_pages = report.failed_pages,
            candidates = report.candidates,
            created = report.created,
            rediscovered = report.rediscovered,
            rejected = report.rejected,
            "Crawl finished"
        );

        report
    }

    async fn fetch(&self, url: &str, referer: &str) -> Result<String> {
        let response = self
            .client
            .get(url)
            .header(REFERER, referer)
            .header(USER_AGENT, DEFAULT_USER_AGENT)
            .send()
            .await?
            .error_for_status()?;

        Ok(response.text().await?)
    }

    /// Parse a page body, admit the candidates and store the survivors
    pub async fn ingest<S: Source + ?Sized>(&self, source: &S, body: &str) -> CrawlReport {
        let mut report = CrawlReport::new(source.name());
        let candidates = source.parse(body);
        report.candidates = candidates.len();

        for candidate in &candidates {
            let record = match self.admission.admit(candidate) {
                Ok(record) => record,
                Err(e) => {
                    report.rejected += 1;
                    debug!(ip = %candidate.ip, port = %candidate.port, error = %e, "Candidate rejected");
                    continue;
                }
            };

            match self.store.add(&record).await {
                Ok(AddOutcome::Created) => report.created += 1,
                Ok(AddOutcome::Rediscovered(_)) => report.rediscovered += 1,
                Err(e) => warn!(proxy = %record.key(), error = %e, "Failed to store candidate"),
            }
        }

        if report.created > 0 {
            self.fresh_wakeup.notify_one();
        }

        report
    }
}
