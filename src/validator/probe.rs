//! Reachability probes through a pool member

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, Proxy};
use tracing::debug;

use crate::error::{PoolError, Result};
use crate::models::ProxyRecord;

/// What a probe tries to reach through the proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeTarget {
    /// The plain check URL
    Plain,
    /// The HTTPS check URL, proving the member can tunnel TLS
    Tls,
}

/// Latency of a successful probe
pub type ProbeResult = Result<Duration>;

#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, record: &ProxyRecord, target: ProbeTarget) -> ProbeResult;
}

/// Fetches a known-good URL through the proxy with reqwest
pub struct HttpProber {
    check_url: String,
    https_check_url: String,
    timeout: Duration,
}

impl HttpProber {
    pub fn new(check_url: &str, https_check_url: &str, timeout: Duration) -> Self {
        Self {
            check_url: check_url.to_string(),
            https_check_url: https_check_url.to_string(),
            timeout,
        }
    }

    fn client_for(&self, record: &ProxyRecord) -> Result<Client> {
        let proxy = Proxy::all(record.url())?;
        Ok(Client::builder()
            .proxy(proxy)
            .timeout(self.timeout)
            .connect_timeout(self.timeout)
            .build()?)
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self, record: &ProxyRecord, target: ProbeTarget) -> ProbeResult {
        let url = match target {
            ProbeTarget::Plain => &self.check_url,
            ProbeTarget::Tls => &self.https_check_url,
        };

        let client = self.client_for(record)?;
        let start = Instant::now();
        let response = client.get(url).send().await?;

        if !response.status().is_success() {
            return Err(PoolError::ProbeFailed(format!(
                "{} answered {} for {}",
                record.address(),
                response.status(),
                url
            )));
        }

        let elapsed = start.elapsed();
        debug!(proxy = %record.address(), url = %url, elapsed_ms = elapsed.as_millis() as u64, "Probe succeeded");
        Ok(elapsed)
    }
}
