//! Expiry sweeper
//!
//! Periodically drops expired pool entries so backends without native per-key
//! TTL reclaim their storage. Reads already ignore expired entries; the sweep
//! only reclaims space.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, error, info, instrument};

use crate::error::Result;
use crate::store::ProxyStore;

/// Expiry sweeper configuration
#[derive(Clone)]
pub struct ExpirySweeperConfig {
    /// How often to purge expired entries
    pub check_interval: Duration,
}

impl Default for ExpirySweeperConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(60),
        }
    }
}

/// Expiry sweeper service
pub struct ExpirySweeper {
    store: Arc<dyn ProxyStore>,
    config: ExpirySweeperConfig,
}

impl ExpirySweeper {
    pub fn new(store: Arc<dyn ProxyStore>, config: ExpirySweeperConfig) -> Self {
        Self { store, config }
    }

    /// Run until the shutdown channel flips to true
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting expiry sweeper (interval: {}s)",
            self.config.check_interval.as_secs()
        );

        let mut ticker = interval(self.config.check_interval);
        ticker.tick().await; // Skip immediate tick

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        error!("Expiry sweep failed: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Expiry sweeper shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One purge pass; returns the number of removed entries
    pub async fn sweep(&self) -> Result<usize> {
        let purged = self.store.purge_expired().await?;

        if purged > 0 {
            info!(count = purged, prefix = self.store.prefix(), "Purged expired proxies");
        } else {
            debug!("No expired proxies to purge");
        }

        Ok(purged)
    }
}

/// Handle for stopping the sweeper
pub struct ExpirySweeperHandle {
    shutdown_tx: watch::Sender<bool>,
}

impl ExpirySweeperHandle {
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { shutdown_tx: tx }, rx)
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Default for ExpirySweeperHandle {
    fn default() -> Self {
        Self::new().0
    }
}
