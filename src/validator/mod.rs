//! Validator passes over the pool
//!
//! Two classes share one engine. The fresh validator revisits newly admitted
//! or unconfirmed members often and is woken early by admissions; the periodic
//! validator sweeps the whole pool on a slower cadence. Each pass works on a
//! snapshot taken at pass start and probes with bounded concurrency.

pub mod probe;

pub use probe::{HttpProber, ProbeResult, ProbeTarget, Prober};

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{watch, Notify};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::config::ValidatorSettings;
use crate::error::{PoolError, Result};
use crate::models::{ProxyRecord, Schema};
use crate::store::{ProxyStore, ScoreOutcome};

/// Which slice of the pool a validator owns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidatorKind {
    Fresh,
    Periodic,
}

impl ValidatorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidatorKind::Fresh => "fresh",
            ValidatorKind::Periodic => "periodic",
        }
    }
}

/// Validator configuration
#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    /// Interval between passes
    pub interval: Duration,
    /// Timeout for each probe
    pub probe_timeout: Duration,
    /// Concurrent probes per pass
    pub workers: usize,
    /// Fresh validators only look at records scoring below this
    pub fresh_score_ceiling: u8,
    pub success_delta: i32,
    pub failure_delta: i32,
    /// Probe http records over TLS and upgrade them to https on success
    pub detect_schema: bool,
}

impl ValidatorConfig {
    pub fn fresh(settings: &ValidatorSettings) -> Self {
        Self {
            interval: Duration::from_secs(settings.fresh_interval.max(1)),
            detect_schema: true,
            ..Self::periodic(settings)
        }
    }

    pub fn periodic(settings: &ValidatorSettings) -> Self {
        Self {
            interval: Duration::from_secs(settings.periodic_interval.max(1)),
            probe_timeout: Duration::from_secs(settings.timeout.max(1)),
            workers: settings.workers.max(1),
            fresh_score_ceiling: settings.fresh_score_ceiling,
            success_delta: settings.success_delta,
            failure_delta: settings.failure_delta,
            detect_schema: false,
        }
    }
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            probe_timeout: Duration::from_secs(10),
            workers: 20,
            fresh_score_ceiling: 60,
            success_delta: 10,
            failure_delta: -15,
            detect_schema: false,
        }
    }
}

/// Counters of one pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub checked: usize,
    pub passed: usize,
    pub failed: usize,
    pub evicted: usize,
    pub upgraded: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Passed { upgraded: bool },
    Failed { evicted: bool },
}

/// Probes pool members and feeds the outcome back into their scores
pub struct Validator {
    kind: ValidatorKind,
    store: Arc<dyn ProxyStore>,
    prober: Arc<dyn Prober>,
    config: ValidatorConfig,
    wakeup: Option<Arc<Notify>>,
}

impl Validator {
    pub fn new(
        kind: ValidatorKind,
        store: Arc<dyn ProxyStore>,
        prober: Arc<dyn Prober>,
        config: ValidatorConfig,
    ) -> Self {
        Self {
            kind,
            store,
            prober,
            config,
            wakeup: None,
        }
    }

    /// Run an extra pass whenever `notify` fires
    pub fn with_wakeup(mut self, notify: Arc<Notify>) -> Self {
        self.wakeup = Some(notify);
        self
    }

    /// Run passes until shutdown (call in a spawned task)
    #[instrument(skip(self, shutdown), fields(kind = self.kind.as_str()))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting {} validator with {}s interval",
            self.kind.as_str(),
            self.config.interval.as_secs()
        );

        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.logged_pass().await,
                _ = woken(self.wakeup.as_deref()) => {
                    debug!("Woken by admission");
                    self.logged_pass().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("{} validator shutting down", self.kind.as_str());
                        break;
                    }
                }
            }
        }
    }

    async fn logged_pass(&self) {
        if let Err(e) = self.pass().await {
            error!("Validation pass failed: {}", e);
        }
    }

    /// Validate the members this class owns, as of now
    pub async fn pass(&self) -> Result<PassReport> {
        let snapshot: Vec<ProxyRecord> = self
            .store
            .get_all()
            .await?
            .into_iter()
            .filter(|r| self.owns(r))
            .collect();

        if snapshot.is_empty() {
            debug!("Nothing to validate");
            return Ok(PassReport::default());
        }

        info!("Validating {} proxies", snapshot.len());

        let verdicts = futures::stream::iter(snapshot)
            .map(|record| async move { self.check(&record).await })
            .buffer_unordered(self.config.workers.max(1))
            .collect::<Vec<Verdict>>()
            .await;

        let mut report = PassReport {
            checked: verdicts.len(),
            ..Default::default()
        };
        for verdict in verdicts {
            match verdict {
                Verdict::Passed { upgraded } => {
                    report.passed += 1;
                    report.upgraded += usize::from(upgraded);
                }
                Verdict::Failed { evicted } => {
                    report.failed += 1;
                    report.evicted += usize::from(evicted);
                }
            }
        }

        info!(
            passed = report.passed,
            failed = report.failed,
            evicted = report.evicted,
            upgraded = report.upgraded,
            "Validation pass complete"
        );

        Ok(report)
    }

    fn owns(&self, record: &ProxyRecord) -> bool {
        match self.kind {
            ValidatorKind::Fresh => record.score < self.config.fresh_score_ceiling,
            ValidatorKind::Periodic => true,
        }
    }

    #[instrument(skip(self, record), fields(proxy = %record.address()))]
    async fn check(&self, record: &ProxyRecord) -> Verdict {
        let key = record.key();

        if let Err(e) = self.probe(record, ProbeTarget::Plain).await {
            debug!(error = %e, "Probe failed");
            let outcome = self.adjust(record, self.config.failure_delta).await;
            return Verdict::Failed {
                evicted: outcome == Some(ScoreOutcome::Evicted),
            };
        }

        self.adjust(record, self.config.success_delta).await;

        let mut upgraded = false;
        if self.config.detect_schema
            && record.schema == Schema::Http
            && self.probe(record, ProbeTarget::Tls).await.is_ok()
        {
            match self.store.update_schema(key, Schema::Https).await {
                Ok(()) => {
                    debug!("Detected https support");
                    upgraded = true;
                }
                Err(e) => debug!(error = %e, "Schema upgrade skipped"),
            }
        }

        Verdict::Passed { upgraded }
    }

    /// Probe with the configured timeout; a timeout is a failure
    async fn probe(&self, record: &ProxyRecord, target: ProbeTarget) -> ProbeResult {
        match timeout(self.config.probe_timeout, self.prober.probe(record, target)).await {
            Ok(result) => result,
            Err(_) => Err(PoolError::Timeout),
        }
    }

    async fn adjust(&self, record: &ProxyRecord, delta: i32) -> Option<ScoreOutcome> {
        match self.store.adjust_score(record.key(), delta).await {
            Ok(outcome) => {
                debug!(delta, outcome = ?outcome, "Score adjusted");
                Some(outcome)
            }
            Err(e) => {
                warn!(proxy = %record.address(), error = %e, "Failed to adjust score");
                None
            }
        }
    }
}

async fn woken(notify: Option<&Notify>) {
    match notify {
        Some(notify) => notify.notified().await,
        None => std::future::pending().await,
    }
}

/// Handle for stopping validators
pub struct ValidatorHandle {
    shutdown_tx: watch::Sender<bool>,
}

impl ValidatorHandle {
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { shutdown_tx: tx }, rx)
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Default for ValidatorHandle {
    fn default() -> Self {
        Self::new().0
    }
}
