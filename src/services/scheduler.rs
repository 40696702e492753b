//! Source scheduler
//!
//! Every registered source gets its own task ticking on its own cadence, so a
//! slow or failing source never delays another.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cron::Schedule;
use tokio::sync::watch;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn, Instrument};

use crate::error::{PoolError, Result};
use crate::sources::{Crawler, Source};

/// How often a source runs
#[derive(Debug, Clone)]
pub enum Cadence {
    /// `@every <duration>`: a fixed period starting at registration
    Every(Duration),
    /// Cron field expression or macro such as `@hourly`
    Cron(Box<Schedule>),
}

impl Cadence {
    /// Time from now until the next scheduled run
    pub fn next_delay(&self) -> Option<Duration> {
        match self {
            Cadence::Every(period) => Some(*period),
            Cadence::Cron(schedule) => {
                let now = Utc::now();
                let next = schedule.after(&now).next()?;
                (next - now).to_std().ok()
            }
        }
    }
}

impl FromStr for Cadence {
    type Err = PoolError;

    /// Accepts `@every <duration>`, cron macros and 5, 6 or 7 field expressions.
    /// Five fields are read as minute-level cron with seconds pinned to zero.
    fn from_str(spec: &str) -> Result<Self> {
        let spec = spec.trim();
        let invalid = |reason: String| PoolError::InvalidCadence(format!("{}: {}", spec, reason));

        if let Some(body) = spec.strip_prefix("@every") {
            let period = humantime::parse_duration(body.trim()).map_err(|e| invalid(e.to_string()))?;
            if period.is_zero() {
                return Err(invalid("zero period".into()));
            }
            return Ok(Cadence::Every(period));
        }

        let expression = if spec.split_whitespace().count() == 5 {
            format!("0 {}", spec)
        } else {
            spec.to_string()
        };
        let schedule = Schedule::from_str(&expression).map_err(|e| invalid(e.to_string()))?;
        if schedule.upcoming(Utc).next().is_none() {
            return Err(invalid("never fires".into()));
        }
        Ok(Cadence::Cron(Box::new(schedule)))
    }
}

struct Entry {
    source: Arc<dyn Source>,
    cadence: Cadence,
}

/// Runs every registered source on its cadence
pub struct Scheduler {
    crawler: Crawler,
    entries: BTreeMap<&'static str, Entry>,
}

impl Scheduler {
    pub fn new(crawler: Crawler) -> Self {
        Self {
            crawler,
            entries: BTreeMap::new(),
        }
    }

    /// Register a source; an invalid cadence rejects only this source
    pub fn register(&mut self, source: Arc<dyn Source>) -> Result<()> {
        let cadence: Cadence = source.cron_spec().parse()?;
        let name = source.name();

        if self.entries.insert(name, Entry { source, cadence: cadence.clone() }).is_some() {
            warn!(source = name, "Source registered twice, keeping the latest");
        }
        info!(source = name, cadence = ?cadence, "Registered source");
        Ok(())
    }

    /// Register many sources, logging the ones that fail
    pub fn register_all(&mut self, sources: impl IntoIterator<Item = Arc<dyn Source>>) {
        for source in sources {
            let name = source.name();
            if let Err(e) = self.register(source) {
                error!(source = name, error = %e, "Source rejected");
            }
        }
    }

    pub fn sources(&self) -> Vec<&'static str> {
        self.entries.keys().copied().collect()
    }

    /// Spawn one task per source and wait for all of them to stop
    #[instrument(skip(self, shutdown))]
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        info!("Starting scheduler with {} sources", self.entries.len());

        let tasks: Vec<_> = self
            .entries
            .into_values()
            .map(|entry| {
                let crawler = self.crawler.clone();
                let shutdown = shutdown.clone();
                let span = tracing::info_span!("source", name = entry.source.name());
                tokio::spawn(run_source(entry, crawler, shutdown).instrument(span))
            })
            .collect();

        for task in tasks {
            if let Err(e) = task.await {
                error!("Source task panicked: {}", e);
            }
        }

        info!("Scheduler stopped");
    }
}

async fn run_source(entry: Entry, crawler: Crawler, shutdown: watch::Receiver<bool>) {
    match entry.cadence {
        Cadence::Every(period) => run_every(&*entry.source, &crawler, period, shutdown).await,
        Cadence::Cron(_) => run_cron(&*entry.source, &crawler, &entry.cadence, shutdown).await,
    }
}

async fn run_every(
    source: &dyn Source,
    crawler: &Crawler,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                source.run(crawler).await;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

async fn run_cron(
    source: &dyn Source,
    crawler: &Crawler,
    cadence: &Cadence,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let Some(delay) = cadence.next_delay() else {
            warn!("Schedule has no upcoming runs");
            break;
        };
        debug!(delay_secs = delay.as_secs(), "Waiting for next run");

        tokio::select! {
            _ = sleep(delay) => {
                source.run(crawler).await;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Candidate;
    use crate::sources::{registry, AdmissionFilter, UnresolvedGeo};
    use crate::store::MemoryStore;
    use tokio::sync::Notify;

    #[test]
    fn test_every_cadences() {
        let period = |s: &str| match s.parse::<Cadence>().unwrap() {
            Cadence::Every(period) => period.as_secs(),
            other => panic!("{:?} parsed as {:?}", s, other),
        };

        assert_eq!(period("@every 5m"), 300);
        assert_eq!(period("@every 30s"), 30);
        assert_eq!(period("@every 1h30m"), 5400);
        assert_eq!(period("  @every 2h  "), 7200);
    }

    #[test]
    fn test_cron_cadences() {
        for spec in ["@hourly", "@daily", "*/5 * * * *", "0 */10 * * * *", "0 0 3 * * Mon-Fri"] {
            let cadence: Cadence = spec.parse().unwrap();
            assert!(matches!(cadence, Cadence::Cron(_)), "{}", spec);
            assert!(cadence.next_delay().is_some(), "{}", spec);
        }

        // Every five minutes is never more than five minutes away.
        let delay = "*/5 * * * *".parse::<Cadence>().unwrap().next_delay().unwrap();
        assert!(delay <= Duration::from_secs(300));
    }

    #[test]
    fn test_invalid_cadences() {
        for spec in [
            "",
            "@every",
            "@every 5",
            "@every 0s",
            "@every m",
            "*/5 * *",
            "61 * * * *",
            "every now and then",
        ] {
            assert!(
                matches!(spec.parse::<Cadence>(), Err(PoolError::InvalidCadence(_))),
                "{:?} should be rejected",
                spec
            );
        }
    }

    struct BadCadence;

    impl Source for BadCadence {
        fn name(&self) -> &'static str {
            "bad"
        }

        fn start_urls(&self) -> &[&'static str] {
            &[]
        }

        fn referer(&self) -> &'static str {
            ""
        }

        fn cron_spec(&self) -> &'static str {
            "every now and then"
        }

        fn parse(&self, _body: &str) -> Vec<Candidate> {
            Vec::new()
        }
    }

    fn crawler() -> Crawler {
        let admission = AdmissionFilter::new(Arc::new(UnresolvedGeo), "cn", false);
        Crawler::new(
            Arc::new(MemoryStore::default()),
            admission,
            Arc::new(Notify::new()),
            Duration::from_secs(1),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_invalid_source_does_not_affect_others() {
        let mut scheduler = Scheduler::new(crawler());
        let mut sources = registry();
        sources.push(Arc::new(BadCadence));

        scheduler.register_all(sources);

        assert_eq!(scheduler.sources(), vec!["clarketm", "speedx", "xseo"]);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let scheduler = Scheduler::new(crawler());
        let (tx, rx) = watch::channel(false);

        let task = tokio::spawn(scheduler.run(rx));
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
