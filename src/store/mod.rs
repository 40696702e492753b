//! Scored, TTL-governed proxy store
//!
//! The store is the single source of truth for proxy health. Every mutation is
//! key-scoped and atomic per key; readers work on eventually consistent
//! snapshots. Records live under `<prefix>:list:<ip>:<port>` so several
//! logical pools can share one backing store.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use std::time::Duration;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use tracing::debug;

use crate::error::{PoolError, Result};
use crate::models::{FilterSpec, ProxyKey, ProxyRecord, Schema, MAX_SCORE, MIN_SCORE};

/// Score bonus applied when a source lists a key that is already pooled
pub const REDISCOVERY_BONUS: i32 = 10;

/// How many times `random` re-picks when a key expires under it
const RANDOM_PICK_ATTEMPTS: usize = 5;

/// Store-wide settings shared by every backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Namespace for keys of this pool
    pub prefix: String,
    /// Per-key expiry; `None` disables TTL
    pub default_ttl: Option<Duration>,
}

impl StoreConfig {
    /// A TTL of zero or less disables expiry entirely
    pub fn new(prefix: impl Into<String>, ttl_seconds: i64) -> Self {
        let default_ttl = if ttl_seconds > 0 {
            Some(Duration::from_secs(ttl_seconds as u64))
        } else {
            None
        };
        Self {
            prefix: prefix.into(),
            default_ttl,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::new("proxy_pool", 3600)
    }
}

/// Result of a score adjustment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreOutcome {
    /// New score persisted, TTL untouched
    Updated(u8),
    /// Clamped to the maximum and TTL refreshed
    Saturated,
    /// Score fell to zero or below; the record was deleted
    Evicted,
    /// No live record under the key
    Missing,
}

impl ScoreOutcome {
    /// Score after the adjustment, if the record still exists
    pub fn score(&self) -> Option<u8> {
        match self {
            ScoreOutcome::Updated(s) => Some(*s),
            ScoreOutcome::Saturated => Some(MAX_SCORE as u8),
            ScoreOutcome::Evicted | ScoreOutcome::Missing => None,
        }
    }

    pub fn is_live(&self) -> bool {
        self.score().is_some()
    }
}

/// Result of inserting a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Created,
    Rediscovered(ScoreOutcome),
}

/// What to do with a record after adding a delta to its score
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Settled {
    Evict,
    Saturate,
    Keep(u8),
}

/// Decide the fate of a post-increment score.
pub(crate) fn settle(score: i32) -> Settled {
    if score <= MIN_SCORE {
        Settled::Evict
    } else if score >= MAX_SCORE {
        Settled::Saturate
    } else {
        Settled::Keep(score as u8)
    }
}

/// Initial scores are kept inside (0, 100]
pub(crate) fn initial_score(record: &ProxyRecord) -> u8 {
    record.score.clamp(1, MAX_SCORE as u8)
}

/// Namespace shared by every key of a pool
pub fn pool_pattern(prefix: &str) -> String {
    format!("{}:list:", prefix)
}

/// Full backing-store key for a pool member
pub fn pool_key(prefix: &str, key: ProxyKey) -> String {
    format!("{}{}:{}", pool_pattern(prefix), key.ip, key.port)
}

/// Recover the member key from a full backing-store key
pub fn parse_pool_key(prefix: &str, full: &str) -> Option<ProxyKey> {
    full.strip_prefix(&pool_pattern(prefix))
        .and_then(|rest| ProxyKey::parse(rest).ok())
}

fn pick_random(keys: &[ProxyKey]) -> Option<ProxyKey> {
    keys.choose(&mut rand::thread_rng()).copied()
}

/// Contract every store backend fulfils
#[async_trait]
pub trait ProxyStore: Send + Sync {
    /// Namespace of this pool
    fn prefix(&self) -> &str;

    /// Insert a record, or treat an existing key as a rediscovery
    async fn add(&self, record: &ProxyRecord) -> Result<AddOutcome>;

    /// Atomically add `delta` to the score and evict, clamp or persist
    async fn adjust_score(&self, key: ProxyKey, delta: i32) -> Result<ScoreOutcome>;

    async fn exists(&self, key: ProxyKey) -> Result<bool>;

    /// Delete a record; true when a live record was removed
    async fn remove(&self, key: ProxyKey) -> Result<bool>;

    /// Fetch one live record
    async fn get(&self, key: ProxyKey) -> Result<Option<ProxyRecord>>;

    /// Live keys of the pool
    async fn keys(&self) -> Result<Vec<ProxyKey>>;

    /// Snapshot of every live record; malformed entries are skipped
    async fn get_all(&self) -> Result<Vec<ProxyRecord>>;

    /// Number of live keys
    async fn len(&self) -> Result<usize>;

    async fn update_schema(&self, key: ProxyKey, schema: Schema) -> Result<()>;

    /// Remaining time to live. `Ok(None)` when the key is absent or has no expiry.
    async fn ttl(&self, key: ProxyKey) -> Result<Option<Duration>>;

    /// Physically drop expired entries, returning how many were removed
    async fn purge_expired(&self) -> Result<usize>;

    /// Connectivity test against the backing store
    async fn ping(&self) -> Result<()>;

    /// Records accepted by every predicate of `filter`
    async fn query(&self, filter: &FilterSpec) -> Result<Vec<ProxyRecord>> {
        Ok(filter.apply(self.get_all().await?))
    }

    /// Uniform pick among live keys
    async fn random(&self) -> Result<ProxyRecord> {
        for _ in 0..RANDOM_PICK_ATTEMPTS {
            let keys = self.keys().await?;
            let Some(key) = pick_random(&keys) else {
                return Err(PoolError::NoProxiesAvailable);
            };

            match self.get(key).await? {
                Some(record) => return Ok(record),
                None => debug!(key = %key, "Picked key vanished before fetch, retrying"),
            }
        }

        Err(PoolError::NoProxiesAvailable)
    }
}
