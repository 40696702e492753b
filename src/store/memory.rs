//! In-process store backend
//!
//! Per-key atomicity comes from the shard lock `DashMap` holds while an entry
//! is borrowed, so the read-modify-write of `adjust_score` never interleaves
//! with another writer on the same key.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;

use super::{
    initial_score, parse_pool_key, pool_key, pool_pattern, settle, AddOutcome, ProxyStore,
    ScoreOutcome, Settled, StoreConfig, REDISCOVERY_BONUS,
};
use crate::error::{PoolError, Result};
use crate::models::{ProxyKey, ProxyRecord, Schema, MAX_SCORE};

#[derive(Debug, Clone)]
struct Slot {
    record: ProxyRecord,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// `DashMap`-backed store
#[derive(Clone)]
pub struct MemoryStore {
    prefix: String,
    default_ttl: Option<Duration>,
    entries: Arc<DashMap<String, Slot>>,
}

impl MemoryStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            prefix: config.prefix,
            default_ttl: config.default_ttl,
            entries: Arc::new(DashMap::new()),
        }
    }

    /// Another logical pool over the same backing map
    pub fn partition(&self, prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            default_ttl: self.default_ttl,
            entries: self.entries.clone(),
        }
    }

    fn full_key(&self, key: ProxyKey) -> String {
        pool_key(&self.prefix, key)
    }

    fn expiry(&self) -> Option<Instant> {
        self.default_ttl.map(|ttl| Instant::now() + ttl)
    }

    fn adjust_slot(&self, slot: &mut Slot, delta: i32) -> Settled {
        let settled = settle(i32::from(slot.record.score) + delta);
        match settled {
            Settled::Saturate => {
                slot.record.score = MAX_SCORE as u8;
                slot.expires_at = self.expiry();
            }
            Settled::Keep(score) => slot.record.score = score,
            Settled::Evict => {}
        }
        settled
    }

    fn live_slots(&self) -> Vec<(ProxyKey, ProxyRecord)> {
        let pattern = pool_pattern(&self.prefix);
        let now = Instant::now();

        let mut live: Vec<(ProxyKey, ProxyRecord)> = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(&pattern) && !e.value().is_expired(now))
            .filter_map(|e| {
                let key = parse_pool_key(&self.prefix, e.key())?;
                Some((key, e.value().record.clone()))
            })
            .collect();
        live.sort_by_key(|(key, _)| *key);
        live
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

#[async_trait]
impl ProxyStore for MemoryStore {
    fn prefix(&self) -> &str {
        &self.prefix
    }

    async fn add(&self, record: &ProxyRecord) -> Result<AddOutcome> {
        let now = Instant::now();
        let fresh = Slot {
            record: ProxyRecord {
                score: initial_score(record),
                ..record.clone()
            },
            expires_at: self.expiry(),
        };

        match self.entries.entry(self.full_key(record.key())) {
            Entry::Occupied(mut entry) if !entry.get().is_expired(now) => {
                let outcome = match self.adjust_slot(entry.get_mut(), REDISCOVERY_BONUS) {
                    Settled::Evict => {
                        entry.remove();
                        ScoreOutcome::Evicted
                    }
                    Settled::Saturate => ScoreOutcome::Saturated,
                    Settled::Keep(score) => {
                        entry.get_mut().expires_at = self.expiry();
                        ScoreOutcome::Updated(score)
                    }
                };
                Ok(AddOutcome::Rediscovered(outcome))
            }
            Entry::Occupied(mut entry) => {
                entry.insert(fresh);
                Ok(AddOutcome::Created)
            }
            Entry::Vacant(entry) => {
                entry.insert(fresh);
                Ok(AddOutcome::Created)
            }
        }
    }

    async fn adjust_score(&self, key: ProxyKey, delta: i32) -> Result<ScoreOutcome> {
        let now = Instant::now();

        match self.entries.entry(self.full_key(key)) {
            Entry::Occupied(entry) if entry.get().is_expired(now) => {
                entry.remove();
                Ok(ScoreOutcome::Missing)
            }
            Entry::Occupied(mut entry) => match self.adjust_slot(entry.get_mut(), delta) {
                Settled::Evict => {
                    entry.remove();
                    Ok(ScoreOutcome::Evicted)
                }
                Settled::Saturate => Ok(ScoreOutcome::Saturated),
                Settled::Keep(score) => Ok(ScoreOutcome::Updated(score)),
            },
            Entry::Vacant(_) => Ok(ScoreOutcome::Missing),
        }
    }

    async fn exists(&self, key: ProxyKey) -> Result<bool> {
        let now = Instant::now();
        Ok(self
            .entries
            .get(&self.full_key(key))
            .is_some_and(|slot| !slot.is_expired(now)))
    }

    async fn remove(&self, key: ProxyKey) -> Result<bool> {
        let now = Instant::now();
        Ok(self
            .entries
            .remove(&self.full_key(key))
            .is_some_and(|(_, slot)| !slot.is_expired(now)))
    }

    async fn get(&self, key: ProxyKey) -> Result<Option<ProxyRecord>> {
        let now = Instant::now();
        Ok(self
            .entries
            .get(&self.full_key(key))
            .filter(|slot| !slot.is_expired(now))
            .map(|slot| slot.record.clone()))
    }

    async fn keys(&self) -> Result<Vec<ProxyKey>> {
        Ok(self.live_slots().into_iter().map(|(key, _)| key).collect())
    }

    async fn get_all(&self) -> Result<Vec<ProxyRecord>> {
        Ok(self
            .live_slots()
            .into_iter()
            .map(|(_, record)| record)
            .collect())
    }

    async fn len(&self) -> Result<usize> {
        let pattern = pool_pattern(&self.prefix);
        let now = Instant::now();
        Ok(self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(&pattern) && !e.value().is_expired(now))
            .count())
    }

    async fn update_schema(&self, key: ProxyKey, schema: Schema) -> Result<()> {
        let now = Instant::now();
        match self.entries.get_mut(&self.full_key(key)) {
            Some(mut slot) if !slot.is_expired(now) => {
                slot.record.schema = schema;
                Ok(())
            }
            _ => Err(PoolError::ProxyNotFound {
                key: key.to_string(),
            }),
        }
    }

    async fn ttl(&self, key: ProxyKey) -> Result<Option<Duration>> {
        let now = Instant::now();
        Ok(self
            .entries
            .get(&self.full_key(key))
            .filter(|slot| !slot.is_expired(now))
            .and_then(|slot| slot.expires_at)
            .map(|at| at.saturating_duration_since(now)))
    }

    async fn purge_expired(&self) -> Result<usize> {
        let pattern = pool_pattern(&self.prefix);
        let now = Instant::now();
        let mut purged = 0usize;

        self.entries.retain(|key, slot| {
            let drop = key.starts_with(&pattern) && slot.is_expired(now);
            if drop {
                purged += 1;
            }
            !drop
        });

        Ok(purged)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FilterSpec;
    use tokio::time::advance;

    const TTL: u64 = 600;

    fn store() -> MemoryStore {
        MemoryStore::new(StoreConfig::new("test", TTL as i64))
    }

    fn key(s: &str) -> ProxyKey {
        ProxyKey::parse(s).unwrap()
    }

    fn record(addr: &str, score: u8) -> ProxyRecord {
        ProxyRecord::new(key(addr), "clarketm")
            .with_country("cn")
            .with_score(score)
    }

    #[tokio::test]
    async fn test_add_creates_then_rediscovers() {
        let store = store();
        let r = record("1.2.3.4:8080", 10);

        assert_eq!(store.add(&r).await.unwrap(), AddOutcome::Created);
        assert_eq!(
            store.add(&r.clone().with_schema(Schema::Https)).await.unwrap(),
            AddOutcome::Rediscovered(ScoreOutcome::Updated(20))
        );

        assert_eq!(store.len().await.unwrap(), 1);
        let stored = store.get(r.key()).await.unwrap().unwrap();
        assert_eq!(stored.score, 20);
        assert_eq!(stored.schema, Schema::Http);
    }

    #[tokio::test]
    async fn test_zero_initial_score_is_raised() {
        let store = store();
        let r = record("1.2.3.4:8080", 0);
        store.add(&r).await.unwrap();
        assert_eq!(store.get(r.key()).await.unwrap().unwrap().score, 1);
    }

    #[tokio::test]
    async fn test_score_stays_in_bounds_and_evicts() {
        let store = store();
        let r = record("1.2.3.4:8080", 50);
        store.add(&r).await.unwrap();

        let deltas = [30, 40, -20, 5, -60, 10, -100];
        for delta in deltas {
            let outcome = store.adjust_score(r.key(), delta).await.unwrap();
            if let Some(score) = store.get(r.key()).await.unwrap().map(|p| p.score) {
                assert!((1..=100).contains(&score));
                assert_eq!(outcome.score(), Some(score));
            }
        }

        assert!(!store.exists(r.key()).await.unwrap());
        assert_eq!(
            store.adjust_score(r.key(), 10).await.unwrap(),
            ScoreOutcome::Missing
        );
    }

    #[tokio::test]
    async fn test_adjust_missing_key_does_not_create() {
        let store = store();
        let outcome = store.adjust_score(key("9.9.9.9:80"), 50).await.unwrap();
        assert_eq!(outcome, ScoreOutcome::Missing);
        assert_eq!(store.len().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_saturation_refreshes_ttl() {
        let store = store();
        let r = record("1.2.3.4:8080", 80);
        store.add(&r).await.unwrap();

        advance(Duration::from_secs(400)).await;
        let remaining = store.ttl(r.key()).await.unwrap().unwrap();
        assert_eq!(remaining, Duration::from_secs(TTL - 400));

        // Below the cap the TTL is untouched
        assert_eq!(
            store.adjust_score(r.key(), 10).await.unwrap(),
            ScoreOutcome::Updated(90)
        );
        assert_eq!(
            store.ttl(r.key()).await.unwrap().unwrap(),
            Duration::from_secs(TTL - 400)
        );

        assert_eq!(
            store.adjust_score(r.key(), 15).await.unwrap(),
            ScoreOutcome::Saturated
        );
        assert_eq!(
            store.ttl(r.key()).await.unwrap().unwrap(),
            Duration::from_secs(TTL)
        );
        assert_eq!(store.get(r.key()).await.unwrap().unwrap().score, 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_keys_leave_the_pool() {
        let store = store();
        let stale = record("1.1.1.1:80", 50);
        store.add(&stale).await.unwrap();

        advance(Duration::from_secs(300)).await;
        let fresh = record("2.2.2.2:80", 50);
        store.add(&fresh).await.unwrap();

        advance(Duration::from_secs(301)).await;
        assert!(!store.exists(stale.key()).await.unwrap());
        assert_eq!(store.len().await.unwrap(), 1);

        for _ in 0..20 {
            assert_eq!(store.random().await.unwrap().key(), fresh.key());
        }

        assert_eq!(store.purge_expired().await.unwrap(), 1);
        assert_eq!(store.purge_expired().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rediscovery_after_expiry_recreates() {
        let store = store();
        let r = record("1.1.1.1:80", 50);
        store.add(&r).await.unwrap();

        advance(Duration::from_secs(TTL + 1)).await;
        assert_eq!(store.add(&r).await.unwrap(), AddOutcome::Created);
        assert_eq!(store.get(r.key()).await.unwrap().unwrap().score, 50);
    }

    #[tokio::test]
    async fn test_disabled_ttl_never_expires() {
        let store = MemoryStore::new(StoreConfig::new("test", 0));
        let r = record("1.1.1.1:80", 50);
        store.add(&r).await.unwrap();
        assert_eq!(store.ttl(r.key()).await.unwrap(), None);
        assert!(store.exists(r.key()).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_adjustments_are_not_lost() {
        let store = Arc::new(store());
        let r = record("1.2.3.4:8080", 1);
        store.add(&r).await.unwrap();
        let key = r.key();

        let handles: Vec<_> = (0..60)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.adjust_score(key, 1).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(store.get(key).await.unwrap().unwrap().score, 61);

        let handles: Vec<_> = (0..200)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.adjust_score(key, 1).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(store.get(key).await.unwrap().unwrap().score, 100);
    }

    #[tokio::test]
    async fn test_remove_and_update_schema() {
        let store = store();
        let r = record("1.2.3.4:8080", 10);
        store.add(&r).await.unwrap();

        store.update_schema(r.key(), Schema::Socks5).await.unwrap();
        assert_eq!(
            store.get(r.key()).await.unwrap().unwrap().schema,
            Schema::Socks5
        );

        assert!(store.remove(r.key()).await.unwrap());
        assert!(!store.remove(r.key()).await.unwrap());

        let err = store.update_schema(r.key(), Schema::Https).await.unwrap_err();
        assert!(matches!(err, PoolError::ProxyNotFound { .. }));
    }

    #[tokio::test]
    async fn test_query_composes_filters() {
        let store = store();
        store.add(&record("1.1.1.1:80", 60)).await.unwrap();
        store.add(&record("2.2.2.2:80", 40)).await.unwrap();
        store
            .add(&record("3.3.3.3:443", 90).with_schema(Schema::Https))
            .await
            .unwrap();

        let filter = FilterSpec::from_options([("schema", "http"), ("score", "50")]).unwrap();
        let hits = store.query(&filter).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].address(), "1.1.1.1:80");

        let everything = store.query(&FilterSpec::new()).await.unwrap();
        assert_eq!(everything, store.get_all().await.unwrap());
        assert_eq!(everything.len(), 3);
    }

    #[tokio::test]
    async fn test_random_on_empty_pool() {
        let store = store();
        assert!(matches!(
            store.random().await,
            Err(PoolError::NoProxiesAvailable)
        ));
    }

    #[tokio::test]
    async fn test_partitions_share_backing_but_not_keys() {
        let left = store();
        let right = left.partition("other");
        left.add(&record("1.1.1.1:80", 10)).await.unwrap();
        right.add(&record("2.2.2.2:80", 10)).await.unwrap();
        right.add(&record("3.3.3.3:80", 10)).await.unwrap();

        assert_eq!(left.len().await.unwrap(), 1);
        assert_eq!(right.len().await.unwrap(), 2);
        assert!(!left.exists(key("2.2.2.2:80")).await.unwrap());
        tokio_test::assert_ok!(right.ping().await);
    }
}
