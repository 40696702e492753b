//! PostgreSQL store backend
//!
//! One row per pool member keyed by the namespaced key. Expired rows are
//! invisible to every read and are reclaimed by `purge_expired`. Score
//! adjustments run inside a transaction: the `UPDATE ... RETURNING` holds the
//! row lock while the evict/clamp decision is applied to the returned value.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, Postgres, Transaction};
use tracing::{debug, warn};

use super::{
    initial_score, parse_pool_key, pool_key, pool_pattern, settle, AddOutcome, ProxyStore,
    ScoreOutcome, Settled, StoreConfig, REDISCOVERY_BONUS,
};
use crate::database::Database;
use crate::error::{PoolError, Result};
use crate::models::{ProxyKey, ProxyRecord, Schema, MAX_SCORE};

const LIVE: &str = "(expires_at IS NULL OR expires_at > NOW())";

#[derive(Debug, FromRow)]
struct ProxyRow {
    key: String,
    ip: String,
    port: i32,
    schema: String,
    country: String,
    source: String,
    score: i32,
}

impl TryFrom<ProxyRow> for ProxyRecord {
    type Error = PoolError;

    fn try_from(row: ProxyRow) -> Result<Self> {
        let malformed = |reason: String| PoolError::MalformedRecord {
            key: row.key.clone(),
            reason,
        };

        let ip = row
            .ip
            .parse()
            .map_err(|_| malformed(format!("ip {:?}", row.ip)))?;
        let port = u16::try_from(row.port)
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| malformed(format!("port {}", row.port)))?;
        let schema =
            Schema::from_str(&row.schema).ok_or_else(|| malformed(format!("schema {:?}", row.schema)))?;
        let score = u8::try_from(row.score)
            .ok()
            .filter(|s| i32::from(*s) <= MAX_SCORE)
            .ok_or_else(|| malformed(format!("score {}", row.score)))?;

        Ok(ProxyRecord {
            ip,
            port,
            schema,
            country: row.country,
            source: row.source,
            score,
        })
    }
}

/// Store backed by the `proxy_pool` table
#[derive(Clone)]
pub struct PgStore {
    db: Database,
    prefix: String,
    default_ttl: Option<Duration>,
}

impl PgStore {
    pub fn new(db: &Database, config: StoreConfig) -> Self {
        Self {
            db: db.clone(),
            prefix: config.prefix,
            default_ttl: config.default_ttl,
        }
    }

    fn full_key(&self, key: ProxyKey) -> String {
        pool_key(&self.prefix, key)
    }

    fn expiry(&self) -> Option<DateTime<Utc>> {
        self.default_ttl
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .map(|ttl| Utc::now() + ttl)
    }

    /// Add `delta` to a live row and settle it, all under the row lock of `tx`
    async fn apply_delta(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        full_key: &str,
        delta: i32,
    ) -> Result<Settled> {
        let raw: Option<i32> = sqlx::query_scalar(&format!(
            "UPDATE proxy_pool SET score = score + $2 WHERE key = $1 AND {} RETURNING score",
            LIVE
        ))
        .bind(full_key)
        .bind(delta)
        .fetch_optional(&mut **tx)
        .await?;

        let Some(raw) = raw else {
            return Err(PoolError::ProxyNotFound {
                key: full_key.to_string(),
            });
        };

        let settled = settle(raw);
        match settled {
            Settled::Evict => {
                sqlx::query("DELETE FROM proxy_pool WHERE key = $1")
                    .bind(full_key)
                    .execute(&mut **tx)
                    .await?;
            }
            Settled::Saturate => {
                sqlx::query("UPDATE proxy_pool SET score = $2, expires_at = $3 WHERE key = $1")
                    .bind(full_key)
                    .bind(MAX_SCORE)
                    .bind(self.expiry())
                    .execute(&mut **tx)
                    .await?;
            }
            Settled::Keep(_) => {}
        }

        Ok(settled)
    }

    fn decode_rows(rows: Vec<ProxyRow>) -> Vec<ProxyRecord> {
        rows.into_iter()
            .filter_map(|row| match ProxyRecord::try_from(row) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(error = %e, "Skipping malformed pool entry");
                    None
                }
            })
            .collect()
    }
}

#[async_trait]
impl ProxyStore for PgStore {
    fn prefix(&self) -> &str {
        &self.prefix
    }

    async fn add(&self, record: &ProxyRecord) -> Result<AddOutcome> {
        let full_key = self.full_key(record.key());
        let mut tx = self.db.pool().begin().await?;

        // An expired row that was not purged yet must not block re-creation.
        sqlx::query("DELETE FROM proxy_pool WHERE key = $1 AND expires_at <= NOW()")
            .bind(&full_key)
            .execute(&mut *tx)
            .await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO proxy_pool (key, ip, port, schema, country, source, score, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (key) DO NOTHING
            "#,
        )
        .bind(&full_key)
        .bind(record.ip.to_string())
        .bind(i32::from(record.port))
        .bind(record.schema.as_str())
        .bind(&record.country)
        .bind(&record.source)
        .bind(i32::from(initial_score(record)))
        .bind(self.expiry())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 1 {
            tx.commit().await?;
            debug!(key = %full_key, "Created pool entry");
            return Ok(AddOutcome::Created);
        }

        let outcome = match self.apply_delta(&mut tx, &full_key, REDISCOVERY_BONUS).await {
            Ok(Settled::Evict) => ScoreOutcome::Evicted,
            Ok(Settled::Saturate) => ScoreOutcome::Saturated,
            Ok(Settled::Keep(score)) => {
                sqlx::query("UPDATE proxy_pool SET expires_at = $2 WHERE key = $1")
                    .bind(&full_key)
                    .bind(self.expiry())
                    .execute(&mut *tx)
                    .await?;
                ScoreOutcome::Updated(score)
            }
            Err(PoolError::ProxyNotFound { .. }) => ScoreOutcome::Missing,
            Err(e) => return Err(e),
        };
        tx.commit().await?;

        Ok(AddOutcome::Rediscovered(outcome))
    }

    async fn adjust_score(&self, key: ProxyKey, delta: i32) -> Result<ScoreOutcome> {
        let full_key = self.full_key(key);
        let mut tx = self.db.pool().begin().await?;

        let outcome = match self.apply_delta(&mut tx, &full_key, delta).await {
            Ok(Settled::Evict) => ScoreOutcome::Evicted,
            Ok(Settled::Saturate) => ScoreOutcome::Saturated,
            Ok(Settled::Keep(score)) => ScoreOutcome::Updated(score),
            Err(PoolError::ProxyNotFound { .. }) => ScoreOutcome::Missing,
            Err(e) => return Err(e),
        };
        tx.commit().await?;

        Ok(outcome)
    }

    async fn exists(&self, key: ProxyKey) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(&format!(
            "SELECT EXISTS(SELECT 1 FROM proxy_pool WHERE key = $1 AND {})",
            LIVE
        ))
        .bind(self.full_key(key))
        .fetch_one(self.db.pool())
        .await?;

        Ok(exists)
    }

    async fn remove(&self, key: ProxyKey) -> Result<bool> {
        let was_live: Option<bool> = sqlx::query_scalar(&format!(
            "DELETE FROM proxy_pool WHERE key = $1 RETURNING {}",
            LIVE
        ))
        .bind(self.full_key(key))
        .fetch_optional(self.db.pool())
        .await?;

        Ok(was_live.unwrap_or(false))
    }

    async fn get(&self, key: ProxyKey) -> Result<Option<ProxyRecord>> {
        let row = sqlx::query_as::<_, ProxyRow>(&format!(
            r#"
            SELECT key, ip, port, schema, country, source, score
            FROM proxy_pool
            WHERE key = $1 AND {}
            "#,
            LIVE
        ))
        .bind(self.full_key(key))
        .fetch_optional(self.db.pool())
        .await?;

        Ok(row.and_then(|row| Self::decode_rows(vec![row]).pop()))
    }

    async fn keys(&self) -> Result<Vec<ProxyKey>> {
        let keys: Vec<String> = sqlx::query_scalar(&format!(
            "SELECT key FROM proxy_pool WHERE starts_with(key, $1) AND {}",
            LIVE
        ))
        .bind(pool_pattern(&self.prefix))
        .fetch_all(self.db.pool())
        .await?;

        Ok(keys
            .iter()
            .filter_map(|full| {
                let parsed = parse_pool_key(&self.prefix, full);
                if parsed.is_none() {
                    warn!(key = %full, "Skipping malformed pool key");
                }
                parsed
            })
            .collect())
    }

    async fn get_all(&self) -> Result<Vec<ProxyRecord>> {
        let rows = sqlx::query_as::<_, ProxyRow>(&format!(
            r#"
            SELECT key, ip, port, schema, country, source, score
            FROM proxy_pool
            WHERE starts_with(key, $1) AND {}
            ORDER BY key
            "#,
            LIVE
        ))
        .bind(pool_pattern(&self.prefix))
        .fetch_all(self.db.pool())
        .await?;

        Ok(Self::decode_rows(rows))
    }

    async fn len(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM proxy_pool WHERE starts_with(key, $1) AND {}",
            LIVE
        ))
        .bind(pool_pattern(&self.prefix))
        .fetch_one(self.db.pool())
        .await?;

        Ok(count.max(0) as usize)
    }

    async fn update_schema(&self, key: ProxyKey, schema: Schema) -> Result<()> {
        let updated = sqlx::query(&format!(
            "UPDATE proxy_pool SET schema = $2 WHERE key = $1 AND {}",
            LIVE
        ))
        .bind(self.full_key(key))
        .bind(schema.as_str())
        .execute(self.db.pool())
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(PoolError::ProxyNotFound {
                key: key.to_string(),
            });
        }
        Ok(())
    }

    async fn ttl(&self, key: ProxyKey) -> Result<Option<Duration>> {
        let expires_at: Option<Option<DateTime<Utc>>> = sqlx::query_scalar(&format!(
            "SELECT expires_at FROM proxy_pool WHERE key = $1 AND {}",
            LIVE
        ))
        .bind(self.full_key(key))
        .fetch_optional(self.db.pool())
        .await?;

        Ok(expires_at
            .flatten()
            .and_then(|at| (at - Utc::now()).to_std().ok()))
    }

    async fn purge_expired(&self) -> Result<usize> {
        let purged = sqlx::query(
            "DELETE FROM proxy_pool WHERE starts_with(key, $1) AND expires_at <= NOW()",
        )
        .bind(pool_pattern(&self.prefix))
        .execute(self.db.pool())
        .await?
        .rows_affected();

        Ok(purged as usize)
    }

    async fn ping(&self) -> Result<()> {
        let latency = self
            .db
            .health_check()
            .await
            .map_err(|e| PoolError::StoreUnavailable(e.to_string()))?;
        debug!(latency_ms = latency.as_millis() as u64, "Store ping");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> ProxyRow {
        ProxyRow {
            key: "proxy_pool:list:1.2.3.4:8080".to_string(),
            ip: "1.2.3.4".to_string(),
            port: 8080,
            schema: "HTTPS".to_string(),
            country: "cn".to_string(),
            source: "xseo".to_string(),
            score: 55,
        }
    }

    #[test]
    fn test_row_decodes_into_record() {
        let record = ProxyRecord::try_from(row()).unwrap();
        assert_eq!(record.address(), "1.2.3.4:8080");
        assert_eq!(record.schema, Schema::Https);
        assert_eq!(record.score, 55);
    }

    #[test]
    fn test_malformed_rows_are_rejected() {
        let bad_ip = ProxyRow {
            ip: "::1".to_string(),
            ..row()
        };
        let bad_port = ProxyRow { port: 70000, ..row() };
        let bad_schema = ProxyRow {
            schema: "ftp".to_string(),
            ..row()
        };
        let bad_score = ProxyRow { score: 101, ..row() };

        for bad in [bad_ip, bad_port, bad_schema, bad_score] {
            assert!(matches!(
                ProxyRecord::try_from(bad),
                Err(PoolError::MalformedRecord { .. })
            ));
        }
    }

    #[test]
    fn test_decode_rows_skips_malformed() {
        let rows = vec![
            row(),
            ProxyRow {
                ip: "not-an-ip".to_string(),
                ..row()
            },
        ];
        assert_eq!(PgStore::decode_rows(rows).len(), 1);
    }
}
