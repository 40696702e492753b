use crate::error::Result;
use sqlx::{Executor, PgPool};
use tracing::info;

/// Apply every pending migration in version order
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    create_migrations_table(pool).await?;

    for (version, name, sql) in get_migrations() {
        if is_migration_applied(pool, version).await? {
            continue;
        }

        info!(version = version, name = name, "Applying migration");

        // Plain string execution allows several statements per migration.
        pool.execute(sql).await?;
        record_migration(pool, version, name).await?;

        info!(version = version, name = name, "Migration applied successfully");
    }

    Ok(())
}

async fn create_migrations_table(pool: &PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name VARCHAR(255) NOT NULL,
            applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn is_migration_applied(pool: &PgPool, version: i32) -> Result<bool> {
    let count = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM schema_migrations WHERE version = $1",
    )
    .bind(version)
    .fetch_one(pool)
    .await?;

    Ok(count > 0)
}

async fn record_migration(pool: &PgPool, version: i32, name: &str) -> Result<()> {
    sqlx::query("INSERT INTO schema_migrations (version, name) VALUES ($1, $2)")
        .bind(version)
        .bind(name)
        .execute(pool)
        .await?;

    Ok(())
}

fn get_migrations() -> Vec<(i32, &'static str, &'static str)> {
    vec![
        (1, "proxy_pool_table", MIGRATION_001_PROXY_POOL),
        (2, "proxy_pool_indexes", MIGRATION_002_PROXY_POOL_INDEXES),
    ]
}

// Migration 1: one row per pool member, keyed by `<prefix>:list:<ip>:<port>`
const MIGRATION_001_PROXY_POOL: &str = r#"
CREATE TABLE IF NOT EXISTS proxy_pool (
    key TEXT PRIMARY KEY,
    ip VARCHAR(15) NOT NULL,
    port INTEGER NOT NULL,
    schema VARCHAR(10) NOT NULL DEFAULT 'http',
    country VARCHAR(32) NOT NULL DEFAULT '',
    source VARCHAR(64) NOT NULL DEFAULT '',
    score INTEGER NOT NULL DEFAULT 10,
    expires_at TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
"#;

// Migration 2: expiry sweeps and prefix scans
const MIGRATION_002_PROXY_POOL_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_proxy_pool_expires_at ON proxy_pool(expires_at)
    WHERE expires_at IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_proxy_pool_key_prefix ON proxy_pool(key text_pattern_ops);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_versions_are_ascending_and_unique() {
        let versions: Vec<i32> = get_migrations().iter().map(|(v, _, _)| *v).collect();
        let mut sorted = versions.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(versions, sorted);
    }

    #[test]
    fn test_pool_table_has_store_columns() {
        for column in ["key", "ip", "port", "schema", "country", "source", "score", "expires_at"] {
            assert!(MIGRATION_001_PROXY_POOL.contains(column), "missing {}", column);
        }
    }
}
