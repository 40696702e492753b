use crate::config::DatabaseConfig;
use crate::error::{PoolError, Result};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgSslMode};
use std::time::{Duration, Instant};
use tracing::info;

/// Connection pool of the PostgreSQL store backend
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
    max_connections: u32,
}

impl Database {
    /// Connect with the configured credentials; failures mean the store is unavailable
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let options = connect_options(config)?;

        info!(
            host = %config.host,
            port = %config.port,
            database = %config.name,
            "Connecting to database"
        );

        let pool = PgPoolOptions::new()
            .min_connections(config.min_connections.min(config.max_connections))
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(30 * 60))
            .max_lifetime(Duration::from_secs(60 * 60))
            .connect_with(options)
            .await
            .map_err(|e| PoolError::StoreUnavailable(e.to_string()))?;

        info!("Database connection pool established");

        Ok(Database {
            pool,
            max_connections: config.max_connections,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Round-trip latency of a trivial query
    pub async fn health_check(&self) -> Result<Duration> {
        let start = Instant::now();
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(start.elapsed())
    }

    pub fn pool_stats(&self) -> PoolStats {
        PoolStats {
            size: self.pool.size(),
            idle: self.pool.num_idle() as u32,
            max: self.max_connections,
        }
    }

    /// Bring the schema up to date
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");
        super::migrations::run_migrations(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }
}

/// Typed connect options; an unknown SSL mode is a configuration error
fn connect_options(config: &DatabaseConfig) -> Result<PgConnectOptions> {
    let ssl_mode: PgSslMode = config.ssl_mode.parse().map_err(|_| {
        PoolError::InvalidConfig(format!("DB_SSLMODE has unknown mode: {}", config.ssl_mode))
    })?;

    Ok(PgConnectOptions::new()
        .host(&config.host)
        .port(config.port)
        .username(&config.user)
        .password(&config.password)
        .database(&config.name)
        .ssl_mode(ssl_mode))
}

/// Pool statistics
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub size: u32,
    pub idle: u32,
    pub max: u32,
}
