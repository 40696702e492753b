use crate::error::{PoolError, Result};
use crate::models::Schema;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Forwarding dispatcher configuration
    pub proxy: ProxyServerConfig,
    /// Query API configuration
    pub api: ApiServerConfig,
    /// Scored store configuration
    pub store: StoreSettings,
    /// PostgreSQL configuration (used by the postgres backend)
    pub database: DatabaseConfig,
    /// Admission and geo lookup
    pub admission: AdmissionConfig,
    /// Validator passes
    pub validator: ValidatorSettings,
    /// Source crawling
    pub crawler: CrawlerConfig,
    /// Which background roles this process runs
    pub roles: RoleConfig,
    /// Expiry sweeper interval
    pub sweep_interval: Duration,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct ProxyServerConfig {
    /// Port for the dispatcher (default: 8000)
    pub port: u16,
    /// Host to bind to (default: 0.0.0.0)
    pub host: String,
    /// Attempts per client request, each with a fresh selection
    pub max_retries: u32,
    /// Upstream connect timeout in seconds
    pub connect_timeout: u64,
    /// Whole-request deadline in seconds
    pub request_timeout: u64,
    /// How pool members are chosen
    pub policy: DispatchPolicy,
    /// Score delta after a successful relay
    pub relay_success: i32,
    /// Score delta after a failed relay
    pub relay_failure: i32,
}

/// Dispatcher selection policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchPolicy {
    /// Uniform pick over the whole pool
    Random,
    /// Uniform pick among records matching the constraints
    Filtered {
        schema: Option<Schema>,
        min_score: Option<u8>,
    },
}

#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// Port for the API server (default: 8001)
    pub port: u16,
    /// Host to bind to (default: 0.0.0.0)
    pub host: String,
    /// Allowed CORS origins (comma-separated, empty = localhost only)
    pub cors_origins: Vec<String>,
}

/// Store backend selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Postgres,
}

impl FromStr for StoreBackend {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(StoreBackend::Memory),
            "postgres" | "postgresql" => Ok(StoreBackend::Postgres),
            other => Err(PoolError::InvalidConfig(format!(
                "STORE_BACKEND must be memory or postgres, got {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub backend: StoreBackend,
    /// Key namespace of this pool
    pub prefix: String,
    /// Per-key TTL in seconds; zero or less disables expiry
    pub ttl_seconds: i64,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Database host
    pub host: String,
    /// Database port
    pub port: u16,
    /// Database user
    pub user: String,
    /// Database password
    pub password: String,
    /// Database name
    pub name: String,
    /// SSL mode (disable, require, prefer)
    pub ssl_mode: String,
    /// Maximum connections in pool
    pub max_connections: u32,
    /// Minimum connections in pool
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    /// MaxMind database; unset means every address resolves to "unknown"
    pub geoip_db_path: Option<String>,
    /// Distinguished home country label, lower-case
    pub home_country: String,
    /// Reject candidates outside the home country
    pub restrict_to_home_country: bool,
}

#[derive(Debug, Clone)]
pub struct ValidatorSettings {
    /// Concurrent probes per pass
    pub workers: usize,
    /// Probe timeout in seconds
    pub timeout: u64,
    /// Fresh pass interval in seconds
    pub fresh_interval: u64,
    /// Periodic pass interval in seconds
    pub periodic_interval: u64,
    /// Records below this score belong to the fresh class
    pub fresh_score_ceiling: u8,
    /// URL fetched through a candidate to prove it works
    pub check_url: String,
    /// HTTPS URL used to detect https capability of http records
    pub https_check_url: String,
    /// Score delta after a successful probe
    pub success_delta: i32,
    /// Score delta after a failed probe
    pub failure_delta: i32,
}

#[derive(Debug, Clone)]
pub struct CrawlerConfig {
    /// Per-request timeout in seconds
    pub timeout: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct RoleConfig {
    /// Runs the source scheduler
    pub manager: bool,
    /// Runs the validators
    pub worker: bool,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            proxy: ProxyServerConfig {
                port: parse_env("PROXY_PORT", "8000", "a valid port number")?,
                host: get_env_or("PROXY_HOST", "0.0.0.0"),
                max_retries: get_env_or("PROXY_MAX_RETRIES", "3").parse().unwrap_or(3),
                connect_timeout: get_env_or("PROXY_CONNECT_TIMEOUT", "10")
                    .parse::<u64>()
                    .unwrap_or(10)
                    .max(1),
                request_timeout: get_env_or("PROXY_REQUEST_TIMEOUT", "30")
                    .parse::<u64>()
                    .unwrap_or(30)
                    .max(1),
                policy: parse_dispatch_policy()?,
                relay_success: 1,
                relay_failure: -10,
            },
            api: ApiServerConfig {
                port: parse_env("API_PORT", "8001", "a valid port number")?,
                host: get_env_or("API_HOST", "0.0.0.0"),
                cors_origins: get_env_or("CORS_ORIGINS", "")
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            },
            store: StoreSettings {
                backend: get_env_or("STORE_BACKEND", "memory").parse()?,
                prefix: get_env_or("POOL_PREFIX", "proxy_pool"),
                ttl_seconds: parse_env("POOL_TTL_SECONDS", "3600", "an integer")?,
            },
            database: DatabaseConfig {
                host: get_env_or("DB_HOST", "localhost"),
                port: parse_env("DB_PORT", "5432", "a valid port number")?,
                user: get_env_or("DB_USER", "rota"),
                password: get_env_or("DB_PASSWORD", "rota_password"),
                name: get_env_or("DB_NAME", "rota_pool"),
                ssl_mode: get_env_or("DB_SSLMODE", "disable"),
                max_connections: parse_env("DB_MAX_CONNECTIONS", "20", "a valid number")?,
                min_connections: parse_env("DB_MIN_CONNECTIONS", "2", "a valid number")?,
            },
            admission: AdmissionConfig {
                geoip_db_path: env::var("GEOIP_DB_PATH")
                    .ok()
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty()),
                home_country: get_env_or("HOME_COUNTRY", "cn").to_lowercase(),
                restrict_to_home_country: parse_env(
                    "RESTRICT_TO_HOME_COUNTRY",
                    "false",
                    "true or false",
                )?,
            },
            validator: ValidatorSettings {
                workers: get_env_or("VALIDATOR_WORKERS", "20")
                    .parse()
                    .unwrap_or(20)
                    .max(1),
                timeout: get_env_or("VALIDATOR_TIMEOUT", "10").parse().unwrap_or(10),
                fresh_interval: get_env_or("VALIDATOR_FRESH_INTERVAL", "10")
                    .parse()
                    .unwrap_or(10),
                periodic_interval: get_env_or("VALIDATOR_PERIODIC_INTERVAL", "300")
                    .parse()
                    .unwrap_or(300),
                fresh_score_ceiling: 60,
                check_url: parse_url("VALIDATOR_CHECK_URL", "http://httpbin.org/ip")?,
                https_check_url: parse_url(
                    "VALIDATOR_HTTPS_CHECK_URL",
                    "https://httpbin.org/ip",
                )?,
                success_delta: 10,
                failure_delta: -15,
            },
            crawler: CrawlerConfig {
                timeout: get_env_or("CRAWLER_TIMEOUT", "15").parse().unwrap_or(15),
            },
            roles: RoleConfig {
                manager: parse_env("ROLE_MANAGER", "true", "true or false")?,
                worker: parse_env("ROLE_WORKER", "true", "true or false")?,
            },
            sweep_interval: Duration::from_secs(
                get_env_or("SWEEP_INTERVAL", "60").parse().unwrap_or(60),
            ),
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "json"),
            },
        })
    }

    /// Get the dispatcher address
    pub fn proxy_addr(&self) -> String {
        format!("{}:{}", self.proxy.host, self.proxy.port)
    }

    /// Get the API server address
    pub fn api_addr(&self) -> String {
        format!("{}:{}", self.api.host, self.api.port)
    }
}

fn parse_dispatch_policy() -> Result<DispatchPolicy> {
    match get_env_or("DISPATCH_POLICY", "random").to_lowercase().as_str() {
        "random" => Ok(DispatchPolicy::Random),
        "filtered" => {
            let schema = match env::var("DISPATCH_SCHEMA").ok().filter(|s| !s.is_empty()) {
                Some(raw) => Some(Schema::from_str(&raw).ok_or_else(|| {
                    PoolError::InvalidConfig(format!("DISPATCH_SCHEMA has unknown schema: {}", raw))
                })?),
                None => None,
            };
            let min_score = match env::var("DISPATCH_MIN_SCORE").ok().filter(|s| !s.is_empty()) {
                Some(raw) => Some(raw.parse::<u8>().ok().filter(|s| *s <= 100).ok_or_else(
                    || PoolError::InvalidConfig("DISPATCH_MIN_SCORE must be 0..=100".into()),
                )?),
                None => None,
            };
            Ok(DispatchPolicy::Filtered { schema, min_score })
        }
        other => Err(PoolError::InvalidConfig(format!(
            "DISPATCH_POLICY must be random or filtered, got {}",
            other
        ))),
    }
}

/// Parse a variable with a default, failing with `InvalidConfig` when malformed
fn parse_env<T: FromStr>(key: &str, default: &str, expected: &str) -> Result<T> {
    get_env_or(key, default)
        .trim()
        .parse()
        .map_err(|_| PoolError::InvalidConfig(format!("{} must be {}", key, expected)))
}

/// Absolute http(s) URL from the environment
fn parse_url(key: &str, default: &str) -> Result<String> {
    let raw = get_env_or(key, default);
    let url = url::Url::parse(raw.trim())
        .map_err(|e| PoolError::InvalidConfig(format!("{} is not a valid URL: {}", key, e)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(PoolError::InvalidConfig(format!(
            "{} must be an http or https URL",
            key
        )));
    }
    Ok(url.to_string())
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}
