//! Rota Pool - self-maintaining proxy pool
//!
//! Collects public proxies from configured sources, keeps them in a scored
//! store with per-key TTL, probes them continuously and relays client traffic
//! through the healthy ones.
//!
//! ## Features
//!
//! - Scored store with eviction, saturation and TTL refresh (in-memory or PostgreSQL)
//! - Table-driven sources on independent cadences with geo-based admission
//! - Fresh and periodic validators with bounded concurrency
//! - Forwarding dispatcher for HTTP and CONNECT with relay feedback
//! - JSON query API

pub mod api;
pub mod config;
pub mod database;
pub mod error;
pub mod models;
pub mod proxy;
pub mod services;
pub mod sources;
pub mod store;
pub mod validator;

pub use config::Config;
pub use database::Database;
pub use error::{PoolError, Result};
