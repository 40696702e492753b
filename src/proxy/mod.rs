//! Dispatcher
//!
//! This module provides the forward proxy in front of the pool:
//! - absolute-form HTTP relaying
//! - CONNECT tunnels
//! - per-attempt member selection with relay feedback

pub mod handler;
pub mod selector;
pub mod server;
pub mod transport;
pub mod tunnel;

pub use handler::{ProxyHandler, ProxyHandlerConfig};
pub use selector::PoolSelector;
pub use server::ProxyServer;
pub use transport::ProxyTransport;
pub use tunnel::TunnelHandler;
