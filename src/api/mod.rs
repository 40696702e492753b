//! Query API
//!
//! JSON endpoints for reading and curating the pool.

pub mod handlers;
pub mod middleware;
pub mod routes;
pub mod server;

pub use server::{ApiServer, AppState};
