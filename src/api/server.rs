//! API server using Axum

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument};

use crate::config::{ApiServerConfig, RoleConfig};
use crate::error::{PoolError, Result};
use crate::store::ProxyStore;

use super::middleware::{cors_layer, RequestLogging};
use super::routes;

/// Shared state for API handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ProxyStore>,
    pub roles: RoleConfig,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(store: Arc<dyn ProxyStore>, roles: RoleConfig) -> Self {
        Self {
            store,
            roles,
            started_at: Instant::now(),
        }
    }
}

/// API server
pub struct ApiServer {
    config: ApiServerConfig,
    state: AppState,
}

impl ApiServer {
    /// Create a new API server
    pub fn new(config: ApiServerConfig, roles: RoleConfig, store: Arc<dyn ProxyStore>) -> Self {
        Self {
            config,
            state: AppState::new(store, roles),
        }
    }

    /// Build the router
    fn build_router(&self) -> Router {
        let cors = cors_layer(&self.config.cors_origins);

        routes::create_router(self.state.clone())
            .layer(axum::middleware::from_fn(RequestLogging::log_request))
            .layer(cors)
            .layer(TraceLayer::new_for_http())
    }

    /// Run the API server
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.host, self.config.port)
            .parse()
            .map_err(|e| PoolError::InvalidConfig(format!("Invalid API server address: {}", e)))?;

        let router = self.build_router();

        info!("API server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await
            .map_err(|e| PoolError::Internal(e.to_string()))?;

        info!("API server shut down");
        Ok(())
    }
}
