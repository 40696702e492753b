//! Health and status endpoints

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;
use tracing::warn;

use crate::api::server::AppState;
use crate::error::PoolError;

/// Liveness plus a store round trip
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({
                "status": "healthy",
                "service": "rota-pool",
                "store": "ok"
            })),
        ),
        Err(e) => {
            warn!("Store ping failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "service": "rota-pool",
                    "store": e.to_string()
                })),
            )
        }
    }
}

/// Uptime, pool size and the roles this process runs
pub async fn status(State(state): State<AppState>) -> Result<impl IntoResponse, PoolError> {
    let pool_size = state.store.len().await?;

    Ok(Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "prefix": state.store.prefix(),
        "pool_size": pool_size,
        "roles": {
            "manager": state.roles.manager,
            "worker": state.roles.worker,
        },
    })))
}
