//! API route definitions

use axum::routing::{get, put};
use axum::Router;

use super::handlers;
use super::server::AppState;

/// Create the API router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/api/status", get(handlers::health::status))
        .nest("/api", pool_routes())
        .with_state(state)
}

fn pool_routes() -> Router<AppState> {
    Router::new()
        .route("/proxies", get(handlers::proxy::list_proxies))
        .route("/proxies/random", get(handlers::proxy::random_proxy))
        .route("/proxies/count", get(handlers::proxy::count_proxies))
        .route(
            "/proxies/:ip/:port",
            get(handlers::proxy::get_proxy).delete(handlers::proxy::delete_proxy),
        )
        .route("/proxies/:ip/:port/schema", put(handlers::proxy::update_schema))
}
