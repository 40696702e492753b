//! Request logging middleware

use axum::body::Body;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Request logging middleware
pub struct RequestLogging;

impl RequestLogging {
    /// Log method, path, status and latency of every API call
    pub async fn log_request(req: Request<Body>, next: Next) -> Response {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let start = Instant::now();

        debug!(%method, %path, "API request started");

        let response = next.run(req).await;

        let elapsed_ms = start.elapsed().as_millis() as u64;
        let status = response.status().as_u16();

        if response.status().is_server_error() {
            warn!(%method, %path, status, elapsed_ms, "API request failed");
        } else {
            info!(%method, %path, status, elapsed_ms, "API request");
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::get;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_logging_passes_response_through() {
        let app = axum::Router::new()
            .route("/api/proxies/count", get(|| async { (StatusCode::ACCEPTED, "3") }))
            .layer(axum::middleware::from_fn(RequestLogging::log_request));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/proxies/count")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }
}
