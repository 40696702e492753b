//! CORS middleware configuration
//!
//! Origins come from an explicit whitelist; nothing is allowed by wildcard.

use axum::http::{HeaderValue, Method};
use axum::http::header;
use tower_http::cors::CorsLayer;
use tracing::debug;

/// Create a CORS layer for the pool API.
///
/// An empty list allows local dashboards only.
pub fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = if allowed_origins.is_empty() {
        debug!("CORS: No origins specified, allowing localhost only");
        vec![
            HeaderValue::from_static("http://localhost:3000"),
            HeaderValue::from_static("http://127.0.0.1:3000"),
        ]
    } else {
        debug!("CORS: Allowing origins: {:?}", allowed_origins);
        allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect()
    };

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT])
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{HeaderMap, Request};
    use axum::routing::delete;
    use tower::ServiceExt;

    /// Preflight `method` on a pool route from `origin`
    async fn preflight(allowed: &[String], origin: &str, method: &str) -> HeaderMap {
        let app = axum::Router::new()
            .route("/api/proxies/:ip/:port", delete(|| async { "" }))
            .layer(cors_layer(allowed));

        app.oneshot(
            Request::builder()
                .method(Method::OPTIONS)
                .uri("/api/proxies/1.2.3.4/8080")
                .header(header::ORIGIN, origin)
                .header(header::ACCESS_CONTROL_REQUEST_METHOD, method)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap()
        .headers()
        .clone()
    }

    fn allowed_origin(headers: &HeaderMap) -> Option<&str> {
        headers
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .and_then(|v| v.to_str().ok())
    }

    #[tokio::test]
    async fn test_pool_methods_only() {
        let headers = preflight(&[], "http://localhost:3000", "DELETE").await;

        assert_eq!(allowed_origin(&headers), Some("http://localhost:3000"));
        let methods = headers
            .get(header::ACCESS_CONTROL_ALLOW_METHODS)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        for method in ["GET", "PUT", "DELETE"] {
            assert!(methods.contains(method), "{} missing from {}", method, methods);
        }
        assert!(!methods.contains("POST"));
        assert!(!methods.contains("PATCH"));
    }

    #[tokio::test]
    async fn test_whitelist_replaces_localhost_fallback() {
        let allowed = vec!["https://pool.example".to_string(), "bad\norigin".to_string()];

        let headers = preflight(&allowed, "https://pool.example", "PUT").await;
        assert_eq!(allowed_origin(&headers), Some("https://pool.example"));

        let headers = preflight(&allowed, "http://localhost:3000", "PUT").await;
        assert_eq!(allowed_origin(&headers), None);
    }

    #[tokio::test]
    async fn test_unlisted_origin_is_not_echoed() {
        let headers = preflight(&[], "https://elsewhere.example", "GET").await;
        assert_eq!(allowed_origin(&headers), None);
    }
}
