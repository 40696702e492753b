use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Unified error type for the proxy pool
#[derive(Error, Debug)]
pub enum PoolError {
    // Store errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Malformed stored record {key}: {reason}")]
    MalformedRecord { key: String, reason: String },

    // Pool errors
    #[error("No proxies available")]
    NoProxiesAvailable,

    #[error("Proxy not found: {key}")]
    ProxyNotFound { key: String },

    #[error("Invalid proxy address: {0}")]
    InvalidProxyAddress(String),

    #[error("Unsupported proxy schema: {0}")]
    UnsupportedSchema(String),

    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    // Relay errors
    #[error("Proxy connection failed: {0}")]
    ProxyConnectionFailed(String),

    #[error("All proxies exhausted after {attempts} attempts")]
    AllProxiesExhausted { attempts: u32 },

    // Discovery and validation errors
    #[error("Fetch failed: {0}")]
    Fetch(String),

    #[error("Probe failed: {0}")]
    ProbeFailed(String),

    #[error("Geo lookup failed: {0}")]
    GeoLookup(String),

    #[error("Invalid cadence expression: {0}")]
    InvalidCadence(String),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Request errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Request timeout")]
    RequestTimeout,

    #[error("Operation timed out")]
    Timeout,

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // HTTP errors
    #[error("HTTP error: {0}")]
    Http(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for pool operations
pub type Result<T> = std::result::Result<T, PoolError>;

impl PoolError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            PoolError::InvalidRequest(_)
            | PoolError::InvalidFilter(_)
            | PoolError::InvalidProxyAddress(_)
            | PoolError::UnsupportedSchema(_)
            | PoolError::InvalidCadence(_)
            | PoolError::InvalidConfig(_) => StatusCode::BAD_REQUEST,

            // 404 Not Found
            PoolError::ProxyNotFound { .. } => StatusCode::NOT_FOUND,

            // 502 Bad Gateway
            PoolError::ProxyConnectionFailed(_)
            | PoolError::AllProxiesExhausted { .. }
            | PoolError::Fetch(_)
            | PoolError::ProbeFailed(_) => StatusCode::BAD_GATEWAY,

            // 503 Service Unavailable
            PoolError::NoProxiesAvailable | PoolError::StoreUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }

            // 504 Gateway Timeout
            PoolError::RequestTimeout | PoolError::Timeout => StatusCode::GATEWAY_TIMEOUT,

            // 500 Internal Server Error
            PoolError::Database(_)
            | PoolError::MalformedRecord { .. }
            | PoolError::GeoLookup(_)
            | PoolError::Io(_)
            | PoolError::Http(_)
            | PoolError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Check if this is a client error (4xx)
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }

    /// Check if this is a server error (5xx)
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }
}

impl IntoResponse for PoolError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = json!({
            "error": self.to_string(),
        });

        (status, Json(body)).into_response()
    }
}

impl From<hyper::Error> for PoolError {
    fn from(err: hyper::Error) -> Self {
        PoolError::Http(err.to_string())
    }
}

impl From<reqwest::Error> for PoolError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            PoolError::Timeout
        } else {
            PoolError::Fetch(err.to_string())
        }
    }
}

impl From<url::ParseError> for PoolError {
    fn from(err: url::ParseError) -> Self {
        PoolError::InvalidProxyAddress(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_code_mapping() {
        assert_eq!(
            PoolError::InvalidFilter("score".to_string()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            PoolError::UnsupportedSchema("ftp".to_string()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            PoolError::ProxyNotFound {
                key: "1.2.3.4:80".to_string()
            }
            .status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            PoolError::AllProxiesExhausted { attempts: 4 }.status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(PoolError::Timeout.status_code(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            PoolError::NoProxiesAvailable.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            PoolError::StoreUnavailable("down".to_string()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_error_client_server_helpers() {
        assert!(PoolError::InvalidRequest("bad".to_string()).is_client_error());
        assert!(!PoolError::InvalidRequest("bad".to_string()).is_server_error());

        assert!(PoolError::NoProxiesAvailable.is_server_error());
        assert!(!PoolError::NoProxiesAvailable.is_client_error());
    }

    #[tokio::test]
    async fn test_error_into_response_body() {
        use http_body_util::BodyExt;

        let response = PoolError::ProxyNotFound {
            key: "1.2.3.4:8080".to_string(),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"], "Proxy not found: 1.2.3.4:8080");
    }
}
