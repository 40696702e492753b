//! Proxy request handler with retry logic
//!
//! Every client request gets a fresh member per attempt. Members that relay
//! successfully are rewarded, members that fail or time out are penalised, and
//! the whole request is bounded by one deadline.

use std::fmt::Display;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use hyper::header::{HeaderValue, CONTENT_TYPE, HOST};
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, error, info, instrument, warn};

use crate::error::{PoolError, Result};
use crate::models::ProxyRecord;
use crate::proxy::selector::PoolSelector;
use crate::proxy::transport::ProxyTransport;
use crate::proxy::tunnel::TunnelHandler;

/// Configuration for proxy handler
#[derive(Debug, Clone)]
pub struct ProxyHandlerConfig {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Timeout for reaching a member
    pub connect_timeout: Duration,
    /// Deadline for the whole client request
    pub request_timeout: Duration,
}

impl Default for ProxyHandlerConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Forwarded request, buffered so it can be replayed across attempts
struct Buffered {
    method: Method,
    uri: Uri,
    headers: hyper::HeaderMap,
    body: Bytes,
}

/// Proxy request handler
pub struct ProxyHandler {
    selector: PoolSelector,
    config: ProxyHandlerConfig,
}

impl ProxyHandler {
    pub fn new(selector: PoolSelector, config: ProxyHandlerConfig) -> Self {
        Self { selector, config }
    }

    /// Handle an incoming proxy request; failures become error responses
    #[instrument(skip(self, req), fields(method = %req.method(), uri = %req.uri()))]
    pub async fn handle<B>(&self, req: Request<B>) -> Response<Full<Bytes>>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Display,
    {
        let deadline = Instant::now() + self.config.request_timeout;

        let result = if req.method() == Method::CONNECT {
            self.handle_connect(req, deadline).await
        } else {
            self.handle_http(req, deadline).await
        };

        result.unwrap_or_else(|e| {
            if e.is_server_error() {
                warn!("Request failed: {}", e);
            } else {
                debug!("Request rejected: {}", e);
            }
            error_response(e.status_code(), &e.to_string())
        })
    }

    /// CONNECT: reply 200 once a member tunnel is up, then splice
    async fn handle_connect<B>(
        &self,
        req: Request<B>,
        deadline: Instant,
    ) -> Result<Response<Full<Bytes>>>
    where
        B: Body + Send + 'static,
    {
        let authority = req
            .uri()
            .authority()
            .map(|a| a.to_string())
            .unwrap_or_else(|| req.uri().to_string());
        let (host, port) = ProxyTransport::parse_authority(&authority)?;

        let (record, upstream) = self
            .with_retries(deadline, |record| {
                let host = host.clone();
                async move { ProxyTransport::connect(&record, &host, port).await }
            })
            .await?;

        info!(proxy = %record.address(), target = %authority, "CONNECT tunnel established");

        let on_upgrade = hyper::upgrade::on(req);
        tokio::spawn(async move {
            match on_upgrade.await {
                Ok(upgraded) => {
                    TunnelHandler::splice(TokioIo::new(upgraded), upstream).await;
                }
                Err(e) => debug!("CONNECT upgrade failed: {}", e),
            }
        });

        Ok(Response::new(Full::new(Bytes::new())))
    }

    /// Absolute-form HTTP request
    async fn handle_http<B>(
        &self,
        req: Request<B>,
        deadline: Instant,
    ) -> Result<Response<Full<Bytes>>>
    where
        B: Body + Send + 'static,
        B::Error: Display,
    {
        if req.uri().scheme_str() != Some("http") {
            return Err(PoolError::InvalidRequest(
                "expected an absolute http:// URI; use CONNECT for TLS".into(),
            ));
        }
        let (host, port) = ProxyTransport::parse_target(req.uri())?;

        let (parts, body) = req.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| PoolError::InvalidRequest(format!("Failed to read body: {}", e)))?
            .to_bytes();

        let request = Buffered {
            method: parts.method,
            uri: parts.uri,
            headers: parts.headers,
            body,
        };

        let request = &request;
        let (record, response) = self
            .with_retries(deadline, move |record| {
                let host = host.clone();
                async move { forward(&record, request, &host, port).await }
            })
            .await?;

        debug!(proxy = %record.address(), status = %response.status(), "Request relayed");
        Ok(response)
    }

    /// Run `attempt` against fresh members until one succeeds.
    ///
    /// Each attempt is bounded by `connect_timeout`, all of them by `deadline`.
    async fn with_retries<T, F, Fut>(&self, deadline: Instant, mut attempt: F) -> Result<(ProxyRecord, T)>
    where
        F: FnMut(ProxyRecord) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let max_attempts = self.config.max_retries + 1;
        let mut failures = 0u32;

        for n in 1..=max_attempts {
            let record = match self.selector.select().await {
                Ok(record) => record,
                Err(PoolError::NoProxiesAvailable) if failures > 0 => break,
                Err(e) => return Err(e),
            };
            let key = record.key();

            debug!(proxy = %key, attempt = n, max_attempts, "Trying member");

            let bounded = timeout(self.config.connect_timeout, attempt(record.clone()));
            match timeout_at(deadline, bounded).await {
                Ok(Ok(Ok(value))) => {
                    self.selector.report_success(key).await;
                    return Ok((record, value));
                }
                Ok(Ok(Err(e))) => {
                    warn!(proxy = %key, attempt = n, "Member failed: {}", e);
                    self.selector.report_failure(key).await;
                    failures += 1;
                }
                Ok(Err(_)) => {
                    warn!(proxy = %key, attempt = n, "Member timed out");
                    self.selector.report_failure(key).await;
                    failures += 1;
                }
                Err(_) => {
                    warn!(proxy = %key, "Request deadline reached");
                    self.selector.report_failure(key).await;
                    return Err(PoolError::RequestTimeout);
                }
            }
        }

        error!("All attempts failed after {} tries", failures);
        Err(PoolError::AllProxiesExhausted { attempts: failures })
    }
}

/// Send one buffered request through `record` and collect the response
async fn forward(
    record: &ProxyRecord,
    request: &Buffered,
    host: &str,
    port: u16,
) -> Result<Response<Full<Bytes>>> {
    // http members take the absolute form; socks members get a tunnel and
    // the origin form.
    let (stream, uri): (TcpStream, Uri) = if record.schema.is_socks() {
        let stream = ProxyTransport::connect(record, host, port).await?;
        let origin = request
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .parse()
            .map_err(|e| PoolError::InvalidRequest(format!("Invalid path: {}", e)))?;
        (stream, origin)
    } else {
        (ProxyTransport::connect_member(record).await?, request.uri.clone())
    };

    let mut builder = Request::builder().method(request.method.clone()).uri(uri);
    for (name, value) in &request.headers {
        if !is_hop_by_hop_header(name.as_str()) {
            builder = builder.header(name, value);
        }
    }
    if !request.headers.contains_key(HOST) {
        let authority = if port == 80 {
            host.to_string()
        } else {
            format!("{}:{}", host, port)
        };
        builder = builder.header(HOST, authority);
    }
    let outbound = builder
        .body(Full::new(request.body.clone()))
        .map_err(|e| PoolError::InvalidRequest(format!("Failed to build request: {}", e)))?;

    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| PoolError::ProxyConnectionFailed(format!("Handshake failed: {}", e)))?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("Connection ended: {}", e);
        }
    });

    let response = sender
        .send_request(outbound)
        .await
        .map_err(|e| PoolError::ProxyConnectionFailed(format!("Request failed: {}", e)))?;

    // Through a socks tunnel the status comes from the origin; through an
    // http member these statuses are the member's own.
    if !record.schema.is_socks() && is_member_failure(response.status()) {
        return Err(PoolError::ProxyConnectionFailed(format!(
            "Member answered {}",
            response.status()
        )));
    }

    let (mut parts, body) = response.into_parts();
    let body = body
        .collect()
        .await
        .map_err(|e| PoolError::ProxyConnectionFailed(format!("Failed to read response: {}", e)))?
        .to_bytes();

    strip_hop_by_hop(&mut parts.headers);
    Ok(Response::from_parts(parts, Full::new(body)))
}

fn strip_hop_by_hop(headers: &mut hyper::HeaderMap) {
    let hop: Vec<_> = headers
        .keys()
        .filter(|name| is_hop_by_hop_header(name.as_str()))
        .cloned()
        .collect();
    for name in hop {
        headers.remove(name);
    }
}

/// Statuses an http member produces itself when it cannot relay
fn is_member_failure(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::PROXY_AUTHENTICATION_REQUIRED
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

/// Check if a header is a hop-by-hop header that should not be forwarded
fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(message.to_string())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatchPolicy;
    use crate::models::ProxyKey;
    use crate::store::{MemoryStore, ProxyStore};
    use std::net::Ipv4Addr;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn handler(store: Arc<MemoryStore>, request_timeout: Duration) -> ProxyHandler {
        let selector = PoolSelector::new(store, &DispatchPolicy::Random, 1, -10).unwrap();
        ProxyHandler::new(
            selector,
            ProxyHandlerConfig {
                max_retries: 2,
                connect_timeout: Duration::from_secs(2),
                request_timeout,
            },
        )
    }

    fn get(uri: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .uri(uri)
            .header("Proxy-Connection", "keep-alive")
            .body(Full::new(Bytes::new()))
            .unwrap()
    }

    async fn add_member(store: &MemoryStore, port: u16) -> ProxyKey {
        let key = ProxyKey::new(Ipv4Addr::LOCALHOST, port);
        store.add(&ProxyRecord::new(key, "test")).await.unwrap();
        key
    }

    /// HTTP proxy that answers every absolute-form request with `ok`
    async fn serving_member() -> (u16, tokio::task::JoinHandle<Vec<u8>>) {
        replying_member(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok").await
    }

    /// HTTP proxy that answers the first request with `reply`
    async fn replying_member(reply: &'static [u8]) -> (u16, tokio::task::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let task = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut head = Vec::new();
            let mut buf = [0u8; 1024];
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = conn.read(&mut buf).await.unwrap();
                head.extend_from_slice(&buf[..n]);
            }
            conn.write_all(reply).await.unwrap();
            head
        });
        (port, task)
    }

    async fn dead_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_empty_pool_is_503() {
        let store = Arc::new(MemoryStore::default());
        let response = handler(store, Duration::from_secs(5))
            .handle(get("http://example.com/"))
            .await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_relay_through_http_member_rewards_it() {
        let store = Arc::new(MemoryStore::default());
        let (port, member) = serving_member().await;
        let key = add_member(&store, port).await;

        let response = handler(store.clone(), Duration::from_secs(5))
            .handle(get("http://example.com/path?q=1"))
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert!(!response.headers().contains_key("connection"));
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
        assert_eq!(store.get(key).await.unwrap().unwrap().score, 11);

        let head = String::from_utf8(member.await.unwrap()).unwrap();
        assert!(head.starts_with("GET http://example.com/path?q=1 HTTP/1.1\r\n"));
        assert!(!head.to_ascii_lowercase().contains("proxy-connection"));
    }

    #[tokio::test]
    async fn test_dead_member_is_penalised_and_502() {
        let store = Arc::new(MemoryStore::default());
        let key = add_member(&store, dead_port().await).await;

        let response = handler(store.clone(), Duration::from_secs(5))
            .handle(get("http://example.com/"))
            .await;

        // Score 10 minus one relay failure leaves nothing to retry with.
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert!(!store.exists(key).await.unwrap());
    }

    #[tokio::test]
    async fn test_member_auth_challenge_is_penalised() {
        let store = Arc::new(MemoryStore::default());
        let (port, _member) = replying_member(
            b"HTTP/1.1 407 Proxy Authentication Required\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;
        let key = add_member(&store, port).await;

        let response = handler(store.clone(), Duration::from_secs(5))
            .handle(get("http://example.com/"))
            .await;

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert!(!store.exists(key).await.unwrap());
    }

    #[tokio::test]
    async fn test_member_gateway_error_falls_over_to_next_member() {
        let store = Arc::new(MemoryStore::default());
        let (bad_port, _bad) = replying_member(
            b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;
        let bad = ProxyKey::new(Ipv4Addr::LOCALHOST, bad_port);
        store
            .add(&ProxyRecord::new(bad, "test").with_score(15))
            .await
            .unwrap();
        let (port, _member) = serving_member().await;
        let live = add_member(&store, port).await;

        let response = handler(store.clone(), Duration::from_secs(5))
            .handle(get("http://example.com/"))
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(store.get(live).await.unwrap().unwrap().score, 11);
        let bad_score = store.get(bad).await.unwrap().map(|r| r.score);
        assert!(matches!(bad_score, Some(5) | Some(15)));
    }

    #[test]
    fn test_member_failure_statuses() {
        assert!(is_member_failure(StatusCode::PROXY_AUTHENTICATION_REQUIRED));
        assert!(is_member_failure(StatusCode::BAD_GATEWAY));
        assert!(is_member_failure(StatusCode::GATEWAY_TIMEOUT));
        assert!(!is_member_failure(StatusCode::OK));
        assert!(!is_member_failure(StatusCode::NOT_FOUND));
        assert!(!is_member_failure(StatusCode::INTERNAL_SERVER_ERROR));
    }

    #[tokio::test]
    async fn test_failed_member_is_replaced_by_a_working_one() {
        let store = Arc::new(MemoryStore::default());
        let dead = ProxyKey::new(Ipv4Addr::LOCALHOST, dead_port().await);
        store
            .add(&ProxyRecord::new(dead, "test").with_score(15))
            .await
            .unwrap();
        let (port, _member) = serving_member().await;
        let live = add_member(&store, port).await;

        let response = handler(store.clone(), Duration::from_secs(5))
            .handle(get("http://example.com/"))
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(store.get(live).await.unwrap().unwrap().score, 11);
        let dead_score = store.get(dead).await.unwrap().map(|r| r.score);
        assert!(matches!(dead_score, None | Some(5) | Some(15)));
    }

    #[tokio::test]
    async fn test_deadline_is_504() {
        let store = Arc::new(MemoryStore::default());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let key = add_member(&store, port).await;

        // Accepts and never answers.
        let _silent = tokio::spawn(async move {
            let (conn, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
            drop(conn);
        });

        let response = handler(store.clone(), Duration::from_millis(300))
            .handle(get("http://example.com/"))
            .await;

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert!(!store.exists(key).await.unwrap());
    }

    #[tokio::test]
    async fn test_relative_uri_is_rejected() {
        let store = Arc::new(MemoryStore::default());
        let response = handler(store, Duration::from_secs(5))
            .handle(get("/just-a-path"))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_hop_by_hop_headers() {
        assert!(is_hop_by_hop_header("Connection"));
        assert!(is_hop_by_hop_header("proxy-connection"));
        assert!(is_hop_by_hop_header("Transfer-Encoding"));
        assert!(!is_hop_by_hop_header("content-type"));
        assert!(!is_hop_by_hop_header("host"));
    }
}
