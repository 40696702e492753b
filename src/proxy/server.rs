//! Dispatcher server using hyper
//!
//! Accepts forward-proxy clients and relays their requests through pool members.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument};

use crate::config::ProxyServerConfig;
use crate::error::{PoolError, Result};
use crate::proxy::handler::{ProxyHandler, ProxyHandlerConfig};
use crate::proxy::selector::PoolSelector;
use crate::store::ProxyStore;

/// Dispatcher server
pub struct ProxyServer {
    config: ProxyServerConfig,
    handler: Arc<ProxyHandler>,
}

impl ProxyServer {
    /// Create a dispatcher over `store`; fails on an unusable selection policy
    pub fn new(config: ProxyServerConfig, store: Arc<dyn ProxyStore>) -> Result<Self> {
        let selector = PoolSelector::new(
            store,
            &config.policy,
            config.relay_success,
            config.relay_failure,
        )?;

        let handler_config = ProxyHandlerConfig {
            max_retries: config.max_retries,
            connect_timeout: Duration::from_secs(config.connect_timeout),
            request_timeout: Duration::from_secs(config.request_timeout),
        };

        Ok(Self {
            config,
            handler: Arc::new(ProxyHandler::new(selector, handler_config)),
        })
    }

    fn addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.config.host, self.config.port)
            .parse()
            .map_err(|e| PoolError::InvalidConfig(format!("Invalid proxy server address: {}", e)))
    }

    /// Run the dispatcher until shutdown
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let addr = self.addr()?;
        let listener = TcpListener::bind(addr).await?;
        info!("Proxy server listening on {}", addr);

        self.serve(listener, shutdown).await
    }

    /// Accept loop on an already bound listener
    pub async fn serve(
        &self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, client_addr)) => {
                            let handler = self.handler.clone();
                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(stream, handler).await {
                                    debug!(client = %client_addr, "Connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Handle a single client connection
    async fn handle_connection(stream: TcpStream, handler: Arc<ProxyHandler>) -> Result<()> {
        let io = TokioIo::new(stream);

        let service = service_fn(move |req: Request<Incoming>| {
            let handler = handler.clone();
            async move { Ok::<_, Infallible>(handler.handle(req).await) }
        });

        http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .serve_connection(io, service)
            .with_upgrades()
            .await
            .map_err(|e| PoolError::ProxyConnectionFailed(e.to_string()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatchPolicy;
    use crate::store::MemoryStore;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn config() -> ProxyServerConfig {
        ProxyServerConfig {
            port: 0,
            host: "127.0.0.1".to_string(),
            max_retries: 3,
            connect_timeout: 2,
            request_timeout: 5,
            policy: DispatchPolicy::Random,
            relay_success: 1,
            relay_failure: -10,
        }
    }

    #[tokio::test]
    async fn test_empty_pool_answers_503_over_the_wire() {
        let store: Arc<dyn ProxyStore> = Arc::new(MemoryStore::default());
        let server = ProxyServer::new(config(), store).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(async move { server.serve(listener, rx).await });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert!(reply.starts_with(b"HTTP/1.1 503"));

        tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    #[test]
    fn test_invalid_bind_address() {
        let mut config = config();
        config.host = "not an address".to_string();
        let store: Arc<dyn ProxyStore> = Arc::new(MemoryStore::default());
        let server = ProxyServer::new(config, store).unwrap();
        assert!(matches!(server.addr(), Err(PoolError::InvalidConfig(_))));
    }
}
