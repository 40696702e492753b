//! Connections through pool members
//!
//! http/https members are asked for a `CONNECT` tunnel, socks members get the
//! matching SOCKS handshake. Either way the caller ends up with a plain TCP
//! stream that reaches the target.

use std::net::SocketAddr;

use hyper::Uri;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_socks::tcp::{Socks4Stream, Socks5Stream};
use tracing::{debug, instrument};

use crate::error::{PoolError, Result};
use crate::models::{ProxyRecord, Schema};

/// Upper bound on a CONNECT reply header
const MAX_CONNECT_REPLY: usize = 8 * 1024;

/// Proxy transport handler
pub struct ProxyTransport;

impl ProxyTransport {
    /// Open a stream to `target_host:target_port` through `record`
    #[instrument(skip(record), fields(proxy = %record.address(), schema = %record.schema))]
    pub async fn connect(
        record: &ProxyRecord,
        target_host: &str,
        target_port: u16,
    ) -> Result<TcpStream> {
        match record.schema {
            Schema::Http | Schema::Https => {
                Self::connect_http(record, target_host, target_port).await
            }
            Schema::Socks4 => Self::connect_socks4(record, target_host, target_port).await,
            Schema::Socks5 => Self::connect_socks5(record, target_host, target_port).await,
        }
    }

    /// Plain TCP connection to the member itself
    pub async fn connect_member(record: &ProxyRecord) -> Result<TcpStream> {
        TcpStream::connect(record.key().socket_addr())
            .await
            .map_err(|e| PoolError::ProxyConnectionFailed(format!("TCP connect failed: {}", e)))
    }

    async fn connect_http(
        record: &ProxyRecord,
        target_host: &str,
        target_port: u16,
    ) -> Result<TcpStream> {
        let mut stream = Self::connect_member(record).await?;

        let request = format!(
            "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n",
            host = target_host,
            port = target_port
        );
        stream.write_all(request.as_bytes()).await.map_err(|e| {
            PoolError::ProxyConnectionFailed(format!("Failed to send CONNECT: {}", e))
        })?;

        let reply = Self::read_reply_head(&mut stream).await?;
        let status_line = reply.lines().next().unwrap_or_default();
        if !is_success_status_line(status_line) {
            return Err(PoolError::ProxyConnectionFailed(format!(
                "CONNECT refused: {}",
                status_line
            )));
        }

        debug!("HTTP CONNECT tunnel established");
        Ok(stream)
    }

    /// Read up to the blank line that ends the reply header
    async fn read_reply_head(stream: &mut TcpStream) -> Result<String> {
        let mut head = Vec::with_capacity(256);
        let mut chunk = [0u8; 512];

        loop {
            let n = stream.read(&mut chunk).await.map_err(|e| {
                PoolError::ProxyConnectionFailed(format!("Failed to read CONNECT reply: {}", e))
            })?;
            if n == 0 {
                return Err(PoolError::ProxyConnectionFailed(
                    "Member closed the connection during CONNECT".into(),
                ));
            }
            head.extend_from_slice(&chunk[..n]);

            if head.windows(4).any(|w| w == b"\r\n\r\n") {
                return Ok(String::from_utf8_lossy(&head).into_owned());
            }
            if head.len() > MAX_CONNECT_REPLY {
                return Err(PoolError::ProxyConnectionFailed(
                    "CONNECT reply header too large".into(),
                ));
            }
        }
    }

    async fn connect_socks4(
        record: &ProxyRecord,
        target_host: &str,
        target_port: u16,
    ) -> Result<TcpStream> {
        // Hostnames go out as SOCKS4a; addresses as plain SOCKS4.
        let member = SocketAddr::V4(record.key().socket_addr());
        let stream = Socks4Stream::connect(member, (target_host, target_port))
            .await
            .map_err(|e| {
                PoolError::ProxyConnectionFailed(format!("SOCKS4 connect failed: {}", e))
            })?;

        debug!("SOCKS4 connection established");
        Ok(stream.into_inner())
    }

    async fn connect_socks5(
        record: &ProxyRecord,
        target_host: &str,
        target_port: u16,
    ) -> Result<TcpStream> {
        let member = SocketAddr::V4(record.key().socket_addr());
        let stream = Socks5Stream::connect(member, (target_host, target_port))
            .await
            .map_err(|e| {
                PoolError::ProxyConnectionFailed(format!("SOCKS5 connect failed: {}", e))
            })?;

        debug!("SOCKS5 connection established");
        Ok(stream.into_inner())
    }

    /// Host and port of an absolute-form request URI
    pub fn parse_target(uri: &Uri) -> Result<(String, u16)> {
        let host = uri
            .host()
            .ok_or_else(|| PoolError::InvalidRequest("Missing host in URI".to_string()))?
            .to_string();

        let port = uri.port_u16().unwrap_or_else(|| match uri.scheme_str() {
            Some("https") => 443,
            _ => 80,
        });

        Ok((host, port))
    }

    /// Host and port of a CONNECT authority; the port defaults to 443
    pub fn parse_authority(authority: &str) -> Result<(String, u16)> {
        match authority.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => {
                let port = port
                    .parse::<u16>()
                    .ok()
                    .filter(|p| *p != 0)
                    .ok_or_else(|| PoolError::InvalidRequest(format!("Invalid port: {}", port)))?;
                Ok((host.trim_matches(|c| c == '[' || c == ']').to_string(), port))
            }
            Some(_) => Err(PoolError::InvalidRequest(format!(
                "Invalid authority: {}",
                authority
            ))),
            None if authority.is_empty() => {
                Err(PoolError::InvalidRequest("Empty CONNECT authority".into()))
            }
            None => Ok((authority.to_string(), 443)),
        }
    }
}

/// `HTTP/1.x 2xx ...`
fn is_success_status_line(line: &str) -> bool {
    let mut parts = line.split_whitespace();
    let version_ok = parts
        .next()
        .map(|v| v.starts_with("HTTP/1."))
        .unwrap_or(false);
    let status_ok = parts
        .next()
        .and_then(|s| s.parse::<u16>().ok())
        .map(|s| (200..300).contains(&s))
        .unwrap_or(false);
    version_ok && status_ok
}
