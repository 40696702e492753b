//! Byte splicing between a client and an upstream tunnel

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, instrument};

/// Splices CONNECT tunnels
pub struct TunnelHandler;

impl TunnelHandler {
    /// Copy in both directions until either side closes.
    ///
    /// Returns bytes sent to and received from the upstream.
    #[instrument(skip(client, upstream))]
    pub async fn splice<C, U>(mut client: C, mut upstream: U) -> (u64, u64)
    where
        C: AsyncRead + AsyncWrite + Unpin + Send,
        U: AsyncRead + AsyncWrite + Unpin + Send,
    {
        match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
            Ok((sent, received)) => {
                debug!(bytes_sent = sent, bytes_received = received, "Tunnel closed");
                (sent, received)
            }
            Err(e) => {
                debug!("Tunnel ended: {}", e);
                (0, 0)
            }
        }
    }
}
