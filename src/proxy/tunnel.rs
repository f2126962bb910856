//! Raw byte relay between a hijacked client and its upstream
//!
//! The first direction to finish tears down both streams; half-close is not
//! carried across to the other side.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, instrument};

use crate::error::{GatewayError, Result};

/// Which side ended the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosedBy {
    Client,
    Upstream,
}

/// Byte counts for a finished tunnel
///
/// Only the direction that finished first is counted in full. The other one
/// is cut off mid-copy and reports zero, plus any pending bytes for
/// `bytes_sent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelStats {
    /// Bytes relayed client -> upstream, including any buffered request body
    pub bytes_sent: u64,
    /// Bytes relayed upstream -> client
    pub bytes_received: u64,
    pub closed_by: ClosedBy,
}

/// A hijacked client stream paired with its upstream stream
pub struct Tunnel<C, S> {
    client: C,
    upstream: S,
}

impl<C, S> Tunnel<C, S>
where
    C: AsyncRead + AsyncWrite + Unpin + Send,
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(client: C, upstream: S) -> Self {
        Self { client, upstream }
    }

    /// Relay until either side closes or errors
    ///
    /// `pending` is data the client sent before the hijack; it reaches the
    /// upstream before anything else. Both streams are shut down and dropped
    /// when this returns.
    #[instrument(skip_all, fields(pending = pending.len()))]
    pub async fn relay(self, pending: Bytes) -> Result<TunnelStats> {
        let Tunnel {
            client,
            mut upstream,
        } = self;

        if !pending.is_empty() {
            upstream
                .write_all(&pending)
                .await
                .map_err(|e| GatewayError::ForwardFailure(e.to_string()))?;
        }

        let (mut client_read, mut client_write) = tokio::io::split(client);
        let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

        let mut bytes_sent = pending.len() as u64;
        let mut bytes_received = 0u64;

        // Whichever copy finishes first drops the other, whose count is lost.
        let closed_by = tokio::select! {
            res = tokio::io::copy(&mut client_read, &mut upstream_write) => {
                bytes_sent += res.unwrap_or_else(|e| {
                    debug!("Client to upstream copy ended: {}", e);
                    0
                });
                ClosedBy::Client
            }
            res = tokio::io::copy(&mut upstream_read, &mut client_write) => {
                bytes_received = res.unwrap_or_else(|e| {
                    debug!("Upstream to client copy ended: {}", e);
                    0
                });
                ClosedBy::Upstream
            }
        };

        let _ = upstream_write.shutdown().await;
        let _ = client_write.shutdown().await;

        debug!(
            bytes_sent = bytes_sent,
            bytes_received = bytes_received,
            closed_by = ?closed_by,
            "Tunnel closed"
        );

        Ok(TunnelStats {
            bytes_sent,
            bytes_received,
            closed_by,
        })
    }
}
