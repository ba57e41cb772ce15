//! Protocol upgrade tunnelling.
//!
//! # Responsibilities
//! - Wait for both sides of a `101 Switching Protocols` exchange to hand
//!   over their connections
//! - Relay bytes in both directions without interpreting them
//! - Tear the tunnel down as soon as either side closes or fails
//!
//! # Data Flow
//! ```text
//! Client ←──── raw bytes ────→ Proxy ←──── raw bytes ────→ Upstream
//! ```
//!
//! # Design Decisions
//! - Byte-level relay: WebSocket or any other upgraded protocol passes through
//! - Each direction copies through a buffer of the configured size
//! - No half-close: the first direction to finish ends the whole tunnel

use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

/// Error type for tunnel setup and relay.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("Upgrade handover failed: {0}")]
    Upgrade(#[from] hyper::Error),
    #[error("Tunnel I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Which direction ended the tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToUpstream,
    UpstreamToClient,
}

/// Summary of a finished tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelSummary {
    /// The direction that finished first.
    pub closed_by: Direction,
    /// Bytes relayed by that direction.
    pub bytes: u64,
}

/// Complete both upgrades and relay between them until one side closes.
pub async fn run_tunnel(
    client: OnUpgrade,
    upstream: OnUpgrade,
    buffer_size: usize,
) -> Result<TunnelSummary, TunnelError> {
    let (client, upstream) = tokio::try_join!(client, upstream)?;
    tracing::debug!("Tunnel established");
    relay(TokioIo::new(client), TokioIo::new(upstream), buffer_size).await
}

/// Relay bytes between two streams until either direction finishes.
pub async fn relay<C, U>(client: C, upstream: U, buffer_size: usize) -> Result<TunnelSummary, TunnelError>
where
    C: AsyncRead + AsyncWrite,
    U: AsyncRead + AsyncWrite,
{
    let (client_read, mut client_write) = tokio::io::split(client);
    let (upstream_read, mut upstream_write) = tokio::io::split(upstream);
    let mut client_read = BufReader::with_capacity(buffer_size, client_read);
    let mut upstream_read = BufReader::with_capacity(buffer_size, upstream_read);

    let (closed_by, result) = tokio::select! {
        result = tokio::io::copy_buf(&mut client_read, &mut upstream_write) => {
            (Direction::ClientToUpstream, result)
        }
        result = tokio::io::copy_buf(&mut upstream_read, &mut client_write) => {
            (Direction::UpstreamToClient, result)
        }
    };

    let _ = upstream_write.shutdown().await;
    let _ = client_write.shutdown().await;

    let bytes = result?;
    tracing::debug!(closed_by = ?closed_by, bytes, "Tunnel closed");
    Ok(TunnelSummary { closed_by, bytes })
}
