//! The single upstream target.
//!
//! # Responsibilities
//! - Hold the fixed `host:port` every session forwards to
//! - Resolve and connect once per client connection, under a deadline
//! - Perform the HTTP/1.1 client handshake on the fresh socket
//!
//! # Design Decisions
//! - The name is resolved on every connect, so DNS changes are picked up
//! - No retries: one failed connect is one gateway error
//! - Refused/unresolvable maps to 502, a missed deadline to 504

use std::future::Future;
use std::time::Duration;

use axum::body::Body;
use axum::http::StatusCode;
use hyper::client::conn::http1::{self, Connection, SendRequest};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;

use crate::config::UpstreamConfig;

/// Error type for upstream connectivity.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("Upstream {address} unreachable: {source}")]
    Unreachable {
        address: String,
        source: std::io::Error,
    },
    #[error("Upstream {address} did not accept within {timeout:?}")]
    Timeout { address: String, timeout: Duration },
    #[error("HTTP handshake with upstream {address} failed: {source}")]
    Handshake {
        address: String,
        source: hyper::Error,
    },
}

impl UpstreamError {
    /// The gateway status reported to the client for this failure.
    pub fn status(&self) -> StatusCode {
        match self {
            UpstreamError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::BAD_GATEWAY,
        }
    }
}

/// A connected upstream: the request handle plus the connection driver.
pub type UpstreamConnection = (SendRequest<Body>, Connection<TokioIo<TcpStream>, Body>);

/// The fixed upstream every request is forwarded to.
#[derive(Debug, Clone)]
pub struct UpstreamTarget {
    address: String,
    connect_timeout: Duration,
}

impl UpstreamTarget {
    /// Create a target from configuration.
    pub fn new(config: &UpstreamConfig, connect_timeout: Duration) -> Self {
        Self {
            address: config.address.clone(),
            connect_timeout,
        }
    }

    /// The configured `host:port`.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Open a TCP connection to the upstream.
    pub async fn connect(&self) -> Result<TcpStream, UpstreamError> {
        let stream = self
            .within_deadline(TcpStream::connect(&self.address))
            .await?;

        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "Failed to set TCP_NODELAY on upstream socket");
        }

        Ok(stream)
    }

    /// Run a connect attempt under the configured deadline.
    async fn within_deadline<F>(&self, connect: F) -> Result<TcpStream, UpstreamError>
    where
        F: Future<Output = std::io::Result<TcpStream>>,
    {
        tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| UpstreamError::Timeout {
                address: self.address.clone(),
                timeout: self.connect_timeout,
            })?
            .map_err(|source| UpstreamError::Unreachable {
                address: self.address.clone(),
                source,
            })
    }

    /// Connect and perform the HTTP/1.1 client handshake.
    ///
    /// The returned connection must be polled (with upgrades enabled) for
    /// the request handle to make progress.
    pub async fn open(&self) -> Result<UpstreamConnection, UpstreamError> {
        let stream = self.connect().await?;
        let peer = stream.peer_addr().ok();

        let connection = http1::Builder::new()
            .preserve_header_case(true)
            .handshake(TokioIo::new(stream))
            .await
            .map_err(|source| UpstreamError::Handshake {
                address: self.address.clone(),
                source,
            })?;

        tracing::debug!(upstream = %self.address, peer = ?peer, "Upstream connection established");
        Ok(connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn target(address: String) -> UpstreamTarget {
        UpstreamTarget::new(&UpstreamConfig { address }, Duration::from_secs(2))
    }

    #[tokio::test]
    async fn connects_to_listening_upstream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let upstream = target(addr.to_string());
        let (stream, accepted) = tokio::join!(upstream.connect(), listener.accept());
        assert!(stream.is_ok());
        assert!(accepted.is_ok());
    }

    #[tokio::test]
    async fn refused_connection_is_bad_gateway() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = target(addr.to_string()).open().await.err().unwrap();
        assert!(matches!(err, UpstreamError::Unreachable { .. }));
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn missed_connect_deadline_is_gateway_timeout() {
        let upstream = UpstreamTarget::new(
            &UpstreamConfig {
                address: "node:9944".into(),
            },
            Duration::from_millis(50),
        );

        let err = upstream
            .within_deadline(std::future::pending())
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            UpstreamError::Timeout { timeout, .. } if timeout == Duration::from_millis(50)
        ));
        assert_eq!(err.status(), StatusCode::GATEWAY_TIMEOUT);
    }
}
