//! Startup orchestration.
//!
//! # Responsibilities
//! - Build the TLS acceptor from the configured certificate and policy
//! - Bind the listener and assemble the proxy server
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - TLS material is loaded before binding, so a bad certificate never
//!   leaves a listening socket behind
//! - The upstream is not contacted at startup; each session connects itself

use std::time::Duration;

use crate::config::{ConfigError, ProxyConfig};
use crate::http::{ProxyContext, ProxyServer};
use crate::net::listener::{Listener, ListenerError};
use crate::net::tls::{load_acceptor, TlsError};

/// Error type for startup.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("TLS setup failed: {0}")]
    Tls(#[from] TlsError),
    #[error(transparent)]
    Listener(#[from] ListenerError),
}

/// Initialize every subsystem and return a server ready to run.
pub async fn start(config: &ProxyConfig) -> Result<ProxyServer, StartupError> {
    let acceptor = load_acceptor(&config.tls)?;
    tracing::info!(
        protocols = ?config.tls.protocols,
        ciphers = %config.tls.ciphers,
        "TLS configured"
    );

    let context = ProxyContext::new(acceptor, config);
    let listener = Listener::bind(&config.listener).await?;

    Ok(ProxyServer::new(
        listener,
        context,
        Duration::from_secs(config.timeouts.shutdown_grace_secs),
    ))
}
