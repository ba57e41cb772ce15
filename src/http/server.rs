//! Accept loop and session supervision.
//!
//! # Responsibilities
//! - Accept client connections within the connection limit
//! - Spawn one session task per connection, with its own tracing span
//! - Keep accepting while individual sessions fail
//! - Drain live sessions on shutdown, aborting them after the grace period

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::Instrument;

use crate::http::session::{serve_connection, ProxyContext, SessionError};
use crate::net::connection::ConnectionTracker;
use crate::net::listener::{Listener, ListenerError};
use crate::observability::metrics;

/// Pause after a failed accept, so a persistent error (e.g. EMFILE) does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// The TLS-terminating proxy server.
pub struct ProxyServer {
    listener: Listener,
    context: Arc<ProxyContext>,
    tracker: ConnectionTracker,
    /// How long live sessions may keep running after shutdown is triggered.
    shutdown_grace: Duration,
}

impl ProxyServer {
    pub fn new(listener: Listener, context: ProxyContext, shutdown_grace: Duration) -> Self {
        Self {
            listener,
            context: Arc::new(context),
            tracker: ConnectionTracker::new(),
            shutdown_grace,
        }
    }

    /// The address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.listener.local_addr()
    }

    /// Live session counter.
    pub fn tracker(&self) -> &ConnectionTracker {
        &self.tracker
    }

    /// Accept and serve connections until `shutdown` fires.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> Result<(), ListenerError> {
        tracing::info!(
            address = ?self.listener.local_addr().ok(),
            upstream = %self.context.upstream.address(),
            "Proxy server starting"
        );

        let mut sessions = JoinSet::new();

        let result = loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer_addr, permit)) => {
                        metrics::record_connection_accepted();
                        let guard = self.tracker.track();
                        let span = tracing::info_span!(
                            "session",
                            connection_id = %guard.id(),
                            peer_addr = %peer_addr,
                        );
                        let context = Arc::clone(&self.context);
                        let session_shutdown = shutdown.resubscribe();

                        sessions.spawn(
                            async move {
                                let _permit = permit;
                                let _guard = guard;
                                log_outcome(serve_connection(context, stream, session_shutdown).await);
                            }
                            .instrument(span),
                        );
                    }
                    Err(ListenerError::Closed) => break Err(ListenerError::Closed),
                    Err(e) => {
                        tracing::warn!(error = %e, "Accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received, no longer accepting");
                    break Ok(());
                }
            }
        };

        self.drain(sessions).await;
        tracing::info!("Proxy server stopped");
        result
    }

    async fn drain(&self, mut sessions: JoinSet<()>) {
        if sessions.is_empty() {
            return;
        }

        tracing::info!(
            active_sessions = self.tracker.active_count(),
            grace = ?self.shutdown_grace,
            "Draining sessions"
        );

        let drained = tokio::time::timeout(self.shutdown_grace, async {
            while sessions.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            tracing::warn!(
                remaining = sessions.len(),
                "Grace period elapsed, aborting remaining sessions"
            );
            sessions.abort_all();
            while sessions.join_next().await.is_some() {}
        }
    }
}

fn log_outcome(outcome: Result<crate::http::state::SessionState, SessionError>) {
    match outcome {
        Ok(state) => tracing::debug!(state = %state, "Session finished"),
        Err(e @ (SessionError::Handshake(_) | SessionError::HandshakeTimeout(_))) => {
            tracing::info!(error = %e, "TLS handshake failed")
        }
        Err(e) => tracing::warn!(error = %e, "Session ended with error"),
    }
}
