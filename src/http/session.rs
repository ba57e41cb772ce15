//! One proxied session per client connection.
//!
//! # Responsibilities
//! - Complete the TLS handshake under a deadline
//! - Open the single upstream connection this client is paired with
//! - Serve the client's HTTP/1.1 requests sequentially, forwarding each one
//! - Hand the connection over to a tunnel after a successful upgrade
//! - Tear everything down when either side goes away
//!
//! # Data Flow
//! ```text
//! TcpStream → TLS handshake → upstream connect
//!     ├─ reachable:   serve requests → forward() → upstream → relay response
//!     │                                    └─ 101 → tunnel task
//!     └─ unreachable: serve one request → gateway error → close
//! ```
//!
//! # Design Decisions
//! - The upstream connection driver and the tunnel are owned by the session
//!   task and aborted when it returns
//! - Requests are forwarded one at a time over the same upstream connection

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{Method, Response, StatusCode};
use axum::Router;
use hyper::client::conn::http1::SendRequest;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::{TokioIo, TokioTimer};
use hyper_util::service::TowerToHyperService;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::task::{JoinError, JoinHandle};
use tokio_rustls::TlsAcceptor;
use tower_http::trace::TraceLayer;

use crate::config::{BufferConfig, ProxyConfig};
use crate::http::buffer::BufferPool;
use crate::http::state::{SessionEvent, SessionState, StateCell};
use crate::http::upgrade::{self, TunnelError};
use crate::http::{request, response};
use crate::net::cipher::suite_name;
use crate::net::upstream::UpstreamTarget;
use crate::observability::metrics;

/// Error type for a single client session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("TLS handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),
    #[error("TLS handshake failed: {0}")]
    Handshake(std::io::Error),
    #[error("HTTP protocol error: {0}")]
    Protocol(#[from] hyper::Error),
    #[error(transparent)]
    Tunnel(#[from] TunnelError),
    #[error("Tunnel task failed: {0}")]
    Task(#[from] JoinError),
}

/// Read-only state shared by every session.
pub struct ProxyContext {
    pub acceptor: TlsAcceptor,
    pub upstream: UpstreamTarget,
    pub buffers: BufferConfig,
    pub handshake_timeout: Duration,
    pub header_read_timeout: Duration,
}

impl ProxyContext {
    pub fn new(acceptor: TlsAcceptor, config: &ProxyConfig) -> Self {
        let timeouts = &config.timeouts;
        Self {
            acceptor,
            upstream: UpstreamTarget::new(
                &config.upstream,
                Duration::from_secs(timeouts.connect_secs),
            ),
            buffers: config.buffers.clone(),
            handshake_timeout: Duration::from_secs(timeouts.handshake_secs),
            header_read_timeout: Duration::from_secs(timeouts.header_read_secs),
        }
    }
}

/// A spawned task that is aborted when dropped.
struct OwnedTask<T>(JoinHandle<T>);

impl<T> Future for OwnedTask<T> {
    type Output = Result<T, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx)
    }
}

impl<T> Drop for OwnedTask<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

enum Upstream {
    Connected(tokio::sync::Mutex<SendRequest<Body>>),
    /// The upstream could not be reached; every request gets this status.
    Unavailable(StatusCode),
}

/// Per-connection state shared with the request handler.
struct Session {
    upstream: Upstream,
    state: StateCell,
    pool: BufferPool,
    tunnel_buffer_size: usize,
    upgrade_in_flight: AtomicBool,
    tunnel: Mutex<Option<OwnedTask<Result<upgrade::TunnelSummary, TunnelError>>>>,
}

impl Session {
    fn start_tunnel(&self, client: OnUpgrade, upstream: OnUpgrade) {
        let size = self.tunnel_buffer_size;
        let handle = tokio::spawn(upgrade::run_tunnel(client, upstream, size));
        metrics::record_tunnel_opened();
        tracing::info!("Switching to tunnel mode");

        if let Ok(mut tunnel) = self.tunnel.lock() {
            *tunnel = Some(OwnedTask(handle));
        }
    }

    fn take_tunnel(&self) -> Option<OwnedTask<Result<upgrade::TunnelSummary, TunnelError>>> {
        self.tunnel.lock().ok().and_then(|mut tunnel| tunnel.take())
    }

    /// Whether the session is handing its connection over to a tunnel.
    fn is_upgrading(&self) -> bool {
        self.upgrade_in_flight.load(Ordering::SeqCst) || self.state.get() == SessionState::Tunnel
    }

    fn fail(&self, status: StatusCode) -> Response<Body> {
        let _ = self.state.apply(SessionEvent::Failed);
        metrics::record_gateway_error(status.as_u16());
        response::gateway_error(status)
    }
}

/// Forward one client request to the paired upstream connection.
async fn forward(State(session): State<Arc<Session>>, mut request: Request) -> Response<Body> {
    let start = Instant::now();
    let method = request.method().clone();
    let upgrade_requested = request::wants_upgrade(request.headers());

    match session.state.apply(SessionEvent::Request) {
        Ok(state) if !state.is_terminal() => {}
        Ok(_) => return session.fail(StatusCode::BAD_GATEWAY),
        Err(e) => {
            tracing::warn!(error = %e, "Request outside of an HTTP exchange");
            return session.fail(StatusCode::BAD_GATEWAY);
        }
    }

    if method == Method::CONNECT {
        tracing::debug!(uri = %request.uri(), "Refusing CONNECT");
        let _ = session.state.apply(SessionEvent::Response {
            status: StatusCode::METHOD_NOT_ALLOWED,
            upgrade_requested: false,
        });
        return response::method_not_allowed();
    }

    let sender = match &session.upstream {
        Upstream::Connected(sender) => sender,
        Upstream::Unavailable(status) => return session.fail(*status),
    };

    let client_upgrade = upgrade_requested.then(|| hyper::upgrade::on(&mut request));
    let upstream_request = request::forwarded_request(request);

    session
        .upgrade_in_flight
        .store(upgrade_requested, Ordering::SeqCst);

    let result = {
        let mut sender = sender.lock().await;
        match sender.ready().await {
            Ok(()) => sender.send_request(upstream_request).await,
            Err(e) => Err(e),
        }
    };

    let mut upstream_response = match result {
        Ok(upstream_response) => upstream_response,
        Err(e) => {
            session.upgrade_in_flight.store(false, Ordering::SeqCst);
            tracing::warn!(method = %method, error = %e, "Upstream request failed");
            return session.fail(StatusCode::BAD_GATEWAY);
        }
    };

    let status = upstream_response.status();
    metrics::record_request(method.as_str(), status.as_u16(), start);

    let event = SessionEvent::Response {
        status,
        upgrade_requested,
    };
    let relayed = match (session.state.apply(event), client_upgrade) {
        (Ok(SessionState::Tunnel), Some(client_upgrade)) => {
            let upstream_upgrade = hyper::upgrade::on(&mut upstream_response);
            session.start_tunnel(client_upgrade, upstream_upgrade);
            response::switching_protocols(upstream_response)
        }
        (Ok(SessionState::Tunnel), None) | (Ok(SessionState::ClosedError), _) => {
            session.fail(StatusCode::BAD_GATEWAY)
        }
        (Ok(_), _) => response::relay(upstream_response, session.pool.clone()),
        (Err(e), _) => {
            tracing::warn!(status = %status, error = %e, "Upstream switched protocols unasked");
            session.fail(StatusCode::BAD_GATEWAY)
        }
    };

    session.upgrade_in_flight.store(false, Ordering::SeqCst);
    relayed
}

/// Run one client connection to completion.
///
/// Returns the terminal state of the session, or the error that ended it.
pub async fn serve_connection(
    context: Arc<ProxyContext>,
    stream: TcpStream,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<SessionState, SessionError> {
    let handshake = context.acceptor.accept(stream);
    let tls = match tokio::time::timeout(context.handshake_timeout, handshake).await {
        Ok(Ok(tls)) => tls,
        Ok(Err(e)) => {
            metrics::record_handshake_failure("rejected");
            return Err(SessionError::Handshake(e));
        }
        Err(_) => {
            metrics::record_handshake_failure("timeout");
            return Err(SessionError::HandshakeTimeout(context.handshake_timeout));
        }
    };

    {
        let (_, connection) = tls.get_ref();
        tracing::debug!(
            protocol = ?connection.protocol_version(),
            cipher = ?connection.negotiated_cipher_suite().map(|s| suite_name(s.suite())),
            "TLS handshake complete"
        );
    }

    let (upstream, mut driver) = match context.upstream.open().await {
        Ok((sender, connection)) => {
            let driver = OwnedTask(tokio::spawn(connection.with_upgrades()));
            (Upstream::Connected(tokio::sync::Mutex::new(sender)), Some(driver))
        }
        Err(e) => {
            tracing::warn!(error = %e, "Upstream unavailable");
            (Upstream::Unavailable(e.status()), None)
        }
    };
    let upstream_available = driver.is_some();

    let session = Arc::new(Session {
        upstream,
        state: StateCell::new(),
        pool: BufferPool::new(&context.buffers),
        tunnel_buffer_size: context.buffers.size,
        upgrade_in_flight: AtomicBool::new(false),
        tunnel: Mutex::new(None),
    });

    let router = Router::new()
        .fallback(forward)
        .with_state(Arc::clone(&session))
        .layer(TraceLayer::new_for_http());

    let mut builder = hyper::server::conn::http1::Builder::new();
    builder
        .timer(TokioTimer::new())
        .header_read_timeout(context.header_read_timeout)
        .preserve_header_case(true)
        .keep_alive(upstream_available);

    let connection = builder
        .serve_connection(TokioIo::new(tls), TowerToHyperService::new(router))
        .with_upgrades();
    tokio::pin!(connection);

    let upstream_closed = async {
        match driver.as_mut() {
            Some(driver) => {
                if let Ok(Err(e)) = driver.await {
                    tracing::debug!(error = %e, "Upstream connection error");
                }
            }
            None => std::future::pending::<()>().await,
        }
    };

    let served = tokio::select! {
        result = connection.as_mut() => result,
        _ = upstream_closed => {
            if !session.is_upgrading() {
                tracing::debug!("Upstream closed, shutting down client connection");
                connection.as_mut().graceful_shutdown();
            }
            connection.as_mut().await
        }
        Ok(()) = shutdown.recv() => {
            connection.as_mut().graceful_shutdown();
            connection.as_mut().await
        }
    };

    if let Err(e) = served {
        let _ = session.state.apply(SessionEvent::Failed);
        return Err(SessionError::Protocol(e));
    }

    if let Some(tunnel) = session.take_tunnel() {
        match tunnel.await? {
            Ok(_) => {}
            Err(e) => {
                let _ = session.state.apply(SessionEvent::Failed);
                return Err(SessionError::Tunnel(e));
            }
        }
    }

    let _ = session.state.apply(SessionEvent::Closed);
    Ok(session.state.get())
}
