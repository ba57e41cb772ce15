//! Metrics collection and exposition.
//!
//! # Metrics
//! - `proxy_connections_total` (counter): accepted TCP connections
//! - `proxy_handshake_failures_total` (counter): TLS handshakes that failed, by reason
//! - `proxy_requests_total` (counter): forwarded requests by method and status
//! - `proxy_request_duration_seconds` (histogram): time to upstream response head
//! - `proxy_gateway_errors_total` (counter): gateway errors by status
//! - `proxy_tunnels_total` (counter): sessions that switched to tunnel mode
//! - `proxy_active_sessions` (gauge): current client connections
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade and is a no-op until a
//!   recorder is installed
//! - The Prometheus endpoint is opt-in; shipping metrics stays external

use std::net::SocketAddr;
use std::time::Instant;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and its scrape listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_connection_accepted() {
    ::metrics::counter!("proxy_connections_total").increment(1);
}

pub fn record_handshake_failure(reason: &'static str) {
    ::metrics::counter!("proxy_handshake_failures_total", "reason" => reason).increment(1);
}

/// Record a forwarded request once the upstream response head is known.
pub fn record_request(method: &str, status: u16, start: Instant) {
    let method = method.to_string();
    let status = status.to_string();
    ::metrics::counter!("proxy_requests_total", "method" => method.clone(), "status" => status.clone())
        .increment(1);
    ::metrics::histogram!("proxy_request_duration_seconds", "method" => method, "status" => status)
        .record(start.elapsed().as_secs_f64());
}

pub fn record_gateway_error(status: u16) {
    ::metrics::counter!("proxy_gateway_errors_total", "status" => status.to_string()).increment(1);
}

pub fn record_tunnel_opened() {
    ::metrics::counter!("proxy_tunnels_total").increment(1);
}

pub fn set_active_sessions(count: u64) {
    ::metrics::gauge!("proxy_active_sessions").set(count as f64);
}
