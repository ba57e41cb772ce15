//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Root configuration for the TLS edge proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listener configuration (bind address, connection limit).
    pub listener: ListenerConfig,

    /// TLS termination material and policy.
    pub tls: TlsConfig,

    /// The single upstream every request is forwarded to.
    pub upstream: UpstreamConfig,

    /// Response buffering toward the client.
    pub buffers: BufferConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:443").
    pub bind_address: String,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:443".to_string(),
            max_connections: 10_000,
        }
    }
}

/// A TLS protocol version as written in the config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
pub enum TlsVersion {
    #[serde(rename = "TLSv1")]
    Tls10,
    #[serde(rename = "TLSv1.1")]
    Tls11,
    #[serde(rename = "TLSv1.2")]
    Tls12,
    #[serde(rename = "TLSv1.3")]
    Tls13,
}

impl TlsVersion {
    /// Whether the TLS stack can negotiate this version at all.
    ///
    /// rustls implements TLS 1.2 and 1.3 only; the legacy names are accepted
    /// so existing configurations parse, but they never widen the allow-set.
    pub fn is_negotiable(&self) -> bool {
        matches!(self, TlsVersion::Tls12 | TlsVersion::Tls13)
    }
}

impl fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TlsVersion::Tls10 => "TLSv1",
            TlsVersion::Tls11 => "TLSv1.1",
            TlsVersion::Tls12 => "TLSv1.2",
            TlsVersion::Tls13 => "TLSv1.3",
        };
        f.write_str(name)
    }
}

/// TLS configuration for the listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Path to certificate chain file (PEM).
    pub cert_path: String,

    /// Path to private key file (PEM).
    pub key_path: String,

    /// Protocol versions clients may negotiate.
    ///
    /// `TLSv1` and `TLSv1.1` are accepted here but never negotiated; they are
    /// ignored with a warning at startup, so listing them does not widen the
    /// accepted set. At least one of `TLSv1.2` or `TLSv1.3` is required.
    pub protocols: Vec<TlsVersion>,

    /// OpenSSL-style cipher policy (e.g., "HIGH:!aNULL:!MD5").
    pub ciphers: String,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert_path: "/etc/tls-edge-proxy/fullchain.pem".to_string(),
            key_path: "/etc/tls-edge-proxy/privkey.pem".to_string(),
            protocols: vec![TlsVersion::Tls12, TlsVersion::Tls13],
            ciphers: "HIGH:!aNULL:!MD5".to_string(),
        }
    }
}

/// Upstream server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Upstream address as `host:port`, spoken to over plain HTTP/1.1.
    pub address: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            address: "node:9944".to_string(),
        }
    }
}

/// Buffering of response data on its way to the client.
///
/// These values only change I/O granularity and per-session memory, never
/// the bytes delivered.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Number of buffers a session may have in flight toward the client.
    pub count: usize,

    /// Size of each buffer in bytes.
    pub size: usize,

    /// Size of the first buffer used for each response.
    pub initial_size: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            count: 16,
            size: 4096,
            initial_size: 2048,
        }
    }
}

/// Timeout configuration for various operations.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Upstream connection establishment timeout in seconds.
    pub connect_secs: u64,

    /// TLS handshake timeout in seconds.
    pub handshake_secs: u64,

    /// Time allowed for a client to send a complete request head, in seconds.
    pub header_read_secs: u64,

    /// How long live sessions may run after a shutdown signal, in seconds.
    pub shutdown_grace_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: 5,
            handshake_secs: 10,
            header_read_secs: 30,
            shutdown_grace_secs: 10,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error). `RUST_LOG` wins when set.
    pub log_level: String,

    /// Enable the Prometheus scrape endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
