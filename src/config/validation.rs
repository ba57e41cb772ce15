//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, ports valid, buffers non-empty)
//! - Check the TLS protocol set can actually be negotiated
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system
//! - Certificate files are checked when loaded, not here

use std::net::SocketAddr;

use crate::config::schema::ProxyConfig;

/// A single semantic problem with the configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    /// Dotted path of the offending field (e.g., "buffers.size").
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

/// Validate a parsed configuration, collecting every error.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("'{}' is not a socket address", config.listener.bind_address),
        ));
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::new("listener.max_connections", "must be greater than 0"));
    }

    if config.tls.cert_path.is_empty() {
        errors.push(ValidationError::new("tls.cert_path", "must not be empty"));
    }
    if config.tls.key_path.is_empty() {
        errors.push(ValidationError::new("tls.key_path", "must not be empty"));
    }
    if config.tls.protocols.is_empty() {
        errors.push(ValidationError::new("tls.protocols", "must list at least one version"));
    } else if !config.tls.protocols.iter().any(|v| v.is_negotiable()) {
        errors.push(ValidationError::new(
            "tls.protocols",
            "must include TLSv1.2 or TLSv1.3",
        ));
    }
    if config.tls.ciphers.trim().is_empty() {
        errors.push(ValidationError::new("tls.ciphers", "must not be empty"));
    }

    if let Err(message) = check_host_port(&config.upstream.address) {
        errors.push(ValidationError::new("upstream.address", message));
    }

    let buffers = &config.buffers;
    if buffers.count == 0 {
        errors.push(ValidationError::new("buffers.count", "must be greater than 0"));
    }
    if buffers.size == 0 {
        errors.push(ValidationError::new("buffers.size", "must be greater than 0"));
    }
    if buffers.initial_size == 0 {
        errors.push(ValidationError::new("buffers.initial_size", "must be greater than 0"));
    }

    let timeouts = &config.timeouts;
    for (field, value) in [
        ("timeouts.connect_secs", timeouts.connect_secs),
        ("timeouts.handshake_secs", timeouts.handshake_secs),
        ("timeouts.header_read_secs", timeouts.header_read_secs),
    ] {
        if value == 0 {
            errors.push(ValidationError::new(field, "must be greater than 0"));
        }
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("'{}' is not a socket address", config.observability.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Check that an address has the shape `host:port`.
fn check_host_port(address: &str) -> Result<(), String> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| format!("'{}' must be host:port", address))?;
    if host.is_empty() {
        return Err(format!("'{}' has an empty host", address));
    }
    match port.parse::<u16>() {
        Ok(0) | Err(_) => Err(format!("'{}' has an invalid port", address)),
        Ok(_) => Ok(()),
    }
}
