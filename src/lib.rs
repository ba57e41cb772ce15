//! TLS-terminating edge proxy library.
//!
//! Accepts TLS client connections, pairs each with one plaintext HTTP/1.1
//! connection to a fixed upstream, forwards requests with rewritten
//! forwarding headers and switches to a raw byte tunnel after a protocol
//! upgrade.

pub mod config;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;

pub use config::schema::ProxyConfig;
pub use http::ProxyServer;
pub use lifecycle::Shutdown;
