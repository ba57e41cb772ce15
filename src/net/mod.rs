//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept, connection limit)
//!     → connection.rs (identity and live-session tracking)
//!     → tls.rs + cipher.rs (server config, protocol versions, cipher policy)
//!     → Hand off to the HTTP layer
//!
//! Per session, outbound:
//!     → upstream.rs (one TCP + HTTP/1.1 connection to the fixed upstream)
//! ```
//!
//! # Design Decisions
//! - Bounded accept: at most `max_connections` sessions at once
//! - TLS is mandatory; plaintext clients fail the handshake
//! - Upstream traffic is plaintext HTTP/1.1

pub mod cipher;
pub mod connection;
pub mod listener;
pub mod tls;
pub mod upstream;
