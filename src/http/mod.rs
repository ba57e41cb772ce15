//! HTTP proxying subsystem.
//!
//! # Data Flow
//! ```text
//! Accepted TCP connection
//!     → server.rs (accept loop, one task per connection)
//!     → session.rs (TLS handshake, upstream pairing, request loop)
//!     → request.rs (Host / Connection / Upgrade rewrites)
//!     → upstream
//!     → response.rs (relay through buffer.rs, or gateway error)
//!     → upgrade.rs (byte tunnel after 101 Switching Protocols)
//! ```
//!
//! Each session is driven by the state machine in state.rs:
//! `HANDSHAKE → HTTP_STREAM ⇄ HANDSHAKE → TUNNEL → CLOSED_*`.

pub mod buffer;
pub mod request;
pub mod response;
pub mod server;
pub mod session;
pub mod state;
pub mod upgrade;

pub use server::ProxyServer;
pub use session::{ProxyContext, SessionError};
pub use state::{SessionEvent, SessionState};
