//! Session state machine.
//!
//! ```text
//!              request                       101 + upgrade requested
//!   ┌──────────────────────────┐      ┌─────────────────────────────────▶ Tunnel
//!   ▼                          │      │                                     │
//! Handshake ───────────────────┼──────┤ any other status                    │
//!   ▲                          │      └─────────────────────▶ HttpStream ───┤
//!   └──────── request ─────────┴───────────────────────────────────┘        │
//!                                                                           ▼
//!                      peer closed → ClosedClean, failure → ClosedError
//! ```
//!
//! Terminal states absorb every further event.

use std::fmt;

use axum::http::StatusCode;

/// Where a proxied session is in its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Relaying a request head and waiting for the upstream response head.
    Handshake,
    /// Relaying a regular response; the next request returns to `Handshake`.
    HttpStream,
    /// Raw duplex byte relay; no further HTTP parsing.
    Tunnel,
    /// Either peer closed gracefully.
    ClosedClean,
    /// I/O error, malformed framing or protocol violation.
    ClosedError,
}

/// Something observed on the session that may move it to a new state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// A request head arrived from the client.
    Request,
    /// The upstream answered with a response head.
    Response {
        status: StatusCode,
        upgrade_requested: bool,
    },
    /// A peer closed the connection.
    Closed,
    /// The session failed.
    Failed,
}

/// A transition that is not allowed from the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid session transition from {from} on {event:?}")]
pub struct InvalidTransition {
    pub from: SessionState,
    pub event: SessionEvent,
}

impl SessionState {
    /// Whether the session has ended.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::ClosedClean | SessionState::ClosedError)
    }

    /// Compute the next state.
    ///
    /// A protocol violation (a request after tunnelling started, a response
    /// with no request outstanding, or an unsolicited 101) is an error; the
    /// caller moves the session to `ClosedError`.
    pub fn next(self, event: SessionEvent) -> Result<SessionState, InvalidTransition> {
        use SessionEvent as E;
        use SessionState as S;

        let invalid = Err(InvalidTransition { from: self, event });
        match (self, event) {
            (s, _) if s.is_terminal() => Ok(s),
            (_, E::Closed) => Ok(S::ClosedClean),
            (_, E::Failed) => Ok(S::ClosedError),
            (S::Handshake | S::HttpStream, E::Request) => Ok(S::Handshake),
            (
                S::Handshake,
                E::Response {
                    status,
                    upgrade_requested,
                },
            ) => {
                if status == StatusCode::SWITCHING_PROTOCOLS {
                    if upgrade_requested {
                        Ok(S::Tunnel)
                    } else {
                        invalid
                    }
                } else {
                    Ok(S::HttpStream)
                }
            }
            _ => invalid,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Handshake => "HANDSHAKE",
            SessionState::HttpStream => "HTTP_STREAM",
            SessionState::Tunnel => "TUNNEL",
            SessionState::ClosedClean => "CLOSED_CLEAN",
            SessionState::ClosedError => "CLOSED_ERROR",
        };
        f.write_str(name)
    }
}

/// Thread-safe holder of a session's current state.
#[derive(Debug)]
pub struct StateCell {
    inner: std::sync::Mutex<SessionState>,
}

impl StateCell {
    pub fn new() -> Self {
        Self {
            inner: std::sync::Mutex::new(SessionState::Handshake),
        }
    }

    pub fn get(&self) -> SessionState {
        *self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Apply an event. On an invalid transition the session is moved to
    /// `ClosedError` and the error is returned.
    pub fn apply(&self, event: SessionEvent) -> Result<SessionState, InvalidTransition> {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let from = *state;
        match from.next(event) {
            Ok(to) => {
                if to != from {
                    tracing::trace!(from = %from, to = %to, "Session state changed");
                }
                *state = to;
                Ok(to)
            }
            Err(e) => {
                *state = SessionState::ClosedError;
                Err(e)
            }
        }
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status: StatusCode, upgrade_requested: bool) -> SessionEvent {
        SessionEvent::Response {
            status,
            upgrade_requested,
        }
    }

    #[test]
    fn plain_exchange_streams_then_accepts_next_request() {
        let s = SessionState::Handshake;
        let s = s.next(response(StatusCode::OK, false)).unwrap();
        assert_eq!(s, SessionState::HttpStream);
        let s = s.next(SessionEvent::Request).unwrap();
        assert_eq!(s, SessionState::Handshake);
    }

    #[test]
    fn switching_protocols_enters_tunnel() {
        let s = SessionState::Handshake
            .next(response(StatusCode::SWITCHING_PROTOCOLS, true))
            .unwrap();
        assert_eq!(s, SessionState::Tunnel);
        assert_eq!(s.next(SessionEvent::Closed).unwrap(), SessionState::ClosedClean);
    }

    #[test]
    fn refused_upgrade_stays_http() {
        let s = SessionState::Handshake
            .next(response(StatusCode::BAD_REQUEST, true))
            .unwrap();
        assert_eq!(s, SessionState::HttpStream);
    }

    #[test]
    fn unsolicited_switch_is_rejected() {
        let err = SessionState::Handshake
            .next(response(StatusCode::SWITCHING_PROTOCOLS, false))
            .unwrap_err();
        assert_eq!(err.from, SessionState::Handshake);
    }

    #[test]
    fn no_http_after_tunnel() {
        assert!(SessionState::Tunnel.next(SessionEvent::Request).is_err());
        assert!(SessionState::HttpStream
            .next(response(StatusCode::OK, false))
            .is_err());
    }

    #[test]
    fn terminal_states_absorb_events() {
        for terminal in [SessionState::ClosedClean, SessionState::ClosedError] {
            assert_eq!(terminal.next(SessionEvent::Request).unwrap(), terminal);
            assert_eq!(terminal.next(SessionEvent::Failed).unwrap(), terminal);
        }
        assert_eq!(
            SessionState::HttpStream.next(SessionEvent::Failed).unwrap(),
            SessionState::ClosedError
        );
    }

    #[test]
    fn cell_moves_to_error_on_violation() {
        let cell = StateCell::new();
        cell.apply(response(StatusCode::SWITCHING_PROTOCOLS, true)).unwrap();
        assert_eq!(cell.get(), SessionState::Tunnel);

        assert!(cell.apply(SessionEvent::Request).is_err());
        assert_eq!(cell.get(), SessionState::ClosedError);
        assert_eq!(cell.get().to_string(), "CLOSED_ERROR");
    }
}
