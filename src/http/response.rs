//! Response relay and gateway errors.
//!
//! # Responsibilities
//! - Relay upstream status, headers and body to the client unchanged
//! - Route body data through the session's buffer pool
//! - Produce gateway-error responses when the upstream cannot be reached
//! - Refuse methods the proxy does not forward
//!
//! # Design Decisions
//! - Gateway errors always carry `Connection: close` so the client
//!   connection ends after them
//! - Framing (Content-Length / chunked) follows the upstream headers

use axum::body::Body;
use axum::http::header::{CONNECTION, CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{HeaderValue, Response, StatusCode};
use hyper::body::Incoming;

use crate::http::buffer::{BufferPool, PooledBody};

/// Build a gateway error (`502`/`504`) that closes the client connection.
pub fn gateway_error(status: StatusCode) -> Response<Body> {
    closing_response(status)
}

/// Refuse a `CONNECT`; the proxy only forwards to its fixed upstream.
pub fn method_not_allowed() -> Response<Body> {
    closing_response(StatusCode::METHOD_NOT_ALLOWED)
}

fn closing_response(status: StatusCode) -> Response<Body> {
    let text = format!(
        "{} {}\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("Error")
    );

    let mut response = Response::new(Body::from(text.clone()));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(text.len()));
    headers.insert(CONNECTION, HeaderValue::from_static("close"));
    response
}

/// Relay an upstream response, streaming its body through `pool`.
pub fn relay(response: Response<Incoming>, pool: BufferPool) -> Response<Body> {
    response.map(|body| Body::new(PooledBody::new(body, pool)))
}

/// Relay a `101 Switching Protocols` head; the connection then becomes a tunnel.
pub fn switching_protocols(response: Response<Incoming>) -> Response<Body> {
    response.map(|_| Body::empty())
}
