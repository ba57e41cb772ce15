//! Request preparation for the upstream.
//!
//! # Responsibilities
//! - Rewrite the three forwarding headers (`Host`, `Connection`, `Upgrade`)
//! - Normalize the request target to origin-form for the upstream
//! - Leave method, path, every other header and the body untouched
//!
//! # Design Decisions
//! - `Connection` is always replaced with `Upgrade`, for every request, so
//!   upgrade handshakes survive the hop; upstreams ignore it otherwise
//! - `Host` is what the client sent; the request-line authority is used only
//!   when the client sent no `Host`

use axum::body::Body;
use axum::http::header::{CONNECTION, HOST, UPGRADE};
use axum::http::{HeaderMap, HeaderValue, Request, Uri, Version};

/// The literal `Connection` value sent upstream.
pub const CONNECTION_UPGRADE: HeaderValue = HeaderValue::from_static("Upgrade");

/// Whether the client asked to switch protocols.
pub fn wants_upgrade(headers: &HeaderMap) -> bool {
    headers.contains_key(UPGRADE)
}

/// Apply the forwarding header rewrites in place.
pub fn rewrite_headers(headers: &mut HeaderMap, uri: &Uri) {
    if !headers.contains_key(HOST) {
        if let Some(value) = uri
            .authority()
            .and_then(|authority| HeaderValue::from_str(authority.as_str()).ok())
        {
            headers.insert(HOST, value);
        }
    }

    // `insert` drops every existing Connection value.
    headers.insert(CONNECTION, CONNECTION_UPGRADE);
}

/// Reduce an absolute-form target to origin-form (`/path?query`).
fn origin_form(uri: &Uri) -> Uri {
    match uri.path_and_query() {
        Some(_) if uri.scheme().is_none() && uri.authority().is_none() => uri.clone(),
        Some(pq) => pq.as_str().parse().unwrap_or_else(|_| uri.clone()),
        None => Uri::from_static("/"),
    }
}

/// Turn a client request into the request sent to the upstream.
///
/// Extensions are carried over so header casing recorded by the server side
/// is reproduced on the upstream connection.
pub fn forwarded_request(request: Request<Body>) -> Request<Body> {
    let (mut parts, body) = request.into_parts();
    rewrite_headers(&mut parts.headers, &parts.uri);
    parts.uri = origin_form(&parts.uri);
    parts.version = Version::HTTP_11;
    Request::from_parts(parts, body)
}
