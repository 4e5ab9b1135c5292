//! Request values handed to the responder.
//!
//! # Design Decisions
//! - Requests are plain `http::Request`s with a fully collected body
//! - Connection metadata travels in request extensions

use std::net::SocketAddr;

use bytes::Bytes;
use http::header::{self, HeaderMap};
use http::Version;

/// A fully received request.
pub type Request = http::Request<Bytes>;

/// Remote address of the connection a request arrived on.
///
/// `None` for Unix domain sockets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAddr(pub Option<SocketAddr>);

/// Whether the connection may be reused after answering a request with these
/// headers.
///
/// HTTP/1.1 defaults to keep-alive unless `Connection: close` is present;
/// HTTP/1.0 requires an explicit `Connection: keep-alive`.
pub fn is_keep_alive(version: Version, headers: &HeaderMap) -> bool {
    let mut close = false;
    let mut keep_alive = false;
    for token in connection_tokens(headers) {
        close |= token.eq_ignore_ascii_case("close");
        keep_alive |= token.eq_ignore_ascii_case("keep-alive");
    }
    match version {
        Version::HTTP_10 | Version::HTTP_09 => keep_alive && !close,
        _ => !close,
    }
}

/// Whether a `Connection` header lists `close`.
pub fn wants_close(headers: &HeaderMap) -> bool {
    connection_tokens(headers).any(|token| token.eq_ignore_ascii_case("close"))
}

fn connection_tokens(headers: &HeaderMap) -> impl Iterator<Item = &str> {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
}

/// Whether `headers` carry a `Connection: upgrade` token together with an
/// `Upgrade` header.
pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    headers.contains_key(header::UPGRADE)
        && connection_tokens(headers).any(|token| token.eq_ignore_ascii_case("upgrade"))
}
