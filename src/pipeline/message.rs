//! Messages exchanged between pipeline handlers.
//!
//! Every HTTP-level message carries the sequence number of the request it
//! belongs to. Sequence numbers start at zero and count requests in arrival
//! order on one connection.

use bytes::Bytes;
use http::header::{HeaderMap, HeaderValue, CONNECTION, CONTENT_LENGTH};
use http::{Method, StatusCode, Uri, Version};

use crate::http::{Request, Response};

/// Request line and headers.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    pub keep_alive: bool,
}

/// Status line and headers.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderMap,
    /// The connection stays open once this response is written.
    pub keep_alive: bool,
    /// The response has no body regardless of its headers (HEAD, 1xx, 204, 304).
    pub bodiless: bool,
}

impl ResponseHead {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            keep_alive: true,
            bodiless: false,
        }
    }

    /// `400 Bad Request` with `Connection: close` and `Content-Length: 0`.
    pub fn bad_request() -> Self {
        let mut head = Self::new(StatusCode::BAD_REQUEST);
        head.headers
            .insert(CONNECTION, HeaderValue::from_static("close"));
        head.headers
            .insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
        head.keep_alive = false;
        head
    }

    /// Interim (1xx) responses other than `101` do not complete a request.
    pub fn is_informational(&self) -> bool {
        self.status.is_informational() && self.status != StatusCode::SWITCHING_PROTOCOLS
    }
}

/// Travels from the socket towards the application.
#[derive(Debug)]
pub enum Inbound {
    /// Raw bytes read from the socket.
    Bytes(Bytes),
    Head(u64, RequestHead),
    Body(u64, Bytes),
    End(u64),
    /// A fully collected request.
    Request(u64, Request),
    /// The final part of response `seq` has been handed to the socket.
    ResponseSent(u64),
    /// The server is shutting down; finish in-flight work and close.
    Quiesce,
    /// The peer closed its side of the connection.
    Eof,
}

/// Travels from the application towards the socket.
#[derive(Debug)]
pub enum Outbound {
    Response(u64, Response),
    Head(u64, ResponseHead),
    Body(u64, Bytes),
    End(u64),
    /// Request `seq` will never be answered; counts as ended for ordering.
    Abandon(u64),
    /// Serialized bytes ready for the socket.
    Bytes(Bytes),
}

impl Outbound {
    pub fn seq(&self) -> Option<u64> {
        match self {
            Outbound::Response(seq, _)
            | Outbound::Head(seq, _)
            | Outbound::Body(seq, _)
            | Outbound::End(seq)
            | Outbound::Abandon(seq) => Some(*seq),
            Outbound::Bytes(_) => None,
        }
    }
}
