//! Response values produced by the responder.
//!
//! # Responsibilities
//! - Carry status, headers and a [`ResponseBody`]
//! - Optionally carry an [`Upgrader`] that takes over the connection after a
//!   `101 Switching Protocols`
//! - Convert to and from `http::Response` for the axum bridge and HTTP/2

use std::fmt;

use axum::body::{Body, HttpBody};
use futures_util::StreamExt;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{StatusCode, Version};

use crate::http::body::ResponseBody;
use crate::pipeline::upgrade::Upgrader;

pub struct Response {
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: ResponseBody,
    upgrader: Option<Box<dyn Upgrader>>,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: ResponseBody::Empty,
            upgrader: None,
        }
    }

    pub fn ok(body: impl Into<ResponseBody>) -> Self {
        Self::new(StatusCode::OK).with_body(body)
    }

    pub fn with_body(mut self, body: impl Into<ResponseBody>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    /// A `101 Switching Protocols` response that hands the connection to
    /// `upgrader` once written.
    pub fn switching_protocols(protocol: HeaderValue, upgrader: impl Upgrader) -> Self {
        let mut response = Self::new(StatusCode::SWITCHING_PROTOCOLS);
        response
            .headers
            .insert(http::header::CONNECTION, HeaderValue::from_static("upgrade"));
        response.headers.insert(http::header::UPGRADE, protocol);
        response.upgrader = Some(Box::new(upgrader));
        response
    }

    pub fn has_upgrader(&self) -> bool {
        self.upgrader.is_some()
    }

    pub(crate) fn take_upgrader(&mut self) -> Option<Box<dyn Upgrader>> {
        self.upgrader.take()
    }

    /// Converts into an `http::Response` with an axum body.
    ///
    /// Any upgrader is dropped; upgrades only exist on HTTP/1 connections.
    pub fn into_http(self) -> http::Response<Body> {
        let body = if self.body.is_stream() {
            Body::from_stream(self.body.into_chunks())
        } else {
            let mut body = self.body;
            Body::from(body.buffer().unwrap_or_default())
        };
        let mut response = http::Response::new(body);
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

impl From<http::Response<Body>> for Response {
    fn from(response: http::Response<Body>) -> Self {
        let (parts, body) = response.into_parts();
        let count = HttpBody::size_hint(&body).exact().map(|n| n as usize);
        let body = if count == Some(0) {
            ResponseBody::Empty
        } else {
            ResponseBody::stream(count, move |mut writer| async move {
                let mut data = body.into_data_stream();
                while let Some(chunk) = data.next().await {
                    let written = match chunk {
                        Ok(bytes) => writer.write_bytes(bytes).await,
                        Err(error) => {
                            let _ = writer.fail(error).await;
                            return;
                        }
                    };
                    if written.is_err() {
                        return;
                    }
                }
                let _ = writer.end().await;
            })
        };

        Self {
            status: parts.status,
            version: parts.version,
            headers: parts.headers,
            body,
            upgrader: None,
        }
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("version", &self.version)
            .field("headers", &self.headers)
            .field("body", &self.body)
            .field("upgrade", &self.upgrader.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn converts_axum_response_with_declared_length() {
        let response: Response = http::Response::builder()
            .status(StatusCode::CREATED)
            .header("x-test", "1")
            .body(Body::from("created"))
            .unwrap()
            .into();

        assert_eq!(response.status, StatusCode::CREATED);
        assert_eq!(response.headers["x-test"], "1");
        assert_eq!(response.body.count(), Some(7));
        assert_eq!(&response.body.collect().await.unwrap()[..], b"created");
    }

    #[tokio::test]
    async fn into_http_keeps_streaming_bodies() {
        let response = Response::ok(ResponseBody::stream(None, |mut writer| async move {
            writer.write_bytes("a").await.unwrap();
            writer.write_bytes("b").await.unwrap();
            writer.end().await.unwrap();
        }));

        let http = response.into_http();
        let bytes = axum::body::to_bytes(http.into_body(), 1024).await.unwrap();
        assert_eq!(&bytes[..], b"ab");
    }
}
