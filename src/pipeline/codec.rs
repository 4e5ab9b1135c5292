//! Translation between wire parts and application values.
//!
//! The request decoder gathers head, body and end parts into one
//! [`Request`](crate::http::Request). The response encoder does the reverse
//! for a [`Response`], adding the headers every HTTP/1 response needs.

use std::collections::HashMap;
use std::net::SocketAddr;

use bytes::BytesMut;
use futures_util::stream::{self, StreamExt};
use http::header::{HeaderValue, CONNECTION, CONTENT_LENGTH, DATE, EXPECT, SERVER};
use http::{Method, StatusCode, Version};

use super::engine::{Context, Handler};
use super::error::PipelineError;
use super::message::{Inbound, Outbound, RequestHead, ResponseHead};
use crate::http::{date, PeerAddr, Response, ResponseBody};

pub const RESPONSE_ENCODER: &str = "response-encoder";
pub const REQUEST_DECODER: &str = "request-decoder";

#[derive(Debug, Clone, Copy)]
struct RequestInfo {
    head: bool,
    version: Version,
    keep_alive: bool,
}

/// Turns [`Response`]s into response parts.
#[derive(Debug)]
pub struct ResponseEncoder {
    server_name: Option<HeaderValue>,
    requests: HashMap<u64, RequestInfo>,
}

impl ResponseEncoder {
    pub fn new(server_name: Option<&str>) -> Self {
        let server_name = server_name.and_then(|name| match HeaderValue::from_str(name) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(server_name = name, "Ignoring invalid server name");
                None
            }
        });
        Self {
            server_name,
            requests: HashMap::new(),
        }
    }

    fn encode(&mut self, ctx: &mut Context<'_>, seq: u64, mut response: Response) {
        let info = self.requests.remove(&seq).unwrap_or(RequestInfo {
            head: false,
            version: Version::HTTP_11,
            keep_alive: false,
        });

        let status = response.status;
        let bodiless = info.head
            || status.is_informational()
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED;

        let headers = &mut response.headers;
        if !headers.contains_key(DATE) {
            headers.insert(DATE, date::http_date());
        }
        if let Some(server) = &self.server_name {
            if !headers.contains_key(SERVER) {
                headers.insert(SERVER, server.clone());
            }
        }
        let sized = !status.is_informational()
            && status != StatusCode::NO_CONTENT
            && status != StatusCode::NOT_MODIFIED;
        if sized && !headers.contains_key(CONTENT_LENGTH) {
            if let Some(count) = response.body.count() {
                headers.insert(CONTENT_LENGTH, HeaderValue::from(count));
            }
        }
        let keep_alive = info.keep_alive && !crate::http::request::wants_close(headers);
        if !keep_alive {
            headers.insert(CONNECTION, HeaderValue::from_static("close"));
        }

        let head = ResponseHead {
            status,
            version: info.version,
            headers: std::mem::take(&mut response.headers),
            keep_alive,
            bodiless,
        };
        ctx.fire_outbound(Outbound::Head(seq, head));

        let body = std::mem::take(&mut response.body);
        if bodiless {
            ctx.fire_outbound(Outbound::End(seq));
            return;
        }
        match body {
            ResponseBody::Stream(stream) => {
                let chunks = stream.into_chunks();
                let parts = stream::unfold(Some(chunks), move |chunks| async move {
                    let mut chunks = chunks?;
                    match chunks.next().await {
                        Some(Ok(data)) => Some((Ok(Outbound::Body(seq, data)), Some(chunks))),
                        Some(Err(source)) => Some((Err(PipelineError::Body { seq, source }), None)),
                        None => Some((Ok(Outbound::End(seq)), None)),
                    }
                });
                ctx.spawn(parts.boxed());
            }
            mut body => {
                let data = body.buffer().unwrap_or_default();
                if !data.is_empty() {
                    ctx.fire_outbound(Outbound::Body(seq, data));
                }
                ctx.fire_outbound(Outbound::End(seq));
            }
        }
    }
}

impl Handler for ResponseEncoder {
    fn name(&self) -> &'static str {
        RESPONSE_ENCODER
    }

    fn inbound(&mut self, ctx: &mut Context<'_>, msg: Inbound) {
        if let Inbound::Head(seq, head) = &msg {
            self.requests.insert(
                *seq,
                RequestInfo {
                    head: head.method == Method::HEAD,
                    version: head.version,
                    keep_alive: head.keep_alive,
                },
            );
        }
        ctx.fire_inbound(msg);
    }

    fn outbound(&mut self, ctx: &mut Context<'_>, msg: Outbound) {
        match msg {
            Outbound::Response(seq, response) => self.encode(ctx, seq, response),
            other => ctx.fire_outbound(other),
        }
    }
}

struct Collecting {
    head: RequestHead,
    body: BytesMut,
}

/// Gathers request parts into complete requests.
pub struct RequestDecoder {
    peer: Option<SocketAddr>,
    collecting: HashMap<u64, Collecting>,
}

impl RequestDecoder {
    pub fn new(peer: Option<SocketAddr>) -> Self {
        Self {
            peer,
            collecting: HashMap::new(),
        }
    }
}

impl Handler for RequestDecoder {
    fn name(&self) -> &'static str {
        REQUEST_DECODER
    }

    fn inbound(&mut self, ctx: &mut Context<'_>, msg: Inbound) {
        match msg {
            Inbound::Head(seq, head) => {
                let expects_continue = head.version == Version::HTTP_11
                    && head
                        .headers
                        .get(EXPECT)
                        .is_some_and(|v| v.as_bytes().eq_ignore_ascii_case(b"100-continue"));
                if expects_continue {
                    ctx.fire_outbound(Outbound::Head(seq, ResponseHead::new(StatusCode::CONTINUE)));
                }
                self.collecting.insert(
                    seq,
                    Collecting {
                        head,
                        body: BytesMut::new(),
                    },
                );
            }
            Inbound::Body(seq, data) => match self.collecting.get_mut(&seq) {
                Some(collecting) => collecting.body.extend_from_slice(&data),
                None => tracing::warn!(seq, "Request body without a head"),
            },
            Inbound::End(seq) => {
                let Some(Collecting { head, body }) = self.collecting.remove(&seq) else {
                    tracing::warn!(seq, "Request end without a head");
                    return;
                };
                let mut request = http::Request::new(body.freeze());
                *request.method_mut() = head.method;
                *request.uri_mut() = head.uri;
                *request.version_mut() = head.version;
                *request.headers_mut() = head.headers;
                request.extensions_mut().insert(PeerAddr(self.peer));
                ctx.fire_inbound(Inbound::Request(seq, request));
            }
            other => ctx.fire_inbound(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::engine::Pipeline;
    use bytes::Bytes;
    use http::header::HeaderMap;
    use http::Uri;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Sink(Arc<Mutex<Vec<Outbound>>>);

    impl Handler for Sink {
        fn name(&self) -> &'static str {
            "sink"
        }

        fn outbound(&mut self, _ctx: &mut Context<'_>, msg: Outbound) {
            self.0.lock().unwrap().push(msg);
        }
    }

    fn head(method: Method, version: Version, keep_alive: bool) -> RequestHead {
        RequestHead {
            method,
            uri: Uri::from_static("/"),
            version,
            headers: HeaderMap::new(),
            keep_alive,
        }
    }

    fn encoder_pipeline() -> (Pipeline, Sink) {
        let sink = Sink::default();
        let pipeline = Pipeline::new(vec![
            Box::new(sink.clone()),
            Box::new(ResponseEncoder::new(Some("harbor"))),
        ]);
        (pipeline, sink)
    }

    #[test]
    fn adds_length_date_and_server() {
        let (mut pipeline, sink) = encoder_pipeline();
        pipeline.fire_inbound(Inbound::Head(0, head(Method::GET, Version::HTTP_11, true)));
        pipeline.fire_outbound(Outbound::Response(0, Response::ok("hello")));

        let parts = sink.0.lock().unwrap();
        let Outbound::Head(0, head) = &parts[0] else {
            panic!("expected head, got {:?}", parts[0]);
        };
        assert_eq!(head.headers[CONTENT_LENGTH], "5");
        assert_eq!(head.headers[SERVER], "harbor");
        assert!(head.headers.contains_key(DATE));
        assert!(head.keep_alive);
        assert!(matches!(&parts[1], Outbound::Body(0, data) if &data[..] == b"hello"));
        assert!(matches!(parts[2], Outbound::End(0)));
    }

    #[test]
    fn head_request_keeps_length_but_drops_body() {
        let (mut pipeline, sink) = encoder_pipeline();
        pipeline.fire_inbound(Inbound::Head(0, head(Method::HEAD, Version::HTTP_11, true)));
        pipeline.fire_outbound(Outbound::Response(0, Response::ok("hello")));

        let parts = sink.0.lock().unwrap();
        assert_eq!(parts.len(), 2);
        assert!(matches!(&parts[0], Outbound::Head(0, head) if head.bodiless && head.headers[CONTENT_LENGTH] == "5"));
        assert!(matches!(parts[1], Outbound::End(0)));
    }

    #[test]
    fn not_keep_alive_adds_connection_close() {
        let (mut pipeline, sink) = encoder_pipeline();
        pipeline.fire_inbound(Inbound::Head(0, head(Method::GET, Version::HTTP_10, false)));
        pipeline.fire_outbound(Outbound::Response(0, Response::new(StatusCode::NO_CONTENT)));

        let parts = sink.0.lock().unwrap();
        let Outbound::Head(0, head) = &parts[0] else {
            panic!("expected head");
        };
        assert!(!head.keep_alive);
        assert_eq!(head.headers[CONNECTION], "close");
        assert_eq!(head.version, Version::HTTP_10);
        assert!(!head.headers.contains_key(CONTENT_LENGTH));
    }

    #[test]
    fn streaming_body_is_spawned() {
        let (mut pipeline, sink) = encoder_pipeline();
        pipeline.fire_inbound(Inbound::Head(0, head(Method::GET, Version::HTTP_11, true)));
        let body = ResponseBody::stream(None, |mut writer| async move {
            let _ = writer.write_bytes("x").await;
            let _ = writer.end().await;
        });
        pipeline.fire_outbound(Outbound::Response(0, Response::ok(body)));

        assert_eq!(sink.0.lock().unwrap().len(), 1);
        assert_eq!(pipeline.take_spawns().len(), 1);
    }

    #[derive(Clone, Default)]
    struct Requests(Arc<Mutex<Vec<(u64, crate::http::Request)>>>);

    impl Handler for Requests {
        fn name(&self) -> &'static str {
            "requests"
        }

        fn inbound(&mut self, _ctx: &mut Context<'_>, msg: Inbound) {
            if let Inbound::Request(seq, request) = msg {
                self.0.lock().unwrap().push((seq, request));
            }
        }
    }

    #[test]
    fn decoder_collects_request_with_peer() {
        let requests = Requests::default();
        let peer: SocketAddr = "10.0.0.1:4000".parse().unwrap();
        let mut pipeline = Pipeline::new(vec![
            Box::new(RequestDecoder::new(Some(peer))),
            Box::new(requests.clone()),
        ]);

        let mut post = head(Method::POST, Version::HTTP_11, true);
        post.headers
            .insert(http::header::HOST, HeaderValue::from_static("example.com"));
        pipeline.fire_inbound(Inbound::Head(3, post));
        pipeline.fire_inbound(Inbound::Body(3, Bytes::from_static(b"a=1")));
        pipeline.fire_inbound(Inbound::Body(3, Bytes::from_static(b"&b=2")));
        pipeline.fire_inbound(Inbound::End(3));

        let requests = requests.0.lock().unwrap();
        let (seq, request) = &requests[0];
        assert_eq!(*seq, 3);
        assert_eq!(*request.method(), Method::POST);
        assert_eq!(&request.body()[..], b"a=1&b=2");
        assert_eq!(request.headers()[http::header::HOST], "example.com");
        assert_eq!(request.extensions().get::<PeerAddr>(), Some(&PeerAddr(Some(peer))));
    }

    #[test]
    fn decoder_answers_expect_continue() {
        let mut pipeline = Pipeline::new(vec![
            Box::new(crate::pipeline::http1::ResponseSerializer::new()),
            Box::new(RequestDecoder::new(None)),
        ]);
        let mut post = head(Method::POST, Version::HTTP_11, true);
        post.headers
            .insert(EXPECT, HeaderValue::from_static("100-continue"));
        pipeline.fire_inbound(Inbound::Head(0, post));

        assert_eq!(
            pipeline.take_outgoing().as_deref(),
            Some(&b"HTTP/1.1 100 Continue\r\n\r\n"[..])
        );
    }
}
