//! HTTP/1 wire handlers: request parsing and response serialization.
//!
//! # Responsibilities
//! - Split the inbound byte stream into request head, body and end parts
//! - Assign each request its sequence number
//! - Enforce head and body size limits and reject ambiguous framing
//! - Frame outbound responses (Content-Length, chunked, close-delimited)
//! - Decide when the connection closes: `Connection: close`, quiescing, EOF
//! - Stop parsing after a protocol upgrade is accepted

use std::collections::{BTreeSet, HashMap};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use http::header::{
    HeaderMap, HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING,
};
use http::{Method, StatusCode, Uri, Version};

use super::engine::{Context, Handler};
use super::error::{ParseError, PipelineError};
use super::message::{Inbound, Outbound, RequestHead, ResponseHead};
use crate::http::request::{is_keep_alive, is_upgrade_request};

pub const SERIALIZER: &str = "http1-response-serializer";
pub const PARSER: &str = "http1-request-parser";

const MAX_HEADERS: usize = 100;
const MAX_CHUNK_LINE: usize = 1024;

#[derive(Debug, Clone, Copy)]
enum BodyKind {
    Length(usize),
    Chunked,
}

#[derive(Debug, Clone, Copy)]
enum ChunkPhase {
    SizeLine,
    Data { remaining: usize },
    DataCrlf,
    Trailers,
}

#[derive(Debug)]
enum BodyDecoder {
    Length { remaining: usize },
    Chunked(ChunkPhase),
}

#[derive(Debug)]
struct BodyState {
    seq: u64,
    decoder: BodyDecoder,
    received: usize,
    upgrade: bool,
}

#[derive(Debug)]
enum ParseState {
    Head,
    Body(BodyState),
    /// An upgrade request was parsed; wait for its response head.
    AwaitingUpgrade(u64),
    /// `101` was sent; remaining bytes belong to the new protocol.
    Upgraded,
    Failed,
}

enum BodyStep {
    NeedMore,
    Progress,
    Complete { seq: u64, upgrade: bool },
}

/// Turns socket bytes into request parts.
#[derive(Debug)]
pub struct RequestParser {
    state: ParseState,
    buffer: BytesMut,
    next_seq: u64,
    in_flight: BTreeSet<u64>,
    pipelining: bool,
    closing: bool,
    max_head_size: usize,
    max_body_size: usize,
}

impl RequestParser {
    pub fn new(pipelining: bool, max_head_size: usize, max_body_size: usize) -> Self {
        Self {
            state: ParseState::Head,
            buffer: BytesMut::new(),
            next_seq: 0,
            in_flight: BTreeSet::new(),
            pipelining,
            closing: false,
            max_head_size,
            max_body_size,
        }
    }

    fn advance(&mut self, ctx: &mut Context<'_>) {
        loop {
            let step = match self.state {
                ParseState::Head => {
                    let blocked = !self.pipelining && !self.in_flight.is_empty();
                    if self.closing || blocked || self.buffer.is_empty() {
                        return;
                    }
                    self.parse_head(ctx)
                }
                ParseState::Body(_) => self.parse_body(ctx),
                _ => return,
            };
            match step {
                Ok(true) => continue,
                Ok(false) => return,
                Err(source) => {
                    self.fail(ctx, source);
                    return;
                }
            }
        }
    }

    fn parse_head(&mut self, ctx: &mut Context<'_>) -> Result<bool, ParseError> {
        let Some((head, len, kind)) =
            decode_head(&self.buffer, self.max_head_size, self.max_body_size)?
        else {
            return Ok(false);
        };
        self.buffer.advance(len);

        let seq = self.next_seq;
        self.next_seq += 1;
        self.in_flight.insert(seq);
        if !head.keep_alive {
            self.closing = true;
        }
        let upgrade = is_upgrade_request(&head.headers);
        tracing::trace!(seq, method = %head.method, uri = %head.uri, "Parsed request head");
        ctx.fire_inbound(Inbound::Head(seq, head));

        let decoder = match kind {
            BodyKind::Length(0) => None,
            BodyKind::Length(remaining) => Some(BodyDecoder::Length { remaining }),
            BodyKind::Chunked => Some(BodyDecoder::Chunked(ChunkPhase::SizeLine)),
        };
        match decoder {
            Some(decoder) => {
                self.state = ParseState::Body(BodyState {
                    seq,
                    decoder,
                    received: 0,
                    upgrade,
                });
            }
            None => self.finish_request(ctx, seq, upgrade),
        }
        Ok(true)
    }

    fn parse_body(&mut self, ctx: &mut Context<'_>) -> Result<bool, ParseError> {
        let ParseState::Body(body) = &mut self.state else {
            return Ok(false);
        };
        let step = match &mut body.decoder {
            BodyDecoder::Length { remaining } => {
                let n = (*remaining).min(self.buffer.len());
                if n == 0 {
                    BodyStep::NeedMore
                } else {
                    *remaining -= n;
                    ctx.fire_inbound(Inbound::Body(body.seq, self.buffer.split_to(n).freeze()));
                    if *remaining == 0 {
                        BodyStep::Complete {
                            seq: body.seq,
                            upgrade: body.upgrade,
                        }
                    } else {
                        BodyStep::Progress
                    }
                }
            }
            BodyDecoder::Chunked(phase) => {
                match decode_chunk(phase, &mut self.buffer, self.max_head_size)? {
                    None => BodyStep::NeedMore,
                    Some(ChunkItem::Data(data)) => {
                        body.received += data.len();
                        if body.received > self.max_body_size {
                            return Err(ParseError::BodyTooLarge {
                                limit: self.max_body_size,
                            });
                        }
                        ctx.fire_inbound(Inbound::Body(body.seq, data));
                        BodyStep::Progress
                    }
                    Some(ChunkItem::End) => BodyStep::Complete {
                        seq: body.seq,
                        upgrade: body.upgrade,
                    },
                }
            }
        };
        match step {
            BodyStep::NeedMore => Ok(false),
            BodyStep::Progress => Ok(true),
            BodyStep::Complete { seq, upgrade } => {
                self.finish_request(ctx, seq, upgrade);
                Ok(true)
            }
        }
    }

    fn finish_request(&mut self, ctx: &mut Context<'_>, seq: u64, upgrade: bool) {
        ctx.fire_inbound(Inbound::End(seq));
        self.state = if upgrade {
            ParseState::AwaitingUpgrade(seq)
        } else {
            ParseState::Head
        };
    }

    /// The failed request stays in flight until the error boundary answers
    /// or abandons it, so earlier responses are still written before close.
    fn fail(&mut self, ctx: &mut Context<'_>, source: ParseError) {
        let seq = match &self.state {
            ParseState::Body(body) => body.seq,
            _ => {
                let seq = self.next_seq;
                self.next_seq += 1;
                self.in_flight.insert(seq);
                seq
            }
        };
        tracing::debug!(seq, error = %source, "Rejecting malformed request");
        self.state = ParseState::Failed;
        self.closing = true;
        self.buffer.clear();
        ctx.fire_error(PipelineError::Parse { seq, source });
    }

    fn resolved(&mut self, ctx: &mut Context<'_>, seq: u64) {
        self.in_flight.remove(&seq);
        if matches!(self.state, ParseState::Upgraded) {
            return;
        }
        if self.closing && self.in_flight.is_empty() {
            ctx.close();
            return;
        }
        self.advance(ctx);
    }

    fn begin_closing(&mut self, ctx: &mut Context<'_>, eof: bool) {
        self.closing = true;
        let mid_body = matches!(self.state, ParseState::Body(_));
        if self.in_flight.is_empty() || (eof && mid_body) {
            ctx.close();
        }
    }
}

impl Handler for RequestParser {
    fn name(&self) -> &'static str {
        PARSER
    }

    fn inbound(&mut self, ctx: &mut Context<'_>, msg: Inbound) {
        match msg {
            Inbound::Bytes(bytes) => {
                if matches!(self.state, ParseState::Failed) {
                    return;
                }
                self.buffer.extend_from_slice(&bytes);
                self.advance(ctx);
            }
            Inbound::Quiesce => self.begin_closing(ctx, false),
            Inbound::Eof => self.begin_closing(ctx, true),
            other => ctx.fire_inbound(other),
        }
    }

    fn outbound(&mut self, ctx: &mut Context<'_>, msg: Outbound) {
        match msg {
            Outbound::Head(seq, mut head) if !head.is_informational() => {
                if let ParseState::AwaitingUpgrade(awaited) = self.state {
                    if awaited == seq {
                        self.state = if head.status == StatusCode::SWITCHING_PROTOCOLS {
                            ParseState::Upgraded
                        } else {
                            ParseState::Head
                        };
                    }
                }
                let last = self.in_flight.len() == 1 && self.in_flight.contains(&seq);
                let upgraded = matches!(self.state, ParseState::Upgraded);
                if self.closing && last && !upgraded {
                    head.keep_alive = false;
                    head.headers
                        .insert(CONNECTION, HeaderValue::from_static("close"));
                }
                ctx.fire_outbound(Outbound::Head(seq, head));
            }
            Outbound::End(seq) => {
                ctx.fire_outbound(Outbound::End(seq));
                self.resolved(ctx, seq);
            }
            Outbound::Abandon(seq) => self.resolved(ctx, seq),
            other => ctx.fire_outbound(other),
        }
    }

    fn take_leftover(&mut self) -> Option<Bytes> {
        (!self.buffer.is_empty()).then(|| self.buffer.split().freeze())
    }
}

type DecodedHead = (RequestHead, usize, BodyKind);

fn decode_head(
    buf: &[u8],
    max_head_size: usize,
    max_body_size: usize,
) -> Result<Option<DecodedHead>, ParseError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut headers);
    let len = match request.parse(buf)? {
        httparse::Status::Partial if buf.len() > max_head_size => {
            return Err(ParseError::HeadTooLarge {
                limit: max_head_size,
            })
        }
        httparse::Status::Partial => return Ok(None),
        httparse::Status::Complete(len) => len,
    };
    if len > max_head_size {
        return Err(ParseError::HeadTooLarge {
            limit: max_head_size,
        });
    }

    let method = Method::from_bytes(request.method.unwrap_or_default().as_bytes())
        .map_err(|_| ParseError::InvalidMethod)?;
    let uri: Uri = request
        .path
        .unwrap_or_default()
        .parse()
        .map_err(|_| ParseError::InvalidUri)?;
    let version = match request.version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    };

    let mut map = HeaderMap::with_capacity(request.headers.len());
    for header in request.headers.iter() {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|_| ParseError::InvalidHeader)?;
        let value = HeaderValue::from_bytes(header.value).map_err(|_| ParseError::InvalidHeader)?;
        map.append(name, value);
    }

    let kind = body_kind(version, &map, max_body_size)?;
    let keep_alive = is_keep_alive(version, &map);
    let head = RequestHead {
        method,
        uri,
        version,
        headers: map,
        keep_alive,
    };
    Ok(Some((head, len, kind)))
}

/// Determines request body framing.
///
/// Content-Length together with Transfer-Encoding is rejected outright, as is
/// any transfer coding other than a lone `chunked`.
fn body_kind(
    version: Version,
    headers: &HeaderMap,
    max_body_size: usize,
) -> Result<BodyKind, ParseError> {
    let has_te = headers.contains_key(TRANSFER_ENCODING);
    let has_cl = headers.contains_key(CONTENT_LENGTH);
    if has_te && has_cl {
        return Err(ParseError::AmbiguousBodyLength);
    }

    if has_te {
        if version == Version::HTTP_10 {
            return Err(ParseError::UnsupportedTransferEncoding);
        }
        let mut tokens = Vec::new();
        for value in headers.get_all(TRANSFER_ENCODING) {
            let value = value
                .to_str()
                .map_err(|_| ParseError::UnsupportedTransferEncoding)?;
            tokens.extend(value.split(',').map(str::trim).filter(|t| !t.is_empty()));
        }
        return match tokens.as_slice() {
            [only] if only.eq_ignore_ascii_case("chunked") => Ok(BodyKind::Chunked),
            _ => Err(ParseError::UnsupportedTransferEncoding),
        };
    }

    let mut length = None;
    for value in headers.get_all(CONTENT_LENGTH) {
        let parsed: usize = value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .ok_or(ParseError::InvalidContentLength)?;
        match length {
            Some(previous) if previous != parsed => return Err(ParseError::InvalidContentLength),
            _ => length = Some(parsed),
        }
    }
    let length = length.unwrap_or(0);
    if length > max_body_size {
        return Err(ParseError::BodyTooLarge {
            limit: max_body_size,
        });
    }
    Ok(BodyKind::Length(length))
}

enum ChunkItem {
    Data(Bytes),
    End,
}

/// Advances a chunked body. Chunk data is returned as soon as any of it is
/// buffered; trailers are read and discarded.
fn decode_chunk(
    phase: &mut ChunkPhase,
    buf: &mut BytesMut,
    max_trailer_size: usize,
) -> Result<Option<ChunkItem>, ParseError> {
    loop {
        match *phase {
            ChunkPhase::SizeLine => {
                let Some(line) = take_line(buf, MAX_CHUNK_LINE)? else {
                    return Ok(None);
                };
                let size = parse_chunk_size(&line)?;
                *phase = if size == 0 {
                    ChunkPhase::Trailers
                } else {
                    ChunkPhase::Data { remaining: size }
                };
            }
            ChunkPhase::Data { remaining } => {
                if buf.is_empty() {
                    return Ok(None);
                }
                let n = remaining.min(buf.len());
                let data = buf.split_to(n).freeze();
                *phase = match remaining - n {
                    0 => ChunkPhase::DataCrlf,
                    remaining => ChunkPhase::Data { remaining },
                };
                return Ok(Some(ChunkItem::Data(data)));
            }
            ChunkPhase::DataCrlf => {
                if buf.len() < 2 {
                    return Ok(None);
                }
                if &buf[..2] != b"\r\n" {
                    return Err(ParseError::BadChunk);
                }
                buf.advance(2);
                *phase = ChunkPhase::SizeLine;
            }
            ChunkPhase::Trailers => {
                let Some(line) = take_line(buf, max_trailer_size)? else {
                    return Ok(None);
                };
                if line.is_empty() {
                    *phase = ChunkPhase::SizeLine;
                    return Ok(Some(ChunkItem::End));
                }
            }
        }
    }
}

fn take_line(buf: &mut BytesMut, max_len: usize) -> Result<Option<BytesMut>, ParseError> {
    let Some(end) = buf.windows(2).position(|w| w == b"\r\n") else {
        if buf.len() > max_len {
            return Err(ParseError::BadChunk);
        }
        return Ok(None);
    };
    if end > max_len {
        return Err(ParseError::BadChunk);
    }
    let line = buf.split_to(end);
    buf.advance(2);
    Ok(Some(line))
}

fn parse_chunk_size(line: &[u8]) -> Result<usize, ParseError> {
    let line = std::str::from_utf8(line).map_err(|_| ParseError::BadChunk)?;
    let size = line.split(';').next().unwrap_or_default().trim();
    if size.is_empty() {
        return Err(ParseError::BadChunk);
    }
    usize::from_str_radix(size, 16).map_err(|_| ParseError::BadChunk)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    None,
    Length,
    Chunked,
    CloseDelimited,
}

#[derive(Debug)]
struct Writing {
    framing: Framing,
    keep_alive: bool,
}

/// Writes response parts to the socket.
#[derive(Debug, Default)]
pub struct ResponseSerializer {
    writing: HashMap<u64, Writing>,
}

impl ResponseSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    fn write_head(&mut self, seq: u64, mut head: ResponseHead) -> Bytes {
        let mut out = BytesMut::with_capacity(256);
        if head.is_informational() {
            encode_head(&mut out, &head);
            return out.freeze();
        }

        let no_body = head.bodiless
            || head.status == StatusCode::SWITCHING_PROTOCOLS
            || head.status == StatusCode::NO_CONTENT
            || head.status == StatusCode::NOT_MODIFIED;
        let framing = if no_body {
            Framing::None
        } else if head.headers.contains_key(CONTENT_LENGTH) {
            Framing::Length
        } else if head.headers.contains_key(TRANSFER_ENCODING) {
            Framing::Chunked
        } else if head.version == Version::HTTP_11 {
            head.headers
                .insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
            Framing::Chunked
        } else {
            head.keep_alive = false;
            Framing::CloseDelimited
        };

        encode_head(&mut out, &head);
        self.writing.insert(
            seq,
            Writing {
                framing,
                keep_alive: head.keep_alive,
            },
        );
        out.freeze()
    }
}

impl Handler for ResponseSerializer {
    fn name(&self) -> &'static str {
        SERIALIZER
    }

    fn outbound(&mut self, ctx: &mut Context<'_>, msg: Outbound) {
        match msg {
            Outbound::Head(seq, head) => {
                let bytes = self.write_head(seq, head);
                ctx.fire_outbound(Outbound::Bytes(bytes));
            }
            Outbound::Body(seq, data) => {
                let Some(writing) = self.writing.get(&seq) else {
                    tracing::warn!(seq, "Body part without a response head");
                    return;
                };
                match writing.framing {
                    // an empty chunk would end the body
                    Framing::Chunked if data.is_empty() => {}
                    Framing::Chunked => {
                        let mut out = BytesMut::with_capacity(data.len() + 12);
                        out.put_slice(format!("{:X}\r\n", data.len()).as_bytes());
                        out.put_slice(&data);
                        out.put_slice(b"\r\n");
                        ctx.fire_outbound(Outbound::Bytes(out.freeze()));
                    }
                    Framing::Length | Framing::CloseDelimited => {
                        ctx.fire_outbound(Outbound::Bytes(data));
                    }
                    Framing::None => {}
                }
            }
            Outbound::End(seq) => {
                let Some(writing) = self.writing.remove(&seq) else {
                    tracing::warn!(seq, "Response end without a response head");
                    return;
                };
                if writing.framing == Framing::Chunked {
                    ctx.fire_outbound(Outbound::Bytes(Bytes::from_static(b"0\r\n\r\n")));
                }
                ctx.fire_inbound(Inbound::ResponseSent(seq));
                if !writing.keep_alive {
                    ctx.close();
                }
            }
            Outbound::Abandon(_) => {}
            other => ctx.fire_outbound(other),
        }
    }
}

fn encode_head(out: &mut BytesMut, head: &ResponseHead) {
    let version = match head.version {
        Version::HTTP_10 => "HTTP/1.0",
        _ => "HTTP/1.1",
    };
    out.put_slice(version.as_bytes());
    out.put_u8(b' ');
    out.put_slice(head.status.as_str().as_bytes());
    out.put_u8(b' ');
    out.put_slice(head.status.canonical_reason().unwrap_or("").as_bytes());
    out.put_slice(b"\r\n");
    for (name, value) in head.headers.iter() {
        put_title_case(out, name.as_str());
        out.put_slice(b": ");
        out.put_slice(value.as_bytes());
        out.put_slice(b"\r\n");
    }
    out.put_slice(b"\r\n");
}

fn put_title_case(out: &mut BytesMut, name: &str) {
    let mut upper = true;
    for b in name.bytes() {
        out.put_u8(if upper { b.to_ascii_uppercase() } else { b });
        upper = b == b'-';
    }
}
