//! Response compression and request decompression.
//!
//! Both directions stream: each body part is run through the coder as it
//! passes, and the coder is flushed so a slow producer (for example an event
//! stream) still reaches the client part by part.

use std::collections::{HashMap, HashSet};
use std::io::{self, Write};

use bytes::Bytes;
use flate2::write::{GzDecoder, GzEncoder, ZlibDecoder, ZlibEncoder};
use flate2::Compression;
use http::header::{
    HeaderMap, HeaderValue, ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_LENGTH, VARY,
};
use http::{Method, StatusCode};

use super::engine::{Context, Handler};
use super::error::PipelineError;
use super::message::{Inbound, Outbound, ResponseHead};
use crate::config::DecompressionLimit;

pub const RESPONSE_COMPRESSOR: &str = "response-compressor";
pub const REQUEST_DECOMPRESSOR: &str = "request-decompressor";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coding {
    Gzip,
    Deflate,
}

impl Coding {
    fn from_header(value: &HeaderValue) -> Option<Self> {
        let value = value.to_str().ok()?.trim();
        if value.eq_ignore_ascii_case("gzip") || value.eq_ignore_ascii_case("x-gzip") {
            Some(Coding::Gzip)
        } else if value.eq_ignore_ascii_case("deflate") {
            Some(Coding::Deflate)
        } else {
            None
        }
    }

    fn header_value(self) -> HeaderValue {
        match self {
            Coding::Gzip => HeaderValue::from_static("gzip"),
            Coding::Deflate => HeaderValue::from_static("deflate"),
        }
    }
}

/// Picks a response coding from `Accept-Encoding`, preferring gzip on ties.
pub fn negotiate(headers: &HeaderMap) -> Option<Coding> {
    let (mut gzip, mut deflate, mut any) = (None, None, None);
    for value in headers.get_all(ACCEPT_ENCODING) {
        let Ok(value) = value.to_str() else { continue };
        for item in value.split(',') {
            let mut params = item.split(';');
            let coding = params.next().unwrap_or_default().trim();
            let q = params
                .find_map(|p| p.trim().strip_prefix("q="))
                .and_then(|q| q.trim().parse::<f32>().ok())
                .unwrap_or(1.0);
            if coding.eq_ignore_ascii_case("gzip") || coding.eq_ignore_ascii_case("x-gzip") {
                gzip = Some(q);
            } else if coding.eq_ignore_ascii_case("deflate") {
                deflate = Some(q);
            } else if coding == "*" {
                any = Some(q);
            }
        }
    }
    let gzip = gzip.or(any).unwrap_or(0.0);
    let deflate = deflate.or(any).unwrap_or(0.0);
    if gzip > 0.0 && gzip >= deflate {
        Some(Coding::Gzip)
    } else if deflate > 0.0 {
        Some(Coding::Deflate)
    } else {
        None
    }
}

enum Encoder {
    Gzip(GzEncoder<Vec<u8>>),
    Deflate(ZlibEncoder<Vec<u8>>),
}

impl Encoder {
    fn new(coding: Coding, capacity: usize) -> Self {
        let out = Vec::with_capacity(capacity);
        match coding {
            Coding::Gzip => Encoder::Gzip(GzEncoder::new(out, Compression::default())),
            Coding::Deflate => Encoder::Deflate(ZlibEncoder::new(out, Compression::default())),
        }
    }

    fn write(&mut self, data: &[u8]) -> io::Result<Bytes> {
        let out = match self {
            Encoder::Gzip(encoder) => {
                encoder.write_all(data)?;
                encoder.flush()?;
                encoder.get_mut()
            }
            Encoder::Deflate(encoder) => {
                encoder.write_all(data)?;
                encoder.flush()?;
                encoder.get_mut()
            }
        };
        Ok(Bytes::from(std::mem::take(out)))
    }

    fn finish(self) -> io::Result<Bytes> {
        let out = match self {
            Encoder::Gzip(encoder) => encoder.finish()?,
            Encoder::Deflate(encoder) => encoder.finish()?,
        };
        Ok(Bytes::from(out))
    }
}

fn compressible(head: &ResponseHead) -> bool {
    !(head.bodiless
        || head.status.is_informational()
        || head.status == StatusCode::NO_CONTENT
        || head.status == StatusCode::NOT_MODIFIED
        || head.headers.contains_key(CONTENT_ENCODING)
        || head.headers.get(CONTENT_LENGTH).is_some_and(|v| v == "0"))
}

/// Compresses response bodies the client accepts compressed.
pub struct ResponseCompressor {
    initial_capacity: usize,
    negotiated: HashMap<u64, Coding>,
    active: HashMap<u64, Encoder>,
}

impl ResponseCompressor {
    pub fn new(initial_capacity: usize) -> Self {
        Self {
            initial_capacity,
            negotiated: HashMap::new(),
            active: HashMap::new(),
        }
    }
}

impl Handler for ResponseCompressor {
    fn name(&self) -> &'static str {
        RESPONSE_COMPRESSOR
    }

    fn inbound(&mut self, ctx: &mut Context<'_>, msg: Inbound) {
        if let Inbound::Head(seq, head) = &msg {
            if head.method != Method::HEAD {
                if let Some(coding) = negotiate(&head.headers) {
                    self.negotiated.insert(*seq, coding);
                }
            }
        }
        ctx.fire_inbound(msg);
    }

    fn outbound(&mut self, ctx: &mut Context<'_>, msg: Outbound) {
        match msg {
            Outbound::Head(seq, mut head) if !head.is_informational() => {
                if let Some(coding) = self.negotiated.remove(&seq) {
                    if compressible(&head) {
                        head.headers.remove(CONTENT_LENGTH);
                        head.headers.insert(CONTENT_ENCODING, coding.header_value());
                        head.headers
                            .append(VARY, HeaderValue::from_static("accept-encoding"));
                        self.active
                            .insert(seq, Encoder::new(coding, self.initial_capacity));
                    }
                }
                ctx.fire_outbound(Outbound::Head(seq, head));
            }
            Outbound::Body(seq, data) => match self.active.get_mut(&seq) {
                Some(encoder) => match encoder.write(&data) {
                    Ok(out) if out.is_empty() => {}
                    Ok(out) => ctx.fire_outbound(Outbound::Body(seq, out)),
                    Err(source) => {
                        self.active.remove(&seq);
                        ctx.fire_error(PipelineError::Compression { seq, source });
                    }
                },
                None => ctx.fire_outbound(Outbound::Body(seq, data)),
            },
            Outbound::End(seq) => {
                if let Some(encoder) = self.active.remove(&seq) {
                    match encoder.finish() {
                        Ok(out) => {
                            if !out.is_empty() {
                                ctx.fire_outbound(Outbound::Body(seq, out));
                            }
                        }
                        Err(source) => {
                            ctx.fire_error(PipelineError::Compression { seq, source });
                            return;
                        }
                    }
                }
                ctx.fire_outbound(Outbound::End(seq));
            }
            other => ctx.fire_outbound(other),
        }
    }
}

enum Decoder {
    Gzip(GzDecoder<Vec<u8>>),
    Deflate(ZlibDecoder<Vec<u8>>),
}

impl Decoder {
    fn new(coding: Coding) -> Self {
        match coding {
            Coding::Gzip => Decoder::Gzip(GzDecoder::new(Vec::new())),
            Coding::Deflate => Decoder::Deflate(ZlibDecoder::new(Vec::new())),
        }
    }

    fn write(&mut self, data: &[u8]) -> io::Result<Bytes> {
        let out = match self {
            Decoder::Gzip(decoder) => {
                decoder.write_all(data)?;
                decoder.flush()?;
                decoder.get_mut()
            }
            Decoder::Deflate(decoder) => {
                decoder.write_all(data)?;
                decoder.flush()?;
                decoder.get_mut()
            }
        };
        Ok(Bytes::from(std::mem::take(out)))
    }

    fn finish(self) -> io::Result<Bytes> {
        let out = match self {
            Decoder::Gzip(decoder) => decoder.finish()?,
            Decoder::Deflate(decoder) => decoder.finish()?,
        };
        Ok(Bytes::from(out))
    }
}

struct Inflating {
    decoder: Decoder,
    compressed: usize,
    decompressed: usize,
}

/// Inflates `gzip` and `deflate` request bodies within a size limit.
pub struct RequestDecompressor {
    limit: DecompressionLimit,
    active: HashMap<u64, Inflating>,
    failed: HashSet<u64>,
}

impl RequestDecompressor {
    pub fn new(limit: DecompressionLimit) -> Self {
        Self {
            limit,
            active: HashMap::new(),
            failed: HashSet::new(),
        }
    }

    fn fail(&mut self, ctx: &mut Context<'_>, error: PipelineError, seq: u64) {
        self.active.remove(&seq);
        self.failed.insert(seq);
        ctx.fire_error(error);
    }

    /// Forwards decompressed output, or fails the request when over the limit.
    fn emit(
        &mut self,
        ctx: &mut Context<'_>,
        seq: u64,
        out: io::Result<Bytes>,
        compressed: usize,
    ) {
        let out = match out {
            Ok(out) => out,
            Err(source) => {
                self.fail(ctx, PipelineError::Decompression { seq, source }, seq);
                return;
            }
        };
        let exceeded = match self.active.get_mut(&seq) {
            Some(inflating) => {
                inflating.compressed += compressed;
                inflating.decompressed += out.len();
                self.limit
                    .exceeded(inflating.compressed, inflating.decompressed)
            }
            None => false,
        };
        if exceeded {
            self.fail(ctx, PipelineError::DecompressionLimit { seq }, seq);
            return;
        }
        if !out.is_empty() {
            ctx.fire_inbound(Inbound::Body(seq, out));
        }
    }
}

impl Handler for RequestDecompressor {
    fn name(&self) -> &'static str {
        REQUEST_DECOMPRESSOR
    }

    fn inbound(&mut self, ctx: &mut Context<'_>, msg: Inbound) {
        match msg {
            Inbound::Head(seq, mut head) => {
                let coding = head.headers.get(CONTENT_ENCODING).and_then(Coding::from_header);
                if let Some(coding) = coding {
                    head.headers.remove(CONTENT_ENCODING);
                    head.headers.remove(CONTENT_LENGTH);
                    self.active.insert(
                        seq,
                        Inflating {
                            decoder: Decoder::new(coding),
                            compressed: 0,
                            decompressed: 0,
                        },
                    );
                }
                ctx.fire_inbound(Inbound::Head(seq, head));
            }
            Inbound::Body(seq, data) => {
                if self.failed.contains(&seq) {
                    return;
                }
                match self.active.get_mut(&seq) {
                    Some(inflating) => {
                        let out = inflating.decoder.write(&data);
                        self.emit(ctx, seq, out, data.len());
                    }
                    None => ctx.fire_inbound(Inbound::Body(seq, data)),
                }
            }
            Inbound::End(seq) => {
                if self.failed.remove(&seq) {
                    return;
                }
                if let Some(inflating) = self.active.remove(&seq) {
                    let Inflating {
                        decoder,
                        compressed,
                        decompressed,
                    } = inflating;
                    let out = decoder.finish();
                    let total = decompressed + out.as_ref().map_or(0, Bytes::len);
                    if self.limit.exceeded(compressed, total) {
                        self.failed.insert(seq);
                        ctx.fire_error(PipelineError::DecompressionLimit { seq });
                        return;
                    }
                    match out {
                        Ok(out) if !out.is_empty() => ctx.fire_inbound(Inbound::Body(seq, out)),
                        Ok(_) => {}
                        Err(source) => {
                            ctx.fire_error(PipelineError::Decompression { seq, source });
                            return;
                        }
                    }
                }
                ctx.fire_inbound(Inbound::End(seq));
            }
            other => ctx.fire_inbound(other),
        }
    }
}
