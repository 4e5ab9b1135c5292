//! Errors raised inside a connection pipeline.

use std::io;

use thiserror::Error;

use crate::http::{BodyError, BoxError};

/// Malformed or unsupported HTTP/1 request bytes.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid request head: {0}")]
    Http(#[from] httparse::Error),

    #[error("request head exceeds {limit} bytes")]
    HeadTooLarge { limit: usize },

    #[error("request body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },

    #[error("invalid method")]
    InvalidMethod,

    #[error("invalid request target")]
    InvalidUri,

    #[error("invalid header")]
    InvalidHeader,

    #[error("invalid content-length")]
    InvalidContentLength,

    #[error("both content-length and transfer-encoding present")]
    AmbiguousBodyLength,

    #[error("unsupported transfer-encoding")]
    UnsupportedTransferEncoding,

    #[error("malformed chunked encoding")]
    BadChunk,
}

/// Error travelling through a pipeline towards the close-on-error handler.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("malformed request {seq}: {source}")]
    Parse {
        seq: u64,
        #[source]
        source: ParseError,
    },

    #[error("responder failed for request {seq}: {source}")]
    Responder {
        seq: u64,
        #[source]
        source: BoxError,
    },

    #[error("response body for request {seq} failed: {source}")]
    Body {
        seq: u64,
        #[source]
        source: BodyError,
    },

    #[error("request {seq} body exceeds the decompression limit")]
    DecompressionLimit { seq: u64 },

    #[error("request {seq} body could not be decompressed: {source}")]
    Decompression {
        seq: u64,
        #[source]
        source: io::Error,
    },

    #[error("response {seq} body could not be compressed: {source}")]
    Compression {
        seq: u64,
        #[source]
        source: io::Error,
    },

    /// Raised by handlers installed after an upgrade.
    #[error("upgraded protocol failed: {0}")]
    Upgraded(#[source] BoxError),
}

impl PipelineError {
    /// Short label used for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Parse { .. } => "parse",
            PipelineError::Responder { .. } => "responder",
            PipelineError::Body { .. } => "body",
            PipelineError::DecompressionLimit { .. } => "decompression_limit",
            PipelineError::Decompression { .. } => "decompression",
            PipelineError::Compression { .. } => "compression",
            PipelineError::Upgraded(_) => "upgraded",
        }
    }
}
