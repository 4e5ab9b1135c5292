//! Response bodies.
//!
//! A [`ResponseBody`] is either available in memory or produced by a stream
//! driver. Stream drivers receive a [`BodyStreamWriter`] exactly once and push
//! [`BodyStreamResult`]s through it; consumers either [`collect`] the whole
//! body or pull chunks with [`ResponseBody::into_chunks`].
//!
//! [`collect`]: ResponseBody::collect

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures_util::future::BoxFuture;
use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::http::BoxError;

/// Chunks buffered between a stream driver and its consumer.
const STREAM_CHANNEL_CAPACITY: usize = 16;

/// Error type for body streaming.
#[derive(Debug, Error)]
pub enum BodyError {
    /// The driver reported a failure.
    #[error("body stream failed: {0}")]
    Stream(#[source] BoxError),

    /// The writer was dropped before signalling the end of the body.
    #[error("body stream writer dropped before end of stream")]
    WriterDropped,

    /// A write arrived after `End` or `Error`.
    #[error("write after the body stream finished")]
    AlreadyFinished,

    /// The consumer went away.
    #[error("body stream consumer closed")]
    Closed,
}

/// One item written by a stream driver.
#[derive(Debug)]
pub enum BodyStreamResult {
    Buffer(Bytes),
    End,
    Error(BoxError),
}

/// Handle given to a stream driver.
///
/// The channel behind it is bounded, so `write` waits while the consumer
/// (usually the socket) is behind.
pub struct BodyStreamWriter {
    tx: mpsc::Sender<BodyStreamResult>,
    finished: bool,
}

impl BodyStreamWriter {
    fn channel() -> (Self, mpsc::Receiver<BodyStreamResult>) {
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        (Self { tx, finished: false }, rx)
    }

    pub async fn write(&mut self, result: BodyStreamResult) -> Result<(), BodyError> {
        if self.finished {
            tracing::warn!(?result, "Dropping body write after end of stream");
            return Err(BodyError::AlreadyFinished);
        }
        if matches!(result, BodyStreamResult::End | BodyStreamResult::Error(_)) {
            self.finished = true;
        }
        self.tx.send(result).await.map_err(|_| BodyError::Closed)
    }

    pub async fn write_bytes(&mut self, bytes: impl Into<Bytes>) -> Result<(), BodyError> {
        self.write(BodyStreamResult::Buffer(bytes.into())).await
    }

    pub async fn end(&mut self) -> Result<(), BodyError> {
        self.write(BodyStreamResult::End).await
    }

    pub async fn fail(&mut self, error: impl Into<BoxError>) -> Result<(), BodyError> {
        self.write(BodyStreamResult::Error(error.into())).await
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

impl fmt::Debug for BodyStreamWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodyStreamWriter")
            .field("finished", &self.finished)
            .finish()
    }
}

type StreamDriver = Box<dyn FnOnce(BodyStreamWriter) -> BoxFuture<'static, ()> + Send>;

/// A body produced incrementally by a driver callback.
pub struct BodyStream {
    count: Option<usize>,
    driver: StreamDriver,
}

impl BodyStream {
    /// `count` is the declared length; `None` means unknown (chunked).
    pub fn new<F, Fut>(count: Option<usize>, driver: F) -> Self
    where
        F: FnOnce(BodyStreamWriter) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            count,
            driver: Box::new(move |writer| Box::pin(driver(writer))),
        }
    }

    pub fn count(&self) -> Option<usize> {
        self.count
    }

    /// Invokes the driver and returns the chunks it writes.
    ///
    /// The stream ends after `End`, yields one error for `Error`, and yields
    /// [`BodyError::WriterDropped`] if the writer disappears without either.
    pub fn into_chunks(self) -> BodyChunks {
        let (writer, rx) = BodyStreamWriter::channel();
        BodyChunks {
            driver: Some((self.driver)(writer)),
            rx,
            done: false,
        }
    }
}

impl fmt::Debug for BodyStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodyStream")
            .field("count", &self.count)
            .finish_non_exhaustive()
    }
}

/// Chunks pulled from a running stream driver.
///
/// Polls the driver future alongside the channel, so the driver runs on the
/// consumer's task. Dropping this closes the channel and cancels the driver.
pub struct BodyChunks {
    driver: Option<BoxFuture<'static, ()>>,
    rx: mpsc::Receiver<BodyStreamResult>,
    done: bool,
}

impl Stream for BodyChunks {
    type Item = Result<Bytes, BodyError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.done {
            return Poll::Ready(None);
        }
        if let Some(driver) = this.driver.as_mut() {
            if driver.as_mut().poll(cx).is_ready() {
                this.driver = None;
            }
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(BodyStreamResult::Buffer(bytes))) => Poll::Ready(Some(Ok(bytes))),
            Poll::Ready(Some(BodyStreamResult::End)) => {
                this.done = true;
                Poll::Ready(None)
            }
            Poll::Ready(Some(BodyStreamResult::Error(error))) => {
                this.done = true;
                Poll::Ready(Some(Err(BodyError::Stream(error))))
            }
            Poll::Ready(None) => {
                this.done = true;
                Poll::Ready(Some(Err(BodyError::WriterDropped)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Body of a [`Response`](crate::http::Response).
pub enum ResponseBody {
    Empty,
    /// Read destructively: each accessor call drains it.
    Buffer(BytesMut),
    Data(Vec<u8>),
    StaticData(&'static [u8]),
    String(String),
    Stream(BodyStream),
}

impl ResponseBody {
    pub fn stream<F, Fut>(count: Option<usize>, driver: F) -> Self
    where
        F: FnOnce(BodyStreamWriter) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        ResponseBody::Stream(BodyStream::new(count, driver))
    }

    /// Body length, or `None` for a stream of unknown length.
    pub fn count(&self) -> Option<usize> {
        match self {
            ResponseBody::Empty => Some(0),
            ResponseBody::Buffer(buffer) => Some(buffer.len()),
            ResponseBody::Data(data) => Some(data.len()),
            ResponseBody::StaticData(data) => Some(data.len()),
            ResponseBody::String(string) => Some(string.len()),
            ResponseBody::Stream(stream) => stream.count(),
        }
    }

    pub fn is_stream(&self) -> bool {
        matches!(self, ResponseBody::Stream(_))
    }

    /// In-memory contents; `None` for streams.
    pub fn buffer(&mut self) -> Option<Bytes> {
        match self {
            ResponseBody::Empty => Some(Bytes::new()),
            ResponseBody::Buffer(buffer) => Some(buffer.split().freeze()),
            ResponseBody::Data(data) => Some(Bytes::copy_from_slice(data)),
            ResponseBody::StaticData(data) => Some(Bytes::from_static(data)),
            ResponseBody::String(string) => Some(Bytes::copy_from_slice(string.as_bytes())),
            ResponseBody::Stream(_) => None,
        }
    }

    pub fn data(&mut self) -> Option<Vec<u8>> {
        self.buffer().map(|bytes| bytes.to_vec())
    }

    /// Contents decoded as UTF-8, replacing invalid sequences.
    pub fn string(&mut self) -> Option<String> {
        match self {
            ResponseBody::String(string) => Some(string.clone()),
            other => other
                .buffer()
                .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()),
        }
    }

    /// Gathers the whole body, running the stream driver if there is one.
    pub async fn collect(self) -> Result<Bytes, BodyError> {
        match self {
            ResponseBody::Stream(stream) => {
                let mut chunks = stream.into_chunks();
                let mut collected = BytesMut::new();
                while let Some(chunk) = chunks.next().await {
                    collected.extend_from_slice(&chunk?);
                }
                Ok(collected.freeze())
            }
            mut other => Ok(other.buffer().unwrap_or_default()),
        }
    }

    /// Turns any body into a chunk stream.
    pub fn into_chunks(self) -> BoxStream<'static, Result<Bytes, BodyError>> {
        match self {
            ResponseBody::Stream(stream) => stream.into_chunks().boxed(),
            mut other => {
                let bytes = other.buffer().unwrap_or_default();
                if bytes.is_empty() {
                    stream::empty().boxed()
                } else {
                    stream::once(async move { Ok(bytes) }).boxed()
                }
            }
        }
    }
}

impl Default for ResponseBody {
    fn default() -> Self {
        ResponseBody::Empty
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseBody::Empty => f.write_str("Empty"),
            ResponseBody::Buffer(buffer) => write!(f, "Buffer({} bytes)", buffer.len()),
            ResponseBody::Data(data) => write!(f, "Data({} bytes)", data.len()),
            ResponseBody::StaticData(data) => write!(f, "StaticData({} bytes)", data.len()),
            ResponseBody::String(string) => write!(f, "String({:?})", string),
            ResponseBody::Stream(stream) => stream.fmt(f),
        }
    }
}

impl From<&'static str> for ResponseBody {
    fn from(value: &'static str) -> Self {
        ResponseBody::StaticData(value.as_bytes())
    }
}

impl From<&'static [u8]> for ResponseBody {
    fn from(value: &'static [u8]) -> Self {
        ResponseBody::StaticData(value)
    }
}

impl From<String> for ResponseBody {
    fn from(value: String) -> Self {
        ResponseBody::String(value)
    }
}

impl From<Vec<u8>> for ResponseBody {
    fn from(value: Vec<u8>) -> Self {
        ResponseBody::Data(value)
    }
}

impl From<Bytes> for ResponseBody {
    fn from(value: Bytes) -> Self {
        ResponseBody::Buffer(BytesMut::from(&value[..]))
    }
}

impl From<BytesMut> for ResponseBody {
    fn from(value: BytesMut) -> Self {
        ResponseBody::Buffer(value)
    }
}
