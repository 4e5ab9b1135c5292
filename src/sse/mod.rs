//! Server-Sent Events.
//!
//! [`SseParser`] consumes an append-only byte buffer and yields complete
//! events, leaving partially received lines in the buffer for the next call.
//! [`sse_stream`] wraps any byte stream (for example a collected
//! [`ResponseBody`](crate::http::ResponseBody) chunk stream) into a stream of
//! events.

mod event;
mod parser;
mod stream;

pub use event::ServerSentEvent;
pub use parser::SseParser;
pub use stream::sse_stream;
