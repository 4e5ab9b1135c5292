use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use futures_util::stream::{self, Stream, StreamExt};

use super::{ServerSentEvent, SseParser};

struct State<S> {
    body: S,
    parser: SseParser,
    buffer: BytesMut,
    ready: VecDeque<ServerSentEvent>,
    done: bool,
}

/// Adapts a byte stream into a stream of events.
///
/// A body error is yielded once and ends the stream. Bytes left after the
/// body ends that do not form a complete event are dropped.
pub fn sse_stream<S, E>(body: S) -> impl Stream<Item = Result<ServerSentEvent, E>>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    let state = State {
        body,
        parser: SseParser::new(),
        buffer: BytesMut::new(),
        ready: VecDeque::new(),
        done: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.ready.pop_front() {
                return Some((Ok(event), state));
            }
            if state.done {
                return None;
            }
            match state.body.next().await {
                Some(Ok(chunk)) => {
                    state.buffer.extend_from_slice(&chunk);
                    let events = state.parser.process(&mut state.buffer);
                    state.ready.extend(events);
                }
                Some(Err(error)) => {
                    state.done = true;
                    return Some((Err(error), state));
                }
                None => {
                    state.done = true;
                    // no more bytes can follow, so a final `\r` is a terminator
                    if state.buffer.ends_with(b"\r") {
                        state.buffer.extend_from_slice(b"\n");
                        let events = state.parser.process(&mut state.buffer);
                        state.ready.extend(events);
                    }
                    if !state.buffer.is_empty() {
                        tracing::debug!(
                            remaining = state.buffer.len(),
                            "Event stream ended mid-event"
                        );
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[tokio::test]
    async fn yields_events_across_chunks() {
        let chunks: Vec<Result<Bytes, io::Error>> = vec![
            Ok(Bytes::from_static(b"data: one\n")),
            Ok(Bytes::from_static(b"\ndata: t")),
            Ok(Bytes::from_static(b"wo\n\ndata: cut")),
        ];
        let events: Vec<_> = sse_stream(stream::iter(chunks)).collect().await;
        let events: Vec<_> = events.into_iter().map(Result::unwrap).collect();
        assert_eq!(
            events,
            vec![ServerSentEvent::new("one"), ServerSentEvent::new("two")]
        );
    }

    #[tokio::test]
    async fn final_cr_terminates_at_end_of_body() {
        let chunks: Vec<Result<Bytes, io::Error>> =
            vec![Ok(Bytes::from_static(b"data: last\r\r"))];
        let events: Vec<_> = sse_stream(stream::iter(chunks)).collect().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].as_ref().unwrap(), &ServerSentEvent::new("last"));
    }

    #[tokio::test]
    async fn stops_after_body_error() {
        let chunks: Vec<Result<Bytes, io::Error>> = vec![
            Ok(Bytes::from_static(b"data: ok\n\n")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
            Ok(Bytes::from_static(b"data: never\n\n")),
        ];
        let events: Vec<_> = sse_stream(stream::iter(chunks)).collect().await;
        assert_eq!(events.len(), 2);
        assert!(events[0].is_ok());
        assert!(events[1].is_err());
    }
}
