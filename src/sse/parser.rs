//! Incremental SSE parser.
//!
//! # Resumption
//! Bytes are removed from the buffer only up to the end of the last complete
//! event; a partial event stays in the buffer. Its fields are kept in the
//! parser together with the offset of the first unread line, so the next
//! call resumes there instead of re-reading the event. The buffer must only
//! be appended to between calls. A `\r` as the final buffered byte is
//! treated as incomplete, since the next read may start with the `\n` of a
//! CRLF.

use bytes::{Buf, BytesMut};

use super::event::{ServerSentEvent, DEFAULT_EVENT_TYPE};

/// Per-stream parsing state.
#[derive(Debug, Default)]
pub struct SseParser {
    event_type: Option<String>,
    data: Vec<String>,
    id: Option<String>,
    /// Bytes at the front of the buffer already applied to the fields above.
    scanned: usize,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses every complete event in `buffer` and removes the bytes they
    /// occupied.
    pub fn process(&mut self, buffer: &mut BytesMut) -> Vec<ServerSentEvent> {
        let mut events = Vec::new();
        let mut boundary = 0;
        let mut cursor = self.scanned.min(buffer.len());

        while let Some((line_len, terminator_len)) = next_line(&buffer[cursor..]) {
            let line = &buffer[cursor..cursor + line_len];
            cursor += line_len + terminator_len;

            if line.is_empty() {
                events.push(self.take_event());
                boundary = cursor;
            } else {
                self.apply_line(line);
            }
        }

        buffer.advance(boundary);
        self.scanned = cursor - boundary;
        events
    }

    fn apply_line(&mut self, line: &[u8]) {
        let Some(colon) = line.iter().position(|&b| b == b':') else {
            return;
        };
        let value = String::from_utf8_lossy(&line[colon + 1..]).trim().to_string();
        match &line[..colon] {
            b"event" => self.event_type = Some(value),
            b"data" => self.data.push(value),
            b"id" => self.id = Some(value),
            // `retry` and unknown fields are accepted and ignored
            _ => {}
        }
    }

    fn take_event(&mut self) -> ServerSentEvent {
        ServerSentEvent {
            event_type: self
                .event_type
                .take()
                .unwrap_or_else(|| DEFAULT_EVENT_TYPE.to_string()),
            data: std::mem::take(&mut self.data),
            id: self.id.take(),
        }
    }
}

/// Length of the next line and of its terminator, or `None` if the line is
/// not yet terminated.
fn next_line(bytes: &[u8]) -> Option<(usize, usize)> {
    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'\n' => return Some((i, 1)),
            b'\r' => {
                return match bytes.get(i + 1) {
                    Some(b'\n') => Some((i, 2)),
                    Some(_) => Some((i, 1)),
                    None => None,
                };
            }
            _ => {}
        }
    }
    None
}
