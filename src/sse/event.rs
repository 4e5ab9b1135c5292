use bytes::{BufMut, Bytes, BytesMut};

/// Event type used when the stream never sends an `event:` field.
pub const DEFAULT_EVENT_TYPE: &str = "message";

/// One dispatched event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSentEvent {
    pub event_type: String,
    /// `data:` lines in arrival order.
    pub data: Vec<String>,
    pub id: Option<String>,
}

impl ServerSentEvent {
    pub fn new(data: impl Into<String>) -> Self {
        Self {
            event_type: DEFAULT_EVENT_TYPE.to_string(),
            data: vec![data.into()],
            id: None,
        }
    }

    pub fn with_event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = event_type.into();
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Data lines joined with `\n`.
    pub fn joined_data(&self) -> String {
        self.data.join("\n")
    }

    /// Renders the event in wire format, terminated by a blank line.
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::new();
        if self.event_type != DEFAULT_EVENT_TYPE {
            put_field(&mut out, "event", &self.event_type);
        }
        if let Some(id) = &self.id {
            put_field(&mut out, "id", id);
        }
        for line in &self.data {
            put_field(&mut out, "data", line);
        }
        out.put_u8(b'\n');
        out.freeze()
    }
}

fn put_field(out: &mut BytesMut, name: &str, value: &str) {
    out.put_slice(name.as_bytes());
    out.put_slice(b": ");
    out.put_slice(value.as_bytes());
    out.put_u8(b'\n');
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_fields_in_order() {
        let event = ServerSentEvent::new("hello")
            .with_event_type("greeting")
            .with_id("7");
        assert_eq!(
            &event.encode()[..],
            b"event: greeting\nid: 7\ndata: hello\n\n"
        );
    }

    #[test]
    fn default_type_is_not_written() {
        assert_eq!(&ServerSentEvent::new("x").encode()[..], b"data: x\n\n");
    }
}
