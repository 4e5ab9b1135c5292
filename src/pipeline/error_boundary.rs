//! Last-chance error response for malformed HTTP/1 requests.
//!
//! The boundary watches responses going out. When a parse error arrives and
//! no response is mid-write, it answers with a bare `400 Bad Request`.
//! If a response is mid-write, a new status line would corrupt the stream,
//! so it stays silent and abandons the failed request instead. Either way the
//! parser closes the connection once earlier responses are written. The
//! error always continues on to close-on-error.

use std::collections::HashSet;

use super::engine::{Context, Handler};
use super::error::PipelineError;
use super::message::{Outbound, ResponseHead};

pub const ERROR_BOUNDARY: &str = "protocol-error-boundary";

#[derive(Debug, Default)]
pub struct ErrorBoundary {
    /// Responses whose head has been written but not their end.
    writing: HashSet<u64>,
}

impl ErrorBoundary {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Handler for ErrorBoundary {
    fn name(&self) -> &'static str {
        ERROR_BOUNDARY
    }

    fn outbound(&mut self, ctx: &mut Context<'_>, msg: Outbound) {
        match &msg {
            Outbound::Head(seq, head) if !head.is_informational() => {
                debug_assert!(
                    !self.writing.contains(seq),
                    "second response head for request {}",
                    seq
                );
                self.writing.insert(*seq);
            }
            Outbound::Body(seq, _) => {
                debug_assert!(
                    self.writing.contains(seq),
                    "body part for request {} before its head",
                    seq
                );
            }
            Outbound::End(seq) => {
                let removed = self.writing.remove(seq);
                debug_assert!(removed, "end of request {} before its head", seq);
            }
            _ => {}
        }
        ctx.fire_outbound(msg);
    }

    fn error(&mut self, ctx: &mut Context<'_>, error: PipelineError) {
        if let PipelineError::Parse { seq, .. } = &error {
            if self.writing.is_empty() {
                ctx.fire_outbound(Outbound::Head(*seq, ResponseHead::bad_request()));
                ctx.fire_outbound(Outbound::End(*seq));
            } else {
                tracing::debug!(seq, "Response in progress; skipping 400");
                ctx.fire_outbound(Outbound::Abandon(*seq));
            }
        }
        ctx.fire_error(error);
    }
}
