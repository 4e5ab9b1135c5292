//! The application end of an HTTP/1 pipeline.

use std::sync::Arc;

use futures_util::stream::{self, StreamExt};

use super::engine::{Context, Handler, CLOSE_ON_ERROR};
use super::error::PipelineError;
use super::message::{Inbound, Outbound};
use crate::http::Responder;
use crate::observability::metrics;

pub const DISPATCH: &str = "dispatch";

/// Hands complete requests to the responder.
///
/// Each request is answered on its own task, so responses may complete in
/// any order.
pub struct Dispatch {
    responder: Arc<dyn Responder>,
}

impl Dispatch {
    pub fn new(responder: Arc<dyn Responder>) -> Self {
        Self { responder }
    }
}

impl Handler for Dispatch {
    fn name(&self) -> &'static str {
        DISPATCH
    }

    fn inbound(&mut self, ctx: &mut Context<'_>, msg: Inbound) {
        let Inbound::Request(seq, request) = msg else {
            ctx.fire_inbound(msg);
            return;
        };
        tracing::debug!(seq, method = %request.method(), uri = %request.uri(), "Dispatching request");
        metrics::record_request("http1");
        let respond = self.responder.respond(request);
        let work = stream::once(async move {
            respond
                .await
                .map(|response| Outbound::Response(seq, response))
                .map_err(|source| PipelineError::Responder { seq, source })
        });
        ctx.spawn(work.boxed());
    }
}

/// Terminal handler: closes the connection on any error that reaches it.
///
/// Parse errors are the exception: the request parser closes once the
/// responses queued ahead of the error boundary's answer are written.
#[derive(Debug, Default)]
pub struct CloseOnError;

impl Handler for CloseOnError {
    fn name(&self) -> &'static str {
        CLOSE_ON_ERROR
    }

    fn inbound(&mut self, ctx: &mut Context<'_>, msg: Inbound) {
        match msg {
            // nobody consumed the end of input
            Inbound::Eof => ctx.close(),
            other => tracing::trace!(?other, "Discarding unhandled inbound message"),
        }
    }

    fn error(&mut self, ctx: &mut Context<'_>, error: PipelineError) {
        metrics::record_pipeline_error(error.kind());
        if let PipelineError::Parse { .. } = &error {
            tracing::debug!(error = %error, "Closing connection after pending responses");
            return;
        }
        tracing::warn!(error = %error, kind = error.kind(), "Closing connection after pipeline error");
        ctx.close();
    }
}
