//! Protocol upgrades on plaintext HTTP/1 connections.
//!
//! A responder accepts an upgrade by returning a `101 Switching Protocols`
//! response that carries an [`Upgrader`]. Once that response has been
//! written, every HTTP handler is removed and the upgrader's handlers take
//! over, receiving any bytes the client sent after the upgrade request.

use std::collections::HashMap;

use http::StatusCode;

use super::engine::{Context, Handler};
use super::message::{Inbound, Outbound};

pub const UPGRADE: &str = "upgrade";

/// Supplies the handlers that speak the upgraded protocol.
pub trait Upgrader: Send + 'static {
    fn handlers(self: Box<Self>) -> Vec<Box<dyn Handler>>;
}

impl<F> Upgrader for F
where
    F: FnOnce() -> Vec<Box<dyn Handler>> + Send + 'static,
{
    fn handlers(self: Box<Self>) -> Vec<Box<dyn Handler>> {
        (*self)()
    }
}

pub struct UpgradeHandler {
    /// Handlers removed when the upgrade completes.
    http_handlers: Vec<&'static str>,
    pending: HashMap<u64, Box<dyn Upgrader>>,
}

impl UpgradeHandler {
    pub fn new(http_handlers: Vec<&'static str>) -> Self {
        Self {
            http_handlers,
            pending: HashMap::new(),
        }
    }
}

impl Handler for UpgradeHandler {
    fn name(&self) -> &'static str {
        UPGRADE
    }

    fn inbound(&mut self, ctx: &mut Context<'_>, msg: Inbound) {
        match msg {
            Inbound::ResponseSent(seq) => match self.pending.remove(&seq) {
                Some(upgrader) => {
                    tracing::debug!(seq, "Switching protocols");
                    ctx.splice(self.http_handlers.clone(), upgrader.handlers());
                }
                None => ctx.fire_inbound(Inbound::ResponseSent(seq)),
            },
            other => ctx.fire_inbound(other),
        }
    }

    fn outbound(&mut self, ctx: &mut Context<'_>, msg: Outbound) {
        if let Outbound::Response(seq, mut response) = msg {
            if let Some(upgrader) = response.take_upgrader() {
                if response.status == StatusCode::SWITCHING_PROTOCOLS {
                    self.pending.insert(seq, upgrader);
                } else {
                    tracing::warn!(seq, status = %response.status, "Ignoring upgrader on a non-101 response");
                }
            }
            ctx.fire_outbound(Outbound::Response(seq, response));
            return;
        }
        ctx.fire_outbound(msg);
    }
}
