//! Restores request order for responses completed out of order.

use std::collections::{BTreeMap, VecDeque};

use super::engine::{Context, Handler};
use super::message::Outbound;

pub const PIPELINING: &str = "pipelining";

/// Buffers response parts until every earlier response has ended.
#[derive(Debug, Default)]
pub struct Pipelining {
    next: u64,
    pending: BTreeMap<u64, VecDeque<Outbound>>,
}

impl Pipelining {
    pub fn new() -> Self {
        Self::default()
    }

    fn flush(&mut self, ctx: &mut Context<'_>) {
        while let Some(parts) = self.pending.remove(&self.next) {
            let mut ended = false;
            for part in parts {
                ended |= matches!(part, Outbound::End(_) | Outbound::Abandon(_));
                ctx.fire_outbound(part);
            }
            if !ended {
                break;
            }
            self.next += 1;
        }
    }
}

impl Handler for Pipelining {
    fn name(&self) -> &'static str {
        PIPELINING
    }

    fn outbound(&mut self, ctx: &mut Context<'_>, msg: Outbound) {
        let Some(seq) = msg.seq() else {
            ctx.fire_outbound(msg);
            return;
        };
        if seq != self.next {
            tracing::trace!(seq, waiting_for = self.next, "Holding out-of-order response part");
            self.pending.entry(seq).or_default().push_back(msg);
            return;
        }
        let ended = matches!(msg, Outbound::End(_) | Outbound::Abandon(_));
        ctx.fire_outbound(msg);
        if ended {
            self.next += 1;
            self.flush(ctx);
        }
    }
}
