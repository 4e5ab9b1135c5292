//! The per-connection handler chain.
//!
//! A [`Pipeline`] owns an ordered list of [`Handler`]s. Index 0 is nearest
//! the socket. Inbound messages and errors move towards higher indices,
//! outbound messages towards lower ones; outbound bytes leaving index 0 are
//! buffered for the socket.
//!
//! Handlers never call each other directly. Everything they fire is queued
//! and delivered in FIFO order once the current call returns, so a handler
//! always sees messages in the order they were produced.

use std::collections::VecDeque;
use std::fmt;

use bytes::{Bytes, BytesMut};
use futures_util::stream::{BoxStream, StreamExt};
use tokio::sync::mpsc;

use super::error::PipelineError;
use super::message::{Inbound, Outbound};

/// Name of the terminal handler; upgraded handlers are inserted before it.
pub const CLOSE_ON_ERROR: &str = "close-on-error";

/// One stage of a pipeline.
///
/// Every method forwards unchanged by default.
pub trait Handler: Send {
    fn name(&self) -> &'static str;

    fn inbound(&mut self, ctx: &mut Context<'_>, msg: Inbound) {
        ctx.fire_inbound(msg);
    }

    fn outbound(&mut self, ctx: &mut Context<'_>, msg: Outbound) {
        ctx.fire_outbound(msg);
    }

    fn error(&mut self, ctx: &mut Context<'_>, error: PipelineError) {
        ctx.fire_error(error);
    }

    /// Bytes received but not consumed, handed to replacement handlers when
    /// this handler is spliced out.
    fn take_leftover(&mut self) -> Option<Bytes> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotId(u64);

#[derive(Debug, Clone, Copy)]
enum Origin {
    /// Delivered to the first handler.
    Socket,
    /// Delivered to the last handler.
    Application,
    /// Delivered to the neighbour of this slot in the message's direction.
    Slot(SlotId),
}

enum Event {
    Inbound(Origin, Inbound),
    Outbound(Origin, Outbound),
    Error(Origin, PipelineError),
}

struct Slot {
    id: SlotId,
    handler: Box<dyn Handler>,
}

struct Splice {
    remove: Vec<&'static str>,
    insert: Vec<Box<dyn Handler>>,
}

#[derive(Default)]
struct Effects {
    outgoing: BytesMut,
    close: bool,
    spawns: Vec<Spawned>,
    splice: Option<Splice>,
}

/// A handler's view of its pipeline during one call.
pub struct Context<'a> {
    slot: SlotId,
    queue: &'a mut VecDeque<Event>,
    effects: &'a mut Effects,
}

impl Context<'_> {
    pub fn fire_inbound(&mut self, msg: Inbound) {
        self.queue
            .push_back(Event::Inbound(Origin::Slot(self.slot), msg));
    }

    pub fn fire_outbound(&mut self, msg: Outbound) {
        self.queue
            .push_back(Event::Outbound(Origin::Slot(self.slot), msg));
    }

    /// Sends `error` towards the application end of the chain.
    pub fn fire_error(&mut self, error: PipelineError) {
        self.queue
            .push_back(Event::Error(Origin::Slot(self.slot), error));
    }

    /// Closes the connection once queued output has been written.
    pub fn close(&mut self) {
        self.effects.close = true;
    }

    /// Runs `work` off the pipeline; each item comes back as if this handler
    /// had fired it outbound (or as an error).
    pub fn spawn(&mut self, work: BoxStream<'static, Result<Outbound, PipelineError>>) {
        self.effects.spawns.push(Spawned {
            origin: self.slot,
            work,
        });
    }

    /// Replaces the handlers named in `remove` with `insert`, placed before
    /// the close-on-error handler. Applied after the current call returns.
    pub fn splice(&mut self, remove: Vec<&'static str>, insert: Vec<Box<dyn Handler>>) {
        self.effects.splice = Some(Splice { remove, insert });
    }
}

/// Deferred work started by a handler.
pub struct Spawned {
    origin: SlotId,
    work: BoxStream<'static, Result<Outbound, PipelineError>>,
}

impl Spawned {
    /// Drives the work, sending each item to the connection task.
    ///
    /// Stops after the first error or once the connection is gone.
    pub async fn forward(self, tx: mpsc::Sender<Deferred>) {
        let Spawned { origin, mut work } = self;
        while let Some(item) = work.next().await {
            let failed = item.is_err();
            if tx.send(Deferred { origin, item }).await.is_err() || failed {
                break;
            }
        }
    }
}

/// One completed item of spawned work.
pub struct Deferred {
    origin: SlotId,
    item: Result<Outbound, PipelineError>,
}

impl fmt::Debug for Deferred {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("origin", &self.origin)
            .field("item", &self.item)
            .finish()
    }
}

pub struct Pipeline {
    slots: Vec<Slot>,
    next_id: u64,
    queue: VecDeque<Event>,
    effects: Effects,
}

impl Pipeline {
    pub fn new(handlers: Vec<Box<dyn Handler>>) -> Self {
        let mut pipeline = Self {
            slots: Vec::with_capacity(handlers.len()),
            next_id: 0,
            queue: VecDeque::new(),
            effects: Effects::default(),
        };
        for handler in handlers {
            let slot = pipeline.slot(handler);
            pipeline.slots.push(slot);
        }
        pipeline
    }

    fn slot(&mut self, handler: Box<dyn Handler>) -> Slot {
        let id = SlotId(self.next_id);
        self.next_id += 1;
        Slot { id, handler }
    }

    pub fn handler_names(&self) -> Vec<&'static str> {
        self.slots.iter().map(|slot| slot.handler.name()).collect()
    }

    /// Delivers `msg` to the first handler.
    pub fn fire_inbound(&mut self, msg: Inbound) {
        self.queue.push_back(Event::Inbound(Origin::Socket, msg));
        self.run();
    }

    /// Delivers `msg` to the last handler.
    pub fn fire_outbound(&mut self, msg: Outbound) {
        self.queue
            .push_back(Event::Outbound(Origin::Application, msg));
        self.run();
    }

    /// Feeds back an item produced by spawned work.
    pub fn inject(&mut self, deferred: Deferred) {
        let origin = Origin::Slot(deferred.origin);
        let event = match deferred.item {
            Ok(msg) => Event::Outbound(origin, msg),
            Err(error) => Event::Error(origin, error),
        };
        self.queue.push_back(event);
        self.run();
    }

    /// Bytes waiting to be written to the socket.
    pub fn take_outgoing(&mut self) -> Option<Bytes> {
        if self.effects.outgoing.is_empty() {
            None
        } else {
            Some(self.effects.outgoing.split().freeze())
        }
    }

    pub fn should_close(&self) -> bool {
        self.effects.close
    }

    pub fn take_spawns(&mut self) -> Vec<Spawned> {
        std::mem::take(&mut self.effects.spawns)
    }

    fn position(&self, id: SlotId) -> Option<usize> {
        self.slots.iter().position(|slot| slot.id == id)
    }

    fn run(&mut self) {
        loop {
            if let Some(splice) = self.effects.splice.take() {
                self.apply(splice);
            }
            let Some(event) = self.queue.pop_front() else {
                return;
            };
            self.dispatch(event);
        }
    }

    fn dispatch(&mut self, event: Event) {
        match event {
            Event::Inbound(origin, msg) => {
                let Some(index) = self.next_index(origin) else {
                    tracing::trace!(?msg, "Inbound message reached the end of the pipeline");
                    return;
                };
                let (slot, mut ctx) = self.context(index);
                slot.handler.inbound(&mut ctx, msg);
            }
            Event::Error(origin, error) => {
                let Some(index) = self.next_index(origin) else {
                    tracing::warn!(%error, "Unhandled pipeline error");
                    self.effects.close = true;
                    return;
                };
                let (slot, mut ctx) = self.context(index);
                slot.handler.error(&mut ctx, error);
            }
            Event::Outbound(origin, msg) => match self.previous_index(origin) {
                Some(Some(index)) => {
                    let (slot, mut ctx) = self.context(index);
                    slot.handler.outbound(&mut ctx, msg);
                }
                Some(None) => match msg {
                    Outbound::Bytes(bytes) => self.effects.outgoing.extend_from_slice(&bytes),
                    other => {
                        tracing::warn!(?other, "Dropping unserialized message at the socket");
                    }
                },
                None => tracing::trace!(?msg, "Dropping message from a removed handler"),
            },
        }
    }

    fn context(&mut self, index: usize) -> (&mut Slot, Context<'_>) {
        let slot = &mut self.slots[index];
        let ctx = Context {
            slot: slot.id,
            queue: &mut self.queue,
            effects: &mut self.effects,
        };
        (slot, ctx)
    }

    /// Index of the handler that receives an inbound event from `origin`.
    fn next_index(&self, origin: Origin) -> Option<usize> {
        let index = match origin {
            Origin::Socket => 0,
            Origin::Application => self.slots.len().checked_sub(1)?,
            Origin::Slot(id) => self.position(id)? + 1,
        };
        (index < self.slots.len()).then_some(index)
    }

    /// Index of the handler that receives an outbound event from `origin`.
    /// `Some(None)` means the socket; `None` means the origin is gone.
    fn previous_index(&self, origin: Origin) -> Option<Option<usize>> {
        match origin {
            Origin::Socket => Some(None),
            Origin::Application => Some(self.slots.len().checked_sub(1)),
            Origin::Slot(id) => Some(self.position(id)?.checked_sub(1)),
        }
    }

    fn apply(&mut self, splice: Splice) {
        let mut leftover = BytesMut::new();
        let before = self.handler_names();
        self.slots.retain_mut(|slot| {
            if !splice.remove.contains(&slot.handler.name()) {
                return true;
            }
            if let Some(bytes) = slot.handler.take_leftover() {
                leftover.extend_from_slice(&bytes);
            }
            false
        });

        let at = self
            .slots
            .iter()
            .position(|slot| slot.handler.name() == CLOSE_ON_ERROR)
            .unwrap_or(self.slots.len());
        let inserted = splice.insert.len();
        for (offset, handler) in splice.insert.into_iter().enumerate() {
            let slot = self.slot(handler);
            self.slots.insert(at + offset, slot);
        }

        tracing::debug!(
            before = ?before,
            after = ?self.handler_names(),
            "Pipeline reconfigured"
        );

        if !leftover.is_empty() && inserted > 0 {
            let origin = match at {
                0 => Origin::Socket,
                _ => Origin::Slot(self.slots[at - 1].id),
            };
            self.queue
                .push_front(Event::Inbound(origin, Inbound::Bytes(leftover.freeze())));
        }
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("handlers", &self.handler_names())
            .field("queued", &self.queue.len())
            .field("close", &self.effects.close)
            .finish()
    }
}
