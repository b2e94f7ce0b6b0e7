//! The handler-context chain attached to a channel: an arena of contexts
//! addressed by generation-checked handles rather than linked `Rc`
//! pointers, so the chain never forms a reference cycle with the pipeline
//! or the channel that owns it.

mod codec;
mod context;
mod handler;

pub mod aggregator;
pub mod chunked_write;
pub mod flow_control;
pub mod idle_timeout;

pub use codec::{DecoderHandler, EncoderHandler, MessageDecoder, MessageEncoder};
pub use context::Context;
pub use handler::{EventMask, InboundHandler, InboundOnly, OutboundHandler, OutboundOnly};

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::warn;

use crate::buffer::Buffer;
use crate::channel::ChannelAddress;
use crate::error::{CoreError, ErrorKind, Result};
use crate::promise::{Promise, PromiseWatcher};
use crate::reactor::EventLoop;

/// An opaque application event, broadcast inbound via
/// `Context::fire_user_event_triggered`.
pub type UserEvent = Arc<dyn std::any::Any + Send + Sync>;

/// The real transport operations a pipeline's head ultimately invokes,
/// implemented by the concrete channel. Kept distinct from the public
/// [`crate::channel::Channel`] trait so outbound dispatch never recurses
/// back through the pipeline.
pub trait TransportSink: Send + Sync {
    fn do_bind(&self, local: ChannelAddress, promise: Promise<()>);
    fn do_connect(&self, remote: ChannelAddress, local: Option<ChannelAddress>, promise: Promise<()>);
    fn do_disconnect(&self, promise: Promise<()>);
    fn do_close(&self, promise: Promise<()>);
    fn do_read(&self) -> Result<()>;
    fn do_write(&self, msg: Buffer, promise: Promise<()>);
    fn do_flush(&self);
}

/// An index+generation pair identifying a context in the pipeline's arena.
/// A handle from a removed (and since-reused) slot fails to resolve rather
/// than silently addressing the wrong context.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContextHandle {
    index: usize,
    generation: u32,
}

struct ContextSlot {
    name: String,
    inbound: Arc<dyn InboundHandler>,
    outbound: Arc<dyn OutboundHandler>,
    prev: Option<usize>,
    next: Option<usize>,
    generation: u32,
}

enum Slot {
    Occupied(ContextSlot),
    /// `(next free index, generation the slot held while last occupied)`.
    /// Carrying the generation here is what lets a handle from an earlier
    /// occupant fail to resolve after several remove/reuse cycles.
    Free(Option<usize>, u32),
}

struct HeadHandler;
impl InboundHandler for HeadHandler {}
impl OutboundHandler for HeadHandler {}

struct TailHandler;
impl OutboundHandler for TailHandler {}
impl InboundHandler for TailHandler {
    fn exception_caught(&self, _ctx: &Context, error: CoreError) {
        warn!(kind = %error.kind(), message = %error.message(), "unhandled exception reached pipeline tail");
    }

    fn channel_read(&self, _ctx: &Context, msg: Buffer) {
        let _ = msg.release();
    }
}

const HEAD_INDEX: usize = 0;
const TAIL_INDEX: usize = 1;

struct PipelineInner {
    arena: Mutex<Vec<Slot>>,
    free_head: Mutex<Option<usize>>,
    sink: Weak<dyn TransportSink>,
    event_loop: Mutex<EventLoop>,
}

/// The handler chain for one channel. Cheaply cloneable (an `Arc` handle);
/// a channel owns the canonical clone, with no strong reference back from
/// the pipeline to the channel (only a [`Weak`] [`TransportSink`]), so the
/// pair never leaks through a reference cycle.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<PipelineInner>,
}

impl Pipeline {
    pub fn new(event_loop: EventLoop, sink: Weak<dyn TransportSink>) -> Self {
        let head = Slot::Occupied(ContextSlot {
            name: "head".to_string(),
            inbound: Arc::new(HeadHandler),
            outbound: Arc::new(HeadHandler),
            prev: None,
            next: Some(TAIL_INDEX),
            generation: 0,
        });
        let tail = Slot::Occupied(ContextSlot {
            name: "tail".to_string(),
            inbound: Arc::new(TailHandler),
            outbound: Arc::new(TailHandler),
            prev: Some(HEAD_INDEX),
            next: None,
            generation: 0,
        });
        Pipeline {
            inner: Arc::new(PipelineInner {
                arena: Mutex::new(vec![head, tail]),
                free_head: Mutex::new(None),
                sink,
                event_loop: Mutex::new(event_loop),
            }),
        }
    }

    fn event_loop(&self) -> EventLoop {
        self.inner.event_loop.lock().clone()
    }

    /// Re-home this pipeline onto `event_loop`. Used by a transport's
    /// `Channel::register` when a channel's real loop is only known after
    /// construction (an accepted child moving onto a loop drawn from the
    /// server's child group); must only be called before the channel
    /// becomes active, since dispatch in flight on the old loop would
    /// otherwise race the switch.
    pub fn rebind_event_loop(&self, event_loop: EventLoop) {
        *self.inner.event_loop.lock() = event_loop;
    }

    fn context_name(&self, handle: ContextHandle) -> String {
        match &self.inner.arena.lock()[handle.index] {
            Slot::Occupied(slot) if slot.generation == handle.generation => slot.name.clone(),
            _ => String::from("<removed>"),
        }
    }

    /// Run `f` on the owning loop, blocking the caller until it completes
    /// if called from elsewhere. Pipeline mutation must never interleave
    /// with event dispatch, both of which run only on the owning loop.
    fn run_on_loop<R: Send + 'static>(&self, f: impl FnOnce(&Pipeline) -> R + Send + 'static) -> Result<R> {
        if self.event_loop().in_event_loop() {
            return Ok(f(self));
        }
        let (tx, rx) = std::sync::mpsc::sync_channel(0);
        let pipeline = self.clone();
        self.event_loop().execute(move || {
            let result = f(&pipeline);
            let _ = tx.send(result);
        })?;
        rx.recv()
            .map_err(|_| CoreError::new(ErrorKind::ShutdownInProgress, "event loop dropped pending pipeline mutation"))
    }

    fn insert_between<H>(&self, prev: usize, next: usize, name: String, handler: H) -> ContextHandle
    where
        H: InboundHandler + OutboundHandler + 'static,
    {
        let shared = Arc::new(handler);
        let inbound: Arc<dyn InboundHandler> = shared.clone();
        let outbound: Arc<dyn OutboundHandler> = shared;

        let mut arena = self.inner.arena.lock();
        let mut free_head = self.inner.free_head.lock();
        let slot = ContextSlot {
            name,
            inbound,
            outbound,
            prev: Some(prev),
            next: Some(next),
            generation: 0,
        };

        let index = match *free_head {
            Some(i) => {
                let (next_free, previous_generation) = match &arena[i] {
                    Slot::Free(n, g) => (*n, *g),
                    Slot::Occupied(_) => unreachable!("free list points at an occupied slot"),
                };
                *free_head = next_free;
                arena[i] = Slot::Occupied(ContextSlot {
                    generation: previous_generation + 1,
                    ..slot
                });
                i
            }
            None => {
                arena.push(Slot::Occupied(slot));
                arena.len() - 1
            }
        };

        set_next(&mut arena, prev, Some(index));
        set_prev(&mut arena, next, Some(index));

        ContextHandle {
            index,
            generation: slot_generation(&arena, index),
        }
    }

    pub fn add_last<H>(&self, name: impl Into<String>, handler: H) -> Result<ContextHandle>
    where
        H: InboundHandler + OutboundHandler + 'static,
    {
        let name = name.into();
        self.run_on_loop(move |pipeline| {
            let prev = {
                let arena = pipeline.inner.arena.lock();
                match &arena[TAIL_INDEX] {
                    Slot::Occupied(slot) => slot.prev.unwrap(),
                    Slot::Free(..) => unreachable!("tail is never removed"),
                }
            };
            pipeline.insert_between(prev, TAIL_INDEX, name, handler)
        })
    }

    pub fn add_first<H>(&self, name: impl Into<String>, handler: H) -> Result<ContextHandle>
    where
        H: InboundHandler + OutboundHandler + 'static,
    {
        let name = name.into();
        self.run_on_loop(move |pipeline| {
            let next = {
                let arena = pipeline.inner.arena.lock();
                match &arena[HEAD_INDEX] {
                    Slot::Occupied(slot) => slot.next.unwrap(),
                    Slot::Free(..) => unreachable!("head is never removed"),
                }
            };
            pipeline.insert_between(HEAD_INDEX, next, name, handler)
        })
    }

    pub fn add_before<H>(&self, anchor: ContextHandle, name: impl Into<String>, handler: H) -> Result<ContextHandle>
    where
        H: InboundHandler + OutboundHandler + 'static,
    {
        let name = name.into();
        self.run_on_loop(move |pipeline| {
            let prev = {
                let arena = pipeline.inner.arena.lock();
                slot_at(&arena, anchor)?.prev.unwrap()
            };
            Ok(pipeline.insert_between(prev, anchor.index, name, handler))
        })?
    }

    pub fn add_after<H>(&self, anchor: ContextHandle, name: impl Into<String>, handler: H) -> Result<ContextHandle>
    where
        H: InboundHandler + OutboundHandler + 'static,
    {
        let name = name.into();
        self.run_on_loop(move |pipeline| {
            let next = {
                let arena = pipeline.inner.arena.lock();
                slot_at(&arena, anchor)?.next.unwrap()
            };
            Ok(pipeline.insert_between(anchor.index, next, name, handler))
        })?
    }

    pub fn remove(&self, handle: ContextHandle) -> Result<()> {
        self.run_on_loop(move |pipeline| {
            let mut arena = pipeline.inner.arena.lock();
            let (prev, next) = {
                let slot = slot_at(&arena, handle)?;
                (slot.prev, slot.next)
            };
            let (Some(prev), Some(next)) = (prev, next) else {
                return Err(CoreError::new(ErrorKind::IndexOutOfRange, "cannot remove the head or tail sentinel"));
            };
            set_next(&mut arena, prev, Some(next));
            set_prev(&mut arena, next, Some(prev));
            let mut free_head = pipeline.inner.free_head.lock();
            arena[handle.index] = Slot::Free(*free_head, handle.generation);
            *free_head = Some(handle.index);
            Ok(())
        })?
    }

    pub fn replace<H>(&self, handle: ContextHandle, name: impl Into<String>, handler: H) -> Result<ContextHandle>
    where
        H: InboundHandler + OutboundHandler + 'static,
    {
        let name = name.into();
        self.run_on_loop(move |pipeline| {
            let (prev, next) = {
                let arena = pipeline.inner.arena.lock();
                let slot = slot_at(&arena, handle)?;
                (slot.prev.unwrap(), slot.next.unwrap())
            };
            pipeline.remove(handle)?;
            Ok(pipeline.insert_between(prev, next, name, handler))
        })?
    }

    // ---- dispatch primitives used by `Context` ----

    /// Walks forward from `handle`, skipping any context whose inbound
    /// handler did not declare interest in `bit`, and invokes `f` on the
    /// first one that did. The tail always matches (its mask is never
    /// narrowed), so the walk is guaranteed to terminate.
    pub(crate) fn dispatch_inbound_from(&self, handle: ContextHandle, bit: EventMask, f: impl FnOnce(&dyn InboundHandler, &Context)) {
        let mut current = handle;
        loop {
            let next = {
                let arena = self.inner.arena.lock();
                match slot_at(&arena, current) {
                    Ok(slot) => slot.next,
                    Err(_) => None,
                }
            };
            let Some(next) = next else { return };
            let (handler, generation) = {
                let arena = self.inner.arena.lock();
                match &arena[next] {
                    Slot::Occupied(slot) => (slot.inbound.clone(), slot.generation),
                    Slot::Free(..) => return,
                }
            };
            let target = ContextHandle { index: next, generation };
            if !handler.event_mask().contains(bit) {
                current = target;
                continue;
            }
            let ctx = Context::new(self, target);
            f(handler.as_ref(), &ctx);
            return;
        }
    }

    /// Resolves the outbound neighbour of `handle` for event `bit`: walks
    /// backward, skipping contexts whose outbound handler declared no
    /// interest, until it finds one that does or reaches the head, where
    /// it falls back to the transport sink.
    fn outbound_target(&self, handle: ContextHandle, bit: EventMask) -> OutboundTarget {
        let mut current = handle;
        loop {
            let prev = {
                let arena = self.inner.arena.lock();
                slot_at(&arena, current).ok().and_then(|s| s.prev)
            };
            let Some(prev) = prev else {
                return match self.inner.sink.upgrade() {
                    Some(sink) => OutboundTarget::Sink(sink),
                    None => OutboundTarget::Closed,
                };
            };
            let (handler, generation) = {
                let arena = self.inner.arena.lock();
                match &arena[prev] {
                    Slot::Occupied(slot) => (slot.outbound.clone(), slot.generation),
                    Slot::Free(..) => return OutboundTarget::Closed,
                }
            };
            let target = ContextHandle { index: prev, generation };
            if !handler.event_mask().contains(bit) {
                current = target;
                continue;
            }
            return OutboundTarget::Handler(handler, target);
        }
    }

    pub(crate) fn outbound_bind(&self, handle: ContextHandle, local: ChannelAddress, promise: Promise<()>) {
        match self.outbound_target(handle, EventMask::BIND) {
            OutboundTarget::Handler(h, target) => h.bind(&Context::new(self, target), local, promise),
            OutboundTarget::Sink(sink) => sink.do_bind(local, promise),
            OutboundTarget::Closed => fail_closed(promise),
        }
    }

    pub(crate) fn outbound_connect(
        &self,
        handle: ContextHandle,
        remote: ChannelAddress,
        local: Option<ChannelAddress>,
        promise: Promise<()>,
    ) {
        match self.outbound_target(handle, EventMask::CONNECT) {
            OutboundTarget::Handler(h, target) => h.connect(&Context::new(self, target), remote, local, promise),
            OutboundTarget::Sink(sink) => sink.do_connect(remote, local, promise),
            OutboundTarget::Closed => fail_closed(promise),
        }
    }

    pub(crate) fn outbound_disconnect(&self, handle: ContextHandle, promise: Promise<()>) {
        match self.outbound_target(handle, EventMask::DISCONNECT) {
            OutboundTarget::Handler(h, target) => h.disconnect(&Context::new(self, target), promise),
            OutboundTarget::Sink(sink) => sink.do_disconnect(promise),
            OutboundTarget::Closed => fail_closed(promise),
        }
    }

    pub(crate) fn outbound_close(&self, handle: ContextHandle, promise: Promise<()>) {
        match self.outbound_target(handle, EventMask::CLOSE) {
            OutboundTarget::Handler(h, target) => h.close(&Context::new(self, target), promise),
            OutboundTarget::Sink(sink) => sink.do_close(promise),
            OutboundTarget::Closed => promise.succeed(()),
        }
    }

    pub(crate) fn outbound_write(&self, handle: ContextHandle, msg: Buffer, promise: Promise<()>) {
        match self.outbound_target(handle, EventMask::WRITE) {
            OutboundTarget::Handler(h, target) => h.write(&Context::new(self, target), msg, promise),
            OutboundTarget::Sink(sink) => sink.do_write(msg, promise),
            OutboundTarget::Closed => fail_closed(promise),
        }
    }

    pub(crate) fn outbound_flush(&self, handle: ContextHandle) {
        match self.outbound_target(handle, EventMask::FLUSH) {
            OutboundTarget::Handler(h, target) => h.flush(&Context::new(self, target)),
            OutboundTarget::Sink(sink) => sink.do_flush(),
            OutboundTarget::Closed => {}
        }
    }

    pub(crate) fn outbound_read(&self, handle: ContextHandle) -> Result<()> {
        match self.outbound_target(handle, EventMask::READ) {
            OutboundTarget::Handler(h, target) => h.read(&Context::new(self, target)),
            OutboundTarget::Sink(sink) => sink.do_read(),
            OutboundTarget::Closed => Err(CoreError::new(ErrorKind::TransportClosed, "channel dropped")),
        }
    }

    // ---- public entry points, invoked by the owning channel ----

    pub fn fire_channel_registered(&self) {
        self.dispatch_inbound_from(head_handle(), EventMask::CHANNEL_REGISTERED, |h, ctx| h.channel_registered(ctx));
    }
    pub fn fire_channel_unregistered(&self) {
        self.dispatch_inbound_from(head_handle(), EventMask::CHANNEL_UNREGISTERED, |h, ctx| {
            h.channel_unregistered(ctx)
        });
    }
    pub fn fire_channel_active(&self) {
        self.dispatch_inbound_from(head_handle(), EventMask::CHANNEL_ACTIVE, |h, ctx| h.channel_active(ctx));
    }
    pub fn fire_channel_inactive(&self) {
        self.dispatch_inbound_from(head_handle(), EventMask::CHANNEL_INACTIVE, |h, ctx| h.channel_inactive(ctx));
    }
    pub fn fire_channel_read(&self, msg: Buffer) {
        Context::new(self, head_handle()).fire_channel_read(msg);
    }
    pub fn fire_channel_read_complete(&self) {
        self.dispatch_inbound_from(head_handle(), EventMask::CHANNEL_READ_COMPLETE, |h, ctx| {
            h.channel_read_complete(ctx)
        });
    }
    pub fn fire_channel_writability_changed(&self, is_writable: bool) {
        self.dispatch_inbound_from(head_handle(), EventMask::CHANNEL_WRITABILITY, |h, ctx| {
            h.channel_writability_changed(ctx, is_writable)
        });
    }
    pub fn fire_user_event_triggered(&self, event: UserEvent) {
        Context::new(self, head_handle()).fire_user_event_triggered(event);
    }
    pub fn fire_exception_caught(&self, error: CoreError) {
        Context::new(self, head_handle()).fire_exception_caught(error);
    }

    pub fn bind(&self, local: ChannelAddress) -> PromiseWatcher<()> {
        self.dispatch_outbound_entry(move |pipeline, promise| pipeline.outbound_bind(tail_handle(), local, promise))
    }
    pub fn connect(&self, remote: ChannelAddress, local: Option<ChannelAddress>) -> PromiseWatcher<()> {
        self.dispatch_outbound_entry(move |pipeline, promise| {
            pipeline.outbound_connect(tail_handle(), remote, local, promise)
        })
    }
    pub fn write(&self, msg: Buffer) -> PromiseWatcher<()> {
        self.dispatch_outbound_entry(move |pipeline, promise| pipeline.outbound_write(tail_handle(), msg, promise))
    }
    pub fn flush(&self) {
        if self.event_loop().in_event_loop() {
            self.outbound_flush(tail_handle());
            return;
        }
        let pipeline = self.clone();
        let _ = self.event_loop().execute(move || pipeline.outbound_flush(tail_handle()));
    }
    pub fn read(&self) -> Result<()> {
        self.run_on_loop(|pipeline| pipeline.outbound_read(tail_handle()))?
    }
    pub fn close(&self) -> PromiseWatcher<()> {
        self.dispatch_outbound_entry(move |pipeline, promise| pipeline.outbound_close(tail_handle(), promise))
    }

    /// Runs an outbound entry point on the owning loop, trampolining if
    /// called from elsewhere. Unlike [`Pipeline::run_on_loop`] this never
    /// blocks the caller: the promise/watcher pair is created up front, so
    /// the watcher can be handed back immediately regardless of which
    /// thread completes it.
    fn dispatch_outbound_entry(&self, f: impl FnOnce(&Pipeline, Promise<()>) + Send + 'static) -> PromiseWatcher<()> {
        if self.event_loop().in_event_loop() {
            let (promise, watcher) = Promise::new();
            f(self, promise);
            return watcher;
        }
        let (promise, watcher) = Promise::new();
        let pipeline = self.clone();
        if self.event_loop().execute(move || f(&pipeline, promise)).is_err() {
            let (fail_promise, fail_watcher) = Promise::new();
            fail_promise.fail(CoreError::new(ErrorKind::ShutdownInProgress, "event loop is shutting down"));
            return fail_watcher;
        }
        watcher
    }
}

enum OutboundTarget {
    Handler(Arc<dyn OutboundHandler>, ContextHandle),
    Sink(Arc<dyn TransportSink>),
    Closed,
}

fn fail_closed(promise: Promise<()>) {
    promise.fail(CoreError::new(ErrorKind::TransportClosed, "channel dropped"));
}

fn head_handle() -> ContextHandle {
    ContextHandle {
        index: HEAD_INDEX,
        generation: 0,
    }
}

fn tail_handle() -> ContextHandle {
    ContextHandle {
        index: TAIL_INDEX,
        generation: 0,
    }
}

fn slot_at(arena: &[Slot], handle: ContextHandle) -> Result<&ContextSlot> {
    match &arena[handle.index] {
        Slot::Occupied(slot) if slot.generation == handle.generation => Ok(slot),
        _ => Err(CoreError::new(ErrorKind::IndexOutOfRange, "stale pipeline context handle")),
    }
}

fn slot_generation(arena: &[Slot], index: usize) -> u32 {
    match &arena[index] {
        Slot::Occupied(slot) => slot.generation,
        Slot::Free(_, g) => *g,
    }
}

fn set_next(arena: &mut [Slot], index: usize, next: Option<usize>) {
    if let Slot::Occupied(slot) = &mut arena[index] {
        slot.next = next;
    }
}

fn set_prev(arena: &mut [Slot], index: usize, prev: Option<usize>) {
    if let Slot::Occupied(slot) = &mut arena[index] {
        slot.prev = prev;
    }
}
