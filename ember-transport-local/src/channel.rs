//! An in-process channel backed by a process-wide endpoint registry rather
//! than a real socket: `bind` claims a name, `connect` rendezvous with a
//! channel already bound under that name, and both sides deliver to each
//! other by scheduling a task on the peer's own event loop, preserving the
//! "effects only observed on the channel's own loop" rule without any `mio`
//! registration.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::trace;

use ember_core::channel::{ChannelAddress, DefaultMessageSizeEstimator, MessageSizeEstimator, OutboundQueue, WaterMark};
use ember_core::pipeline::{Pipeline, TransportSink};
use ember_core::reactor::EventLoop;
use ember_core::{Attributes, Buffer, BufferAllocator, Channel, ChannelId, ChannelState, CoreError, ErrorKind, Promise, PromiseWatcher, Result};

use crate::registry;

mod lifecycle {
    use ember_core::{CoreError, ErrorKind, Result};
    use std::sync::atomic::{AtomicU8, Ordering};

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    #[repr(u8)]
    pub enum Phase {
        Unregistered = 0,
        Registered = 1,
        Active = 2,
        Closed = 3,
    }

    pub struct Cell(AtomicU8);

    impl Cell {
        pub fn new() -> Self {
            Self(AtomicU8::new(Phase::Unregistered as u8))
        }

        pub fn get(&self) -> Phase {
            match self.0.load(Ordering::Acquire) {
                0 => Phase::Unregistered,
                1 => Phase::Registered,
                2 => Phase::Active,
                _ => Phase::Closed,
            }
        }

        pub fn advance(&self, next: Phase) -> Result<()> {
            let current = self.0.load(Ordering::Acquire);
            if (next as u8) <= current {
                return Err(CoreError::new(
                    ErrorKind::IndexOutOfRange,
                    "channel state transitions must move strictly toward closed",
                ));
            }
            self.0.store(next as u8, Ordering::Release);
            Ok(())
        }

        pub fn close(&self) -> bool {
            self.0.swap(Phase::Closed as u8, Ordering::AcqRel) != Phase::Closed as u8
        }
    }
}

use lifecycle::{Cell as LifecycleCell, Phase};

pub struct LocalChannel {
    id: ChannelId,
    self_weak: Mutex<Weak<LocalChannel>>,
    lifecycle: LifecycleCell,
    pipeline: Pipeline,
    attributes: Attributes,
    event_loop: Mutex<EventLoop>,
    local_addr: Mutex<Option<ChannelAddress>>,
    peer: Mutex<Option<Weak<LocalChannel>>>,
    outbound: Mutex<OutboundQueue>,
    buffer_allocator: Arc<dyn BufferAllocator>,
}

impl LocalChannel {
    pub fn new(event_loop: EventLoop, buffer_allocator: Arc<dyn BufferAllocator>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<LocalChannel>| {
            let sink: Weak<dyn TransportSink> = weak.clone();
            LocalChannel {
                id: ChannelId::next(),
                self_weak: Mutex::new(weak.clone()),
                lifecycle: LifecycleCell::new(),
                pipeline: Pipeline::new(event_loop.clone(), sink),
                attributes: Attributes::new(),
                event_loop: Mutex::new(event_loop),
                local_addr: Mutex::new(None),
                peer: Mutex::new(None),
                outbound: Mutex::new(OutboundQueue::new(WaterMark::default())),
                buffer_allocator,
            }
        })
    }

    fn self_arc(&self) -> Arc<LocalChannel> {
        self.self_weak
            .lock()
            .upgrade()
            .expect("channel outlives any call originating from its own methods")
    }

    /// Complete a successful rendezvous on both sides. Called from
    /// `do_connect`'s context: `self` has already found `target` in the
    /// registry. `self` finishes directly (its own loop is already the
    /// caller); `target` must finish via its own loop since only that loop
    /// is allowed to observe its channel's transitions.
    fn complete_rendezvous(self: &Arc<Self>, target: Arc<LocalChannel>) -> Result<()> {
        *self.peer.lock() = Some(Arc::downgrade(&target));
        self.lifecycle.advance(Phase::Active)?;
        self.pipeline.fire_channel_active();

        let self_weak = Arc::downgrade(self);
        let target_loop = target.event_loop.lock().clone();
        let target_for_task = target.clone();
        target_loop.execute(move || {
            *target_for_task.peer.lock() = Some(self_weak);
            if target_for_task.lifecycle.advance(Phase::Active).is_ok() {
                target_for_task.pipeline.fire_channel_active();
            }
        })?;
        Ok(())
    }

    fn deliver(&self, buffer: Buffer) {
        self.pipeline.fire_channel_read(buffer);
        self.pipeline.fire_channel_read_complete();
    }

    /// Idempotent teardown: fails pending writes, tells the peer (if any) to
    /// close too on its own loop, and fires `channel-inactive` then
    /// `channel-unregistered` once.
    fn close_internal(&self) {
        if !self.lifecycle.close() {
            return;
        }
        self.outbound.lock().fail_all_transport_closed();
        if let Some(name) = self.local_addr.lock().as_ref().and_then(as_name) {
            registry::unbind(&name, self.id);
        }
        if let Some(peer) = self.peer.lock().take().and_then(|weak| weak.upgrade()) {
            let peer_loop = peer.event_loop.lock().clone();
            let _ = peer_loop.execute(move || peer.close_internal());
        }
        self.pipeline.fire_channel_inactive();
        self.pipeline.fire_channel_unregistered();
    }
}

fn as_name(address: &ChannelAddress) -> Option<String> {
    match address {
        ChannelAddress::Local(name) => Some(name.clone()),
        _ => None,
    }
}

impl TransportSink for LocalChannel {
    fn do_bind(&self, local: ChannelAddress, promise: Promise<()>) {
        let Some(name) = as_name(&local) else {
            promise.fail(CoreError::new(ErrorKind::TransportIo, "local channel requires a Local(name) address"));
            return;
        };
        if let Err(err) = registry::bind(name.clone(), self.self_arc()) {
            promise.fail(err);
            return;
        }
        *self.local_addr.lock() = Some(ChannelAddress::Local(name));
        if self.lifecycle.advance(Phase::Registered).is_err() {
            promise.fail(CoreError::new(ErrorKind::TransportClosed, "channel closed before bind completed"));
            return;
        }
        self.pipeline.fire_channel_registered();
        promise.succeed(());
    }

    fn do_connect(&self, remote: ChannelAddress, local: Option<ChannelAddress>, promise: Promise<()>) {
        let Some(name) = as_name(&remote) else {
            promise.fail(CoreError::new(ErrorKind::TransportIo, "local channel requires a Local(name) address"));
            return;
        };
        let Some(target) = registry::claim(&name) else {
            promise.fail(CoreError::new(ErrorKind::TransportIo, format!("no local endpoint bound as {name}")));
            return;
        };
        if let Some(local) = local {
            *self.local_addr.lock() = Some(local);
        }
        let self_arc = self.self_arc();
        match self_arc.complete_rendezvous(target) {
            Ok(()) => promise.succeed(()),
            Err(err) => promise.fail(err),
        }
    }

    fn do_disconnect(&self, promise: Promise<()>) {
        self.close_internal();
        promise.succeed(());
    }

    fn do_close(&self, promise: Promise<()>) {
        self.close_internal();
        promise.succeed(());
    }

    fn do_read(&self) -> Result<()> {
        Ok(())
    }

    fn do_write(&self, msg: Buffer, promise: Promise<()>) {
        if self.peer.lock().is_none() {
            msg.release();
            promise.fail(CoreError::new(ErrorKind::TransportClosed, "local channel has no connected peer"));
            return;
        }
        let estimate = DefaultMessageSizeEstimator.size(&msg);
        let crossed_high = self.outbound.lock().enqueue(msg, estimate, promise);
        if crossed_high {
            self.pipeline.fire_channel_writability_changed(false);
        }
    }

    fn do_flush(&self) {
        self.outbound.lock().flush();
        let Some(peer) = self.peer.lock().clone().and_then(|weak| weak.upgrade()) else {
            return;
        };
        let allocator = self.buffer_allocator.clone();
        let result = self.outbound.lock().drain_with(|msg| {
            let bytes = msg.peek_readable()?;
            let len = bytes.len();
            if len == 0 {
                return Ok(0);
            }
            let mut handoff = allocator.buffer(len, len);
            handoff.write(&bytes)?;
            msg.advance_reader(len)?;

            let peer_loop = peer.event_loop.lock().clone();
            let peer_for_task = peer.clone();
            trace!(from = %self.id, to = %peer.id, bytes = len, "local channel handoff");
            peer_loop
                .execute(move || peer_for_task.deliver(handoff))
                .map_err(|_| CoreError::new(ErrorKind::TransportClosed, "peer's event loop is shutting down"))?;
            Ok(len)
        });
        if let Ok(true) = result {
            self.pipeline.fire_channel_writability_changed(true);
        } else if let Err(err) = result {
            self.pipeline.fire_exception_caught(err);
        }
    }
}

impl Channel for LocalChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn local_addr(&self) -> Option<ChannelAddress> {
        self.local_addr.lock().clone()
    }

    fn remote_addr(&self) -> Option<ChannelAddress> {
        self.peer.lock().as_ref().and_then(|weak| weak.upgrade()).and_then(|peer| peer.local_addr())
    }

    fn state(&self) -> ChannelState {
        match self.lifecycle.get() {
            Phase::Unregistered => ChannelState::Unregistered,
            Phase::Registered => ChannelState::Registered,
            Phase::Active => ChannelState::Active,
            Phase::Closed => ChannelState::Closed,
        }
    }

    fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    fn is_writable(&self) -> bool {
        self.outbound.lock().is_writable()
    }

    fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    /// A local channel is always constructed already bound to its owning
    /// loop by its factory; there is no accept flow to defer registration
    /// for, so this is a no-op present only to satisfy the trait.
    fn register(&self, _event_loop: EventLoop) -> Result<()> {
        Ok(())
    }

    fn bind(&self, local: ChannelAddress) -> PromiseWatcher<()> {
        self.pipeline.bind(local)
    }

    fn connect(&self, remote: ChannelAddress, local: Option<ChannelAddress>) -> PromiseWatcher<()> {
        self.pipeline.connect(remote, local)
    }

    fn write(&self, msg: Buffer) -> PromiseWatcher<()> {
        self.pipeline.write(msg)
    }

    fn flush(&self) {
        self.pipeline.flush();
    }

    fn read(&self) -> Result<()> {
        self.pipeline.read()
    }

    fn close(&self) -> PromiseWatcher<()> {
        self.pipeline.close()
    }
}
