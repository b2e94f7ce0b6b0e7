//! A single TCP connection, built directly on `mio::net::TcpStream` rather
//! than an injected async runtime: this channel registers with whichever
//! [`EventLoop`] owns it and drives reads/writes from `handle_ready`.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use mio::net::TcpStream as MioTcpStream;
use mio::{Interest, Token};
use parking_lot::Mutex;
use tracing::{trace, warn};

use ember_core::channel::{
    AdaptiveRecvBufferAllocator, ChannelAddress, DefaultMessageSizeEstimator, MessageSizeEstimator, OutboundQueue,
    RecvBufferAllocator, WaterMark,
};
use ember_core::pipeline::{Pipeline, TransportSink};
use ember_core::reactor::{EventLoop, Readiness};
use ember_core::{
    Attributes, Buffer, BufferAllocator, Channel, ChannelId, ChannelState, CoreError, ErrorKind, Promise,
    PromiseWatcher, Result,
};

use crate::error::map_io_error;

/// `TCP_NODELAY`/`SO_LINGER` knobs applied once the underlying socket
/// exists, read back by [`crate::TcpChannelFactory`] out of a bootstrap's
/// [`ember_core::ChannelOptions`].
#[derive(Clone, Copy, Debug)]
pub struct TcpSocketConfig {
    pub nodelay: bool,
    pub linger: Option<std::time::Duration>,
}

impl Default for TcpSocketConfig {
    fn default() -> Self {
        Self {
            nodelay: true,
            linger: None,
        }
    }
}

/// Lifecycle phase tracked locally by this transport: mirrors
/// `ember_core::channel::state::ChannelStateCell`, which isn't itself
/// re-exported for transport crates to build on. Shared by
/// [`crate::listener::TcpServerChannel`].
pub(crate) mod lifecycle {
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

        /// Returns `true` if this call performed the transition to closed.
        pub fn close(&self) -> bool {
            self.0.swap(Phase::Closed as u8, Ordering::AcqRel) != Phase::Closed as u8
        }
    }
}

use lifecycle::{Cell as LifecycleCell, Phase};

enum Mode {
    /// A client-side channel with no socket yet; `do_connect` creates one.
    Pending,
    /// An accepted stream, not yet registered with any reactor.
    Unregistered(MioTcpStream),
    /// Registered and (once the lifecycle reaches `Active`) live.
    Open { stream: MioTcpStream, token: Token },
}

enum ReadOutcome {
    Data(Vec<u8>, usize),
    WouldBlock,
    Closed,
    Err(io::Error),
}

pub struct TcpChannel {
    id: ChannelId,
    self_weak: Mutex<Weak<TcpChannel>>,
    lifecycle: LifecycleCell,
    pipeline: Pipeline,
    attributes: Attributes,
    event_loop: Mutex<EventLoop>,
    mode: Mutex<Mode>,
    outbound: Mutex<OutboundQueue>,
    recv_allocator: AdaptiveRecvBufferAllocator,
    buffer_allocator: Arc<dyn BufferAllocator>,
    local_addr: Mutex<Option<ChannelAddress>>,
    remote_addr: Mutex<Option<ChannelAddress>>,
    config: TcpSocketConfig,
    auto_read: AtomicBool,
}

impl TcpChannel {
    /// A not-yet-connected client channel; [`Channel::connect`] drives the
    /// actual `mio::net::TcpStream::connect`.
    pub fn new_client(event_loop: EventLoop, buffer_allocator: Arc<dyn BufferAllocator>, config: TcpSocketConfig) -> Arc<Self> {
        Self::construct(event_loop, buffer_allocator, config, Mode::Pending, None, None)
    }

    /// A channel around a stream a [`crate::listener::TcpServerChannel`] has
    /// already accepted. Not yet registered with any reactor; the framework
    /// acceptor assigns that via [`Channel::register`].
    pub fn from_accepted(
        event_loop: EventLoop,
        stream: MioTcpStream,
        local: ChannelAddress,
        remote: ChannelAddress,
        buffer_allocator: Arc<dyn BufferAllocator>,
        config: TcpSocketConfig,
    ) -> Arc<Self> {
        Self::construct(
            event_loop,
            buffer_allocator,
            config,
            Mode::Unregistered(stream),
            Some(local),
            Some(remote),
        )
    }

    fn construct(
        event_loop: EventLoop,
        buffer_allocator: Arc<dyn BufferAllocator>,
        config: TcpSocketConfig,
        mode: Mode,
        local: Option<ChannelAddress>,
        remote: Option<ChannelAddress>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<TcpChannel>| {
            let sink: Weak<dyn TransportSink> = weak.clone();
            TcpChannel {
                id: ChannelId::next(),
                self_weak: Mutex::new(weak.clone()),
                lifecycle: LifecycleCell::new(),
                pipeline: Pipeline::new(event_loop.clone(), sink),
                attributes: Attributes::new(),
                event_loop: Mutex::new(event_loop),
                mode: Mutex::new(mode),
                outbound: Mutex::new(OutboundQueue::new(WaterMark::default())),
                recv_allocator: AdaptiveRecvBufferAllocator::default(),
                buffer_allocator,
                local_addr: Mutex::new(local),
                remote_addr: Mutex::new(remote),
                config,
                auto_read: AtomicBool::new(true),
            }
        })
    }

    fn self_arc(&self) -> Arc<TcpChannel> {
        self.self_weak
            .lock()
            .upgrade()
            .expect("channel outlives any call originating from its own methods")
    }

    fn apply_socket_options(&self, stream: &MioTcpStream) {
        if let Err(err) = stream.set_nodelay(self.config.nodelay) {
            warn!(channel = %self.id, error = %err, "failed to set TCP_NODELAY");
        }
        if let Some(linger) = self.config.linger {
            let sock_ref = socket2::SockRef::from(stream);
            if let Err(err) = sock_ref.set_linger(Some(linger)) {
                warn!(channel = %self.id, error = %err, "failed to set SO_LINGER");
            }
        }
    }

    fn pump_read(&self) {
        if !self.auto_read.load(Ordering::Acquire) {
            return;
        }
        loop {
            let guess = self.recv_allocator.guess();
            let outcome = {
                let mut mode = self.mode.lock();
                let Mode::Open { stream, .. } = &mut *mode else { return };
                let mut scratch = vec![0u8; guess];
                match stream.read(&mut scratch) {
                    Ok(0) => ReadOutcome::Closed,
                    Ok(n) => ReadOutcome::Data(scratch, n),
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => ReadOutcome::WouldBlock,
                    Err(err) => ReadOutcome::Err(err),
                }
            };
            match outcome {
                ReadOutcome::Data(scratch, n) => {
                    self.recv_allocator.record(n);
                    let mut buffer = self.buffer_allocator.buffer(n, n);
                    let _ = buffer.write(&scratch[..n]);
                    self.pipeline.fire_channel_read(buffer);
                    if n < guess {
                        self.pipeline.fire_channel_read_complete();
                        return;
                    }
                }
                ReadOutcome::WouldBlock => {
                    self.pipeline.fire_channel_read_complete();
                    return;
                }
                ReadOutcome::Closed => {
                    self.close_internal();
                    return;
                }
                ReadOutcome::Err(err) => {
                    self.pipeline.fire_exception_caught(map_io_error("tcp read failed", err));
                    self.close_internal();
                    return;
                }
            }
        }
    }

    fn pump_write(&self) {
        let result = {
            let mut mode = self.mode.lock();
            let Mode::Open { stream, .. } = &mut *mode else { return };
            let mut outbound = self.outbound.lock();
            outbound.drain_with(|msg| {
                let bytes = msg.peek_readable()?;
                if bytes.is_empty() {
                    return Ok(0);
                }
                match stream.write(&bytes) {
                    Ok(0) => Ok(0),
                    Ok(n) => {
                        msg.advance_reader(n)?;
                        Ok(n)
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(0),
                    Err(err) => Err(map_io_error("tcp write failed", err)),
                }
            })
        };
        match result {
            Ok(true) => self.pipeline.fire_channel_writability_changed(true),
            Ok(false) => {}
            Err(err) => {
                self.pipeline.fire_exception_caught(err);
                self.close_internal();
            }
        }
    }

    /// Idempotent teardown shared by an explicit `close()`, a peer-initiated
    /// EOF, and a fatal I/O error: fail pending writes, deregister the
    /// socket, and fire `channel-inactive` followed by `channel-unregistered`
    /// exactly once.
    fn close_internal(&self) {
        if !self.lifecycle.close() {
            return;
        }
        self.outbound.lock().fail_all_transport_closed();
        let mut mode = self.mode.lock();
        if let Mode::Open { stream, token } = &mut *mode {
            let event_loop = self.event_loop.lock().clone();
            let _ = event_loop.deregister(stream, *token);
        }
        drop(mode);
        self.pipeline.fire_channel_inactive();
        self.pipeline.fire_channel_unregistered();
    }
}

impl Readiness for TcpChannel {
    fn handle_ready(&self, readable: bool, writable: bool) {
        trace!(channel = %self.id, readable, writable, "tcp readiness");
        if self.lifecycle.get() == Phase::Registered {
            let _ = self.lifecycle.advance(Phase::Active);
            self.pipeline.fire_channel_active();
        }
        if writable {
            self.pump_write();
        }
        if readable {
            self.pump_read();
        }
    }

    fn on_shutdown(&self) {
        self.close_internal();
    }
}

impl TransportSink for TcpChannel {
    fn do_bind(&self, local: ChannelAddress, promise: Promise<()>) {
        *self.local_addr.lock() = Some(local);
        promise.succeed(());
    }

    fn do_connect(&self, remote: ChannelAddress, local: Option<ChannelAddress>, promise: Promise<()>) {
        let ChannelAddress::Socket(addr) = remote.clone() else {
            promise.fail(CoreError::new(ErrorKind::TransportIo, "tcp connect requires a resolved socket address"));
            return;
        };
        let mut stream = match MioTcpStream::connect(addr) {
            Ok(stream) => stream,
            Err(err) => {
                promise.fail(map_io_error("tcp connect failed", err));
                return;
            }
        };
        self.apply_socket_options(&stream);
        if let Some(local) = local {
            *self.local_addr.lock() = Some(local);
        }
        *self.remote_addr.lock() = Some(remote);

        let event_loop = self.event_loop.lock().clone();
        let token = event_loop.allocate_token();
        let readiness: Arc<dyn Readiness> = self.self_arc();
        if let Err(err) = event_loop.register(&mut stream, token, Interest::READABLE | Interest::WRITABLE, readiness) {
            promise.fail(err);
            return;
        }
        *self.mode.lock() = Mode::Open { stream, token };
        if self.lifecycle.advance(Phase::Registered).is_err() {
            promise.fail(CoreError::new(ErrorKind::TransportClosed, "channel closed before connect completed"));
            return;
        }
        promise.succeed(());
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
        self.pump_read();
        Ok(())
    }

    fn do_write(&self, msg: Buffer, promise: Promise<()>) {
        let estimate = DefaultMessageSizeEstimator.size(&msg);
        let crossed_high = self.outbound.lock().enqueue(msg, estimate, promise);
        if crossed_high {
            self.pipeline.fire_channel_writability_changed(false);
        }
    }

    fn do_flush(&self) {
        self.outbound.lock().flush();
        self.pump_write();
    }
}

impl Channel for TcpChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn local_addr(&self) -> Option<ChannelAddress> {
        self.local_addr.lock().clone()
    }

    fn remote_addr(&self) -> Option<ChannelAddress> {
        self.remote_addr.lock().clone()
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

    /// Perform the deferred mio registration for an accepted child: moves
    /// `Mode::Unregistered` to `Open` on `event_loop` and re-homes the
    /// pipeline onto it. A no-op on a channel already past `Unregistered`
    /// (the client `connect` path registers itself), so this is safe to
    /// call unconditionally from the framework acceptor.
    fn register(&self, event_loop: EventLoop) -> Result<()> {
        if self.lifecycle.get() != Phase::Unregistered {
            return Ok(());
        }
        self.pipeline.rebind_event_loop(event_loop.clone());
        *self.event_loop.lock() = event_loop.clone();

        let mut mode = self.mode.lock();
        if let Mode::Unregistered(mut stream) = std::mem::replace(&mut *mode, Mode::Pending) {
            self.apply_socket_options(&stream);
            let token = event_loop.allocate_token();
            let readiness: Arc<dyn Readiness> = self.self_arc();
            event_loop.register(&mut stream, token, Interest::READABLE | Interest::WRITABLE, readiness)?;
            *mode = Mode::Open { stream, token };
        }
        drop(mode);
        self.lifecycle.advance(Phase::Registered)?;
        self.lifecycle.advance(Phase::Active)?;
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
