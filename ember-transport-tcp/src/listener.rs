//! The listening side of a TCP server: binds and accepts on its own loop,
//! handing each accepted connection off to the framework's acceptor as an
//! [`ember_core::bootstrap::AcceptedChild`] user event.

use std::sync::{Arc, Weak};

use mio::net::TcpListener as MioTcpListener;
use mio::{Interest, Token};
use parking_lot::Mutex;
use tracing::debug;

use ember_core::bootstrap::AcceptedChild;
use ember_core::channel::ChannelAddress;
use ember_core::pipeline::{Pipeline, TransportSink, UserEvent};
use ember_core::reactor::{EventLoop, Readiness};
use ember_core::{Attributes, Buffer, BufferAllocator, Channel, ChannelId, ChannelState, CoreError, ErrorKind, Promise, PromiseWatcher, Result};

use crate::channel::lifecycle::{Cell as LifecycleCell, Phase};
use crate::channel::{TcpChannel, TcpSocketConfig};
use crate::error::map_io_error;

enum Mode {
    Unbound,
    Bound { listener: MioTcpListener, token: Token },
}

/// The bound, listening side of a TCP server. Its own pipeline only ever
/// sees `channel-registered`/`channel-active`/`channel-inactive` and the
/// `AcceptedChild` user events the framework acceptor consumes; application
/// payload traffic never reaches it, so the write/read path is a stub.
pub struct TcpServerChannel {
    id: ChannelId,
    self_weak: Mutex<Weak<TcpServerChannel>>,
    lifecycle: LifecycleCell,
    pipeline: Pipeline,
    attributes: Attributes,
    event_loop: Mutex<EventLoop>,
    mode: Mutex<Mode>,
    local_addr: Mutex<Option<ChannelAddress>>,
    buffer_allocator: Arc<dyn BufferAllocator>,
    child_config: TcpSocketConfig,
}

impl TcpServerChannel {
    pub fn new(event_loop: EventLoop, buffer_allocator: Arc<dyn BufferAllocator>, child_config: TcpSocketConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<TcpServerChannel>| {
            let sink: Weak<dyn TransportSink> = weak.clone();
            TcpServerChannel {
                id: ChannelId::next(),
                self_weak: Mutex::new(weak.clone()),
                lifecycle: LifecycleCell::new(),
                pipeline: Pipeline::new(event_loop.clone(), sink),
                attributes: Attributes::new(),
                event_loop: Mutex::new(event_loop),
                mode: Mutex::new(Mode::Unbound),
                local_addr: Mutex::new(None),
                buffer_allocator,
                child_config,
            }
        })
    }

    fn self_arc(&self) -> Arc<TcpServerChannel> {
        self.self_weak
            .lock()
            .upgrade()
            .expect("listener outlives any call originating from its own methods")
    }

    /// Drain every pending connection the kernel has queued, stopping at
    /// the first `WouldBlock`. Each accepted stream is handed to the
    /// framework acceptor as an `AcceptedChild`; it is not registered with
    /// any loop yet (see `TcpChannel::from_accepted`).
    fn accept_loop(&self) {
        loop {
            let accepted = {
                let mode = self.mode.lock();
                let Mode::Bound { listener, .. } = &*mode else { return };
                listener.accept()
            };
            let (stream, remote) = match accepted {
                Ok(pair) => pair,
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    self.pipeline.fire_exception_caught(map_io_error("tcp accept failed", err));
                    return;
                }
            };
            let local = self.local_addr.lock().clone().unwrap_or(ChannelAddress::Socket(
                stream.local_addr().unwrap_or_else(|_| "0.0.0.0:0".parse().unwrap()),
            ));
            debug!(listener = %self.id, %remote, "accepted tcp connection");

            let accept_loop = self.event_loop.lock().clone();
            let child = TcpChannel::from_accepted(
                accept_loop,
                stream,
                local,
                ChannelAddress::Socket(remote),
                self.buffer_allocator.clone(),
                self.child_config,
            );
            let event: UserEvent = Arc::new(AcceptedChild(child as Arc<dyn Channel>));
            self.pipeline.fire_user_event_triggered(event);
        }
    }

    fn close_internal(&self) {
        if !self.lifecycle.close() {
            return;
        }
        let mut mode = self.mode.lock();
        if let Mode::Bound { listener, token } = &mut *mode {
            let event_loop = self.event_loop.lock().clone();
            let _ = event_loop.deregister(listener, *token);
        }
        drop(mode);
        self.pipeline.fire_channel_inactive();
        self.pipeline.fire_channel_unregistered();
    }
}

impl Readiness for TcpServerChannel {
    fn handle_ready(&self, readable: bool, _writable: bool) {
        if readable {
            self.accept_loop();
        }
    }

    fn on_shutdown(&self) {
        self.close_internal();
    }
}

impl TransportSink for TcpServerChannel {
    fn do_bind(&self, local: ChannelAddress, promise: Promise<()>) {
        let ChannelAddress::Socket(addr) = local else {
            promise.fail(CoreError::new(ErrorKind::TransportIo, "tcp listener requires a resolved socket address"));
            return;
        };
        let mut listener = match MioTcpListener::bind(addr) {
            Ok(listener) => listener,
            Err(err) => {
                promise.fail(map_io_error("tcp bind failed", err));
                return;
            }
        };

        let bound_addr = listener.local_addr().unwrap_or(addr);
        *self.local_addr.lock() = Some(ChannelAddress::Socket(bound_addr));

        let event_loop = self.event_loop.lock().clone();
        let token = event_loop.allocate_token();
        let readiness: Arc<dyn Readiness> = self.self_arc();
        if let Err(err) = event_loop.register(&mut listener, token, Interest::READABLE, readiness) {
            promise.fail(err);
            return;
        }
        *self.mode.lock() = Mode::Bound { listener, token };

        if self.lifecycle.advance(Phase::Registered).is_err() {
            promise.fail(CoreError::new(ErrorKind::TransportClosed, "listener closed before bind completed"));
            return;
        }
        let _ = self.lifecycle.advance(Phase::Active);
        self.pipeline.fire_channel_registered();
        self.pipeline.fire_channel_active();
        promise.succeed(());
    }

    fn do_connect(&self, _remote: ChannelAddress, _local: Option<ChannelAddress>, promise: Promise<()>) {
        promise.fail(CoreError::new(ErrorKind::TransportIo, "a listening channel cannot connect"));
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
        msg.release();
        promise.fail(CoreError::new(ErrorKind::UnsupportedMessageType, "a listening channel carries no payload traffic"));
    }

    fn do_flush(&self) {}
}

impl Channel for TcpServerChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn local_addr(&self) -> Option<ChannelAddress> {
        self.local_addr.lock().clone()
    }

    fn remote_addr(&self) -> Option<ChannelAddress> {
        None
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
        false
    }

    fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    /// Listening channels are registered directly by `do_bind`; this is a
    /// no-op present only to satisfy the trait.
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
