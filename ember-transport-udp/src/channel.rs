//! A datagram channel built directly on `mio::net::UdpSocket`. Unlike the
//! stream transport there is no separate listener: one channel is one
//! socket, optionally `connect`ed to a default peer.

use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use mio::net::UdpSocket as MioUdpSocket;
use mio::{Interest, Token};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use ember_core::channel::{
    AdaptiveRecvBufferAllocator, ChannelAddress, DefaultMessageSizeEstimator, MessageSizeEstimator, OutboundQueue,
    RecvBufferAllocator, WaterMark,
};
use ember_core::pipeline::{Pipeline, TransportSink, UserEvent};
use ember_core::reactor::{EventLoop, Readiness};
use ember_core::{
    Attributes, Buffer, BufferAllocator, Channel, ChannelId, ChannelState, CoreError, ErrorKind, Promise, PromiseWatcher, Result,
};

use crate::error::map_io_error;

/// Socket-level knobs applied once the underlying socket exists, read back
/// by [`crate::UdpChannelFactory`] out of a bootstrap's
/// [`ember_core::ChannelOptions`].
#[derive(Clone, Copy, Debug, Default)]
pub struct UdpSocketConfig {
    pub broadcast: bool,
    pub multicast_loop_v4: bool,
}

/// A single `user-event-triggered` fired immediately before the
/// `channel-read` it describes: this channel's inbound message type is
/// monomorphic `Buffer` like every other channel in this core, so the
/// sender/recipient addressing a datagram needs travels as a preceding side
/// event instead of a distinct message type.
/// Safe to correlate 1:1 with the following read since a channel's own loop
/// is single-threaded — no other event can interleave between the two.
#[derive(Clone, Debug)]
pub struct DatagramMeta {
    pub sender: ChannelAddress,
    pub recipient: ChannelAddress,
}

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

enum Mode {
    Unbound,
    Bound { socket: MioUdpSocket, token: Token },
}

enum ReadOutcome {
    Data(Vec<u8>, usize, std::net::SocketAddr),
    WouldBlock,
    Err(io::Error),
}

pub struct UdpChannel {
    id: ChannelId,
    self_weak: Mutex<Weak<UdpChannel>>,
    lifecycle: LifecycleCell,
    pipeline: Pipeline,
    attributes: Attributes,
    event_loop: Mutex<EventLoop>,
    mode: Mutex<Mode>,
    outbound: Mutex<OutboundQueue>,
    recipients: Mutex<VecDeque<ChannelAddress>>,
    recv_allocator: AdaptiveRecvBufferAllocator,
    buffer_allocator: Arc<dyn BufferAllocator>,
    local_addr: Mutex<Option<ChannelAddress>>,
    default_peer: Mutex<Option<ChannelAddress>>,
    memberships: Mutex<Vec<(IpAddr, Option<IpAddr>)>>,
    config: UdpSocketConfig,
    auto_read: AtomicBool,
}

impl UdpChannel {
    pub fn new(event_loop: EventLoop, buffer_allocator: Arc<dyn BufferAllocator>, config: UdpSocketConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<UdpChannel>| {
            let sink: Weak<dyn TransportSink> = weak.clone();
            UdpChannel {
                id: ChannelId::next(),
                self_weak: Mutex::new(weak.clone()),
                lifecycle: LifecycleCell::new(),
                pipeline: Pipeline::new(event_loop.clone(), sink),
                attributes: Attributes::new(),
                event_loop: Mutex::new(event_loop),
                mode: Mutex::new(Mode::Unbound),
                outbound: Mutex::new(OutboundQueue::new(WaterMark::default())),
                recipients: Mutex::new(VecDeque::new()),
                recv_allocator: AdaptiveRecvBufferAllocator::default(),
                buffer_allocator,
                local_addr: Mutex::new(None),
                default_peer: Mutex::new(None),
                memberships: Mutex::new(Vec::new()),
                config,
                auto_read: AtomicBool::new(true),
            }
        })
    }

    fn self_arc(&self) -> Arc<UdpChannel> {
        self.self_weak
            .lock()
            .upgrade()
            .expect("channel outlives any call originating from its own methods")
    }

    fn apply_socket_options(&self, socket: &MioUdpSocket) {
        if self.config.broadcast {
            if let Err(err) = socket.set_broadcast(true) {
                warn!(channel = %self.id, error = %err, "failed to set SO_BROADCAST");
            }
        }
        if self.config.multicast_loop_v4 {
            if let Err(err) = socket.set_multicast_loop_v4(true) {
                warn!(channel = %self.id, error = %err, "failed to set IP_MULTICAST_LOOP");
            }
        }
    }

    fn reapply_memberships(&self, socket: &MioUdpSocket) {
        for (group, interface) in self.memberships.lock().iter().copied() {
            if let Err(err) = join_membership(socket, group, interface) {
                warn!(channel = %self.id, %group, "failed to re-establish multicast membership: {err}");
            }
        }
    }

    /// Ensure a socket exists, binding an ephemeral one if this channel has
    /// never been bound (the usual path for a client-style `connect`).
    fn ensure_bound(&self, event_loop: &EventLoop) -> Result<()> {
        let mut mode = self.mode.lock();
        if matches!(&*mode, Mode::Bound { .. }) {
            return Ok(());
        }
        let wildcard: std::net::SocketAddr = "0.0.0.0:0".parse().unwrap();
        let mut socket = MioUdpSocket::bind(wildcard).map_err(|err| map_io_error("udp ephemeral bind failed", err))?;
        self.apply_socket_options(&socket);
        self.reapply_memberships(&socket);
        *self.local_addr.lock() = Some(ChannelAddress::Socket(socket.local_addr().unwrap_or(wildcard)));

        let token = event_loop.allocate_token();
        let readiness: Arc<dyn Readiness> = self.self_arc();
        event_loop.register(&mut socket, token, Interest::READABLE | Interest::WRITABLE, readiness)?;
        *mode = Mode::Bound { socket, token };
        self.lifecycle.advance(Phase::Registered)?;
        Ok(())
    }

    fn pump_read(&self) {
        if !self.auto_read.load(Ordering::Acquire) {
            return;
        }
        loop {
            let guess = self.recv_allocator.guess();
            let outcome = {
                let mut mode = self.mode.lock();
                let Mode::Bound { socket, .. } = &mut *mode else { return };
                let mut scratch = vec![0u8; guess];
                match socket.recv_from(&mut scratch) {
                    Ok((n, peer)) => ReadOutcome::Data(scratch, n, peer),
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => ReadOutcome::WouldBlock,
                    Err(err) => ReadOutcome::Err(err),
                }
            };
            match outcome {
                ReadOutcome::Data(scratch, n, peer) => {
                    self.recv_allocator.record(n);
                    let recipient = self.local_addr.lock().clone().unwrap_or(ChannelAddress::Socket(peer));
                    let meta: UserEvent = Arc::new(DatagramMeta {
                        sender: ChannelAddress::Socket(peer),
                        recipient,
                    });
                    self.pipeline.fire_user_event_triggered(meta);
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
                ReadOutcome::Err(err) => {
                    debug!(channel = %self.id, error = %err, "udp recv error");
                    self.pipeline.fire_exception_caught(map_io_error("udp recv failed", err));
                    return;
                }
            }
        }
    }

    fn pump_write(&self) {
        let result = {
            let mut mode = self.mode.lock();
            let Mode::Bound { socket, .. } = &mut *mode else { return };
            let mut outbound = self.outbound.lock();
            let recipients = &self.recipients;
            outbound.drain_with(|msg| {
                let bytes = msg.peek_readable()?;
                if bytes.is_empty() {
                    return Ok(0);
                }
                let Some(target) = recipients.lock().front().cloned() else {
                    return Err(CoreError::new(ErrorKind::TransportIo, "outbound datagram has no recorded recipient"));
                };
                let Some(addr) = socket_addr_of(&target) else {
                    recipients.lock().pop_front();
                    return Err(CoreError::new(ErrorKind::TransportIo, "datagram recipient is not a resolved socket address"));
                };
                match socket.send_to(&bytes, addr) {
                    Ok(n) => {
                        recipients.lock().pop_front();
                        msg.advance_reader(n)?;
                        Ok(n)
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(0),
                    Err(err) => {
                        recipients.lock().pop_front();
                        Err(map_io_error("udp send failed", err))
                    }
                }
            })
        };
        match result {
            Ok(true) => self.pipeline.fire_channel_writability_changed(true),
            Ok(false) => {}
            Err(err) => self.pipeline.fire_exception_caught(err),
        }
    }

    fn close_internal(&self) {
        if !self.lifecycle.close() {
            return;
        }
        self.outbound.lock().fail_all_transport_closed();
        self.recipients.lock().clear();
        let mut mode = self.mode.lock();
        if let Mode::Bound { socket, token } = &mut *mode {
            let event_loop = self.event_loop.lock().clone();
            let _ = event_loop.deregister(socket, *token);
        }
        drop(mode);
        self.pipeline.fire_channel_inactive();
        self.pipeline.fire_channel_unregistered();
    }

    /// Join a multicast group, binding an ephemeral socket first if this
    /// channel hasn't been bound yet. `interface` selects the local
    /// interface (`None` lets the system choose).
    pub fn join_group(&self, group: IpAddr, interface: Option<IpAddr>) -> Result<()> {
        let event_loop = self.event_loop.lock().clone();
        self.ensure_bound(&event_loop)?;
        let mode = self.mode.lock();
        let Mode::Bound { socket, .. } = &*mode else { unreachable!("ensure_bound just bound this channel") };
        join_membership(socket, group, interface).map_err(|err| map_io_error("udp join-group failed", err))?;
        drop(mode);
        self.memberships.lock().push((group, interface));
        Ok(())
    }

    /// Leave a previously joined multicast group.
    pub fn leave_group(&self, group: IpAddr, interface: Option<IpAddr>) -> Result<()> {
        let mode = self.mode.lock();
        let Mode::Bound { socket, .. } = &*mode else {
            return Err(CoreError::new(ErrorKind::TransportIo, "leave-group requires an already-bound datagram channel"));
        };
        leave_membership(socket, group, interface).map_err(|err| map_io_error("udp leave-group failed", err))?;
        drop(mode);
        self.memberships.lock().retain(|(g, i)| !(*g == group && *i == interface));
        Ok(())
    }

    /// Send `payload` to `recipient` regardless of any default peer set via
    /// `connect`. Bypasses the pipeline's outbound chain entirely (there is
    /// no address parameter on the generic `write` path), reusing the same
    /// queue and water-mark machinery `flush`/`do_flush` already drive.
    pub fn send_to(&self, payload: Buffer, recipient: ChannelAddress) -> PromiseWatcher<()> {
        let (promise, watcher) = Promise::new();
        let estimate = DefaultMessageSizeEstimator.size(&payload);
        self.recipients.lock().push_back(recipient);
        let crossed_high = self.outbound.lock().enqueue(payload, estimate, promise);
        if crossed_high {
            self.pipeline.fire_channel_writability_changed(false);
        }
        self.pump_write();
        watcher
    }
}

fn socket_addr_of(address: &ChannelAddress) -> Option<std::net::SocketAddr> {
    match address {
        ChannelAddress::Socket(addr) => Some(*addr),
        _ => None,
    }
}

fn join_membership(socket: &MioUdpSocket, group: IpAddr, interface: Option<IpAddr>) -> io::Result<()> {
    match (group, interface) {
        (IpAddr::V4(multiaddr), Some(IpAddr::V4(iface))) => socket.join_multicast_v4(&multiaddr, &iface),
        (IpAddr::V4(multiaddr), None) => socket.join_multicast_v4(&multiaddr, &Ipv4Addr::UNSPECIFIED),
        (IpAddr::V6(multiaddr), _) => socket.join_multicast_v6(&multiaddr, 0),
        _ => Err(io::Error::new(io::ErrorKind::InvalidInput, "multicast group/interface address family mismatch")),
    }
}

fn leave_membership(socket: &MioUdpSocket, group: IpAddr, interface: Option<IpAddr>) -> io::Result<()> {
    match (group, interface) {
        (IpAddr::V4(multiaddr), Some(IpAddr::V4(iface))) => socket.leave_multicast_v4(&multiaddr, &iface),
        (IpAddr::V4(multiaddr), None) => socket.leave_multicast_v4(&multiaddr, &Ipv4Addr::UNSPECIFIED),
        (IpAddr::V6(multiaddr), _) => socket.leave_multicast_v6(&multiaddr, 0),
        _ => Err(io::Error::new(io::ErrorKind::InvalidInput, "multicast group/interface address family mismatch")),
    }
}

impl Readiness for UdpChannel {
    fn handle_ready(&self, readable: bool, writable: bool) {
        trace!(channel = %self.id, readable, writable, "udp readiness");
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

impl TransportSink for UdpChannel {
    fn do_bind(&self, local: ChannelAddress, promise: Promise<()>) {
        let ChannelAddress::Socket(addr) = local else {
            promise.fail(CoreError::new(ErrorKind::TransportIo, "udp bind requires a resolved socket address"));
            return;
        };
        let mut socket = match MioUdpSocket::bind(addr) {
            Ok(socket) => socket,
            Err(err) => {
                promise.fail(map_io_error("udp bind failed", err));
                return;
            }
        };
        self.apply_socket_options(&socket);
        self.reapply_memberships(&socket);
        let bound_addr = socket.local_addr().unwrap_or(addr);
        *self.local_addr.lock() = Some(ChannelAddress::Socket(bound_addr));

        let event_loop = self.event_loop.lock().clone();
        let token = event_loop.allocate_token();
        let readiness: Arc<dyn Readiness> = self.self_arc();
        if let Err(err) = event_loop.register(&mut socket, token, Interest::READABLE | Interest::WRITABLE, readiness) {
            promise.fail(err);
            return;
        }
        *self.mode.lock() = Mode::Bound { socket, token };
        if self.lifecycle.advance(Phase::Registered).is_err() {
            promise.fail(CoreError::new(ErrorKind::TransportClosed, "channel closed before bind completed"));
            return;
        }
        promise.succeed(());
    }

    fn do_connect(&self, remote: ChannelAddress, local: Option<ChannelAddress>, promise: Promise<()>) {
        let event_loop = self.event_loop.lock().clone();
        if let Err(err) = self.ensure_bound(&event_loop) {
            promise.fail(err);
            return;
        }
        if let Some(local) = local {
            *self.local_addr.lock() = Some(local);
        }
        if let ChannelAddress::Socket(addr) = &remote {
            let mode = self.mode.lock();
            if let Mode::Bound { socket, .. } = &*mode {
                if let Err(err) = socket.connect(*addr) {
                    promise.fail(map_io_error("udp connect failed", err));
                    return;
                }
            }
        }
        *self.default_peer.lock() = Some(remote);
        let _ = self.lifecycle.advance(Phase::Active);
        promise.succeed(());
    }

    fn do_disconnect(&self, promise: Promise<()>) {
        *self.default_peer.lock() = None;
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
        let Some(peer) = self.default_peer.lock().clone() else {
            msg.release();
            promise.fail(CoreError::new(
                ErrorKind::TransportIo,
                "udp channel has no connected peer; connect first or use send_to",
            ));
            return;
        };
        let estimate = DefaultMessageSizeEstimator.size(&msg);
        self.recipients.lock().push_back(peer);
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

impl Channel for UdpChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn local_addr(&self) -> Option<ChannelAddress> {
        self.local_addr.lock().clone()
    }

    fn remote_addr(&self) -> Option<ChannelAddress> {
        self.default_peer.lock().clone()
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

    /// Datagram channels are registered directly by `do_bind`/`do_connect`
    /// (there is no separate accept flow for a connectionless transport), so
    /// this is a no-op present only to satisfy the trait.
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
