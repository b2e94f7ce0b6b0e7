//! The connection object: registration on an event loop, I/O readiness
//! handling, outbound write buffering, and lifecycle state.

mod address;
mod id;
mod outbound_queue;
mod recv_allocator;
mod size_estimator;
mod state;

pub use address::ChannelAddress;
pub use id::ChannelId;
pub use outbound_queue::{OutboundQueue, WaterMark};
pub use recv_allocator::{AdaptiveRecvBufferAllocator, RecvBufferAllocator};
pub use size_estimator::{DefaultMessageSizeEstimator, MessageSizeEstimator};
pub use state::ChannelState;

use crate::bootstrap::Attributes;
use crate::buffer::Buffer;
use crate::error::Result;
use crate::pipeline::Pipeline;
use crate::promise::PromiseWatcher;
use crate::reactor::EventLoop;

/// The per-transport connection contract: stream sockets, datagram sockets,
/// and the in-process transport each implement this over their own kernel
/// (or non-kernel) handle.
///
/// Every mutating method's effects are only ever observed on the channel's
/// own event loop; calling `bind`/`connect`/`close` from another thread is
/// safe and trampolines the request onto that loop.
pub trait Channel: Send + Sync {
    fn id(&self) -> ChannelId;
    fn local_addr(&self) -> Option<ChannelAddress>;
    fn remote_addr(&self) -> Option<ChannelAddress>;
    fn state(&self) -> ChannelState;
    fn pipeline(&self) -> &Pipeline;
    fn is_writable(&self) -> bool;

    /// Arbitrary typed values attached to this channel for the lifetime of
    /// the connection (a session id, an auth principal, ...).
    fn attributes(&self) -> &Attributes;

    /// Register this (freshly constructed, otherwise idle) channel onto
    /// `event_loop`. Used by the framework's acceptor to assign a loop from
    /// the server's child group to each newly accepted child, since the
    /// child is constructed unregistered by the transport's accept loop.
    fn register(&self, event_loop: EventLoop) -> Result<()>;

    /// Bind to a local address. May be called from any thread; the
    /// returned watcher completes once the operation runs on the
    /// channel's own loop.
    fn bind(&self, local: ChannelAddress) -> PromiseWatcher<()>;

    /// Connect to a remote address, optionally from a specific local
    /// address. May be called from any thread.
    fn connect(&self, remote: ChannelAddress, local: Option<ChannelAddress>) -> PromiseWatcher<()>;

    /// Enqueue `msg` on the unflushed outbound list. Ownership of `msg`
    /// transfers to the channel; it is released once written or on close.
    fn write(&self, msg: Buffer) -> PromiseWatcher<()>;

    /// Move the unflushed list to the flushed list and attempt I/O.
    fn flush(&self);

    /// Request one batch of inbound data if auto-read is currently off.
    fn read(&self) -> Result<()>;

    /// Idempotent: a second call returns an already-completed watcher.
    fn close(&self) -> PromiseWatcher<()>;
}
