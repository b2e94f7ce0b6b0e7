//! TCP transport for the ember network framework, built directly on `mio`
//! rather than an injected async runtime: see [`channel`] and [`listener`]
//! for the connected and listening channel implementations, and
//! [`TcpChannelFactory`]/[`TcpServerChannelFactory`] for the glue a
//! [`ember_core::Bootstrap`]/[`ember_core::ServerBootstrap`] needs to mint
//! them.

mod channel;
mod error;
mod listener;

pub use channel::{TcpChannel, TcpSocketConfig};
pub use listener::TcpServerChannel;

use std::sync::Arc;
use std::time::Duration;

use ember_core::bootstrap::{ChannelFactory, ChannelOptions};
use ember_core::reactor::EventLoop;
use ember_core::{BufferAllocator, Channel, PooledBufferAllocator, Result};

/// `ChannelOptions` key for a `bool` toggling `TCP_NODELAY`. Defaults to
/// `true` when absent.
pub const OPT_NODELAY: &str = "ember-transport-tcp.nodelay";

/// `ChannelOptions` key for a `Duration` applied as `SO_LINGER`. Absent means
/// the platform default (no linger).
pub const OPT_LINGER: &str = "ember-transport-tcp.linger";

/// `ChannelOptions` key for an `Arc<dyn BufferAllocator>` shared by channels
/// this factory mints. Defaults to a fresh [`PooledBufferAllocator`] per
/// channel when absent.
pub const OPT_BUFFER_ALLOCATOR: &str = "ember-transport-tcp.buffer-allocator";

fn socket_config_from(options: &ChannelOptions) -> TcpSocketConfig {
    TcpSocketConfig {
        nodelay: options.get::<bool>(OPT_NODELAY).unwrap_or(true),
        linger: options.get::<Duration>(OPT_LINGER),
    }
}

fn buffer_allocator_from(options: &ChannelOptions) -> Arc<dyn BufferAllocator> {
    options
        .get::<Arc<dyn BufferAllocator>>(OPT_BUFFER_ALLOCATOR)
        .unwrap_or_else(|| Arc::new(PooledBufferAllocator::new()))
}

/// Mints client-side [`TcpChannel`]s for [`ember_core::Bootstrap`].
#[derive(Default)]
pub struct TcpChannelFactory;

impl ChannelFactory for TcpChannelFactory {
    fn new_channel(&self, event_loop: EventLoop, options: &ChannelOptions) -> Result<Arc<dyn Channel>> {
        let config = socket_config_from(options);
        let buffer_allocator = buffer_allocator_from(options);
        Ok(TcpChannel::new_client(event_loop, buffer_allocator, config) as Arc<dyn Channel>)
    }
}

/// Mints the listening [`TcpServerChannel`] for [`ember_core::ServerBootstrap`].
/// Accepted children are constructed directly by [`TcpServerChannel`]'s own
/// accept loop (see `listener.rs`), not through this factory; the socket
/// options configured here via `OPT_NODELAY`/`OPT_LINGER` are the ones
/// applied to each accepted child, not to the listening socket itself.
#[derive(Default)]
pub struct TcpServerChannelFactory;

impl ChannelFactory for TcpServerChannelFactory {
    fn new_channel(&self, event_loop: EventLoop, options: &ChannelOptions) -> Result<Arc<dyn Channel>> {
        let child_config = socket_config_from(options);
        let buffer_allocator = buffer_allocator_from(options);
        Ok(TcpServerChannel::new(event_loop, buffer_allocator, child_config) as Arc<dyn Channel>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_socket_config_favors_nodelay_with_no_linger() {
        let options = ChannelOptions::new();
        let config = socket_config_from(&options);
        assert!(config.nodelay);
        assert_eq!(config.linger, None);
    }

    #[test]
    fn socket_config_reads_back_explicit_options() {
        let options = ChannelOptions::new().set(OPT_NODELAY, false).set(OPT_LINGER, Duration::from_secs(2));
        let config = socket_config_from(&options);
        assert!(!config.nodelay);
        assert_eq!(config.linger, Some(Duration::from_secs(2)));
    }

    #[test]
    fn buffer_allocator_defaults_to_pooled_when_absent() {
        let options = ChannelOptions::new();
        let allocator = buffer_allocator_from(&options);
        let _ = allocator.buffer(16, 16);
    }
}
