//! UDP transport for the ember network framework, built directly on `mio`.
//! See [`UdpChannel`] for the datagram channel itself (bind, connect to a
//! default peer, explicit [`UdpChannel::send_to`], and multicast group
//! membership) and [`UdpChannelFactory`] for the glue a
//! [`ember_core::Bootstrap`] needs to mint one.

mod channel;
mod error;

pub use channel::{DatagramMeta, UdpChannel, UdpSocketConfig};

use std::sync::Arc;

use ember_core::bootstrap::{ChannelFactory, ChannelOptions};
use ember_core::reactor::EventLoop;
use ember_core::{BufferAllocator, Channel, PooledBufferAllocator, Result};

/// `ChannelOptions` key for a `bool` toggling `SO_BROADCAST`.
pub const OPT_BROADCAST: &str = "ember-transport-udp.broadcast";

/// `ChannelOptions` key for a `bool` toggling `IP_MULTICAST_LOOP`.
pub const OPT_MULTICAST_LOOP_V4: &str = "ember-transport-udp.multicast-loop-v4";

/// `ChannelOptions` key for an `Arc<dyn BufferAllocator>` shared by channels
/// this factory mints. Defaults to a fresh [`PooledBufferAllocator`] per
/// channel when absent.
pub const OPT_BUFFER_ALLOCATOR: &str = "ember-transport-udp.buffer-allocator";

fn socket_config_from(options: &ChannelOptions) -> UdpSocketConfig {
    UdpSocketConfig {
        broadcast: options.get::<bool>(OPT_BROADCAST).unwrap_or(false),
        multicast_loop_v4: options.get::<bool>(OPT_MULTICAST_LOOP_V4).unwrap_or(false),
    }
}

fn buffer_allocator_from(options: &ChannelOptions) -> Arc<dyn BufferAllocator> {
    options
        .get::<Arc<dyn BufferAllocator>>(OPT_BUFFER_ALLOCATOR)
        .unwrap_or_else(|| Arc::new(PooledBufferAllocator::new()))
}

/// Mints [`UdpChannel`]s for a [`ember_core::Bootstrap`]. There is no
/// server-side counterpart: a datagram channel is never "accepted", so one
/// factory covers both the listening and connecting cases.
#[derive(Default)]
pub struct UdpChannelFactory;

impl ChannelFactory for UdpChannelFactory {
    fn new_channel(&self, event_loop: EventLoop, options: &ChannelOptions) -> Result<Arc<dyn Channel>> {
        let config = socket_config_from(options);
        let buffer_allocator = buffer_allocator_from(options);
        Ok(UdpChannel::new(event_loop, buffer_allocator, config) as Arc<dyn Channel>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_socket_config_is_conservative() {
        let options = ChannelOptions::new();
        let config = socket_config_from(&options);
        assert!(!config.broadcast);
        assert!(!config.multicast_loop_v4);
    }

    #[test]
    fn socket_config_reads_back_explicit_options() {
        let options = ChannelOptions::new().set(OPT_BROADCAST, true).set(OPT_MULTICAST_LOOP_V4, true);
        let config = socket_config_from(&options);
        assert!(config.broadcast);
        assert!(config.multicast_loop_v4);
    }
}
