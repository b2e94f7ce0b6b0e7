//! In-process transport for the ember network framework: channels that pair
//! up through a process-wide name registry instead of a socket, for wiring
//! pipelines together inside a single process (tests, embedded pipelines,
//! same-host fan-out) without paying for loopback I/O. See [`LocalChannel`]
//! and [`LocalChannelFactory`].

mod channel;
mod registry;

pub use channel::LocalChannel;

use std::sync::Arc;

use ember_core::bootstrap::{ChannelFactory, ChannelOptions};
use ember_core::reactor::EventLoop;
use ember_core::{BufferAllocator, Channel, PooledBufferAllocator, Result};

/// `ChannelOptions` key for an `Arc<dyn BufferAllocator>` shared by channels
/// this factory mints. Defaults to a fresh [`PooledBufferAllocator`] per
/// channel when absent.
pub const OPT_BUFFER_ALLOCATOR: &str = "ember-transport-local.buffer-allocator";

fn buffer_allocator_from(options: &ChannelOptions) -> Arc<dyn BufferAllocator> {
    options
        .get::<Arc<dyn BufferAllocator>>(OPT_BUFFER_ALLOCATOR)
        .unwrap_or_else(|| Arc::new(PooledBufferAllocator::new()))
}

/// Mints [`LocalChannel`]s for a [`ember_core::Bootstrap`]. There is no
/// server-side counterpart: a bound local channel accepts its one peer
/// itself once `connect` claims it, so one factory covers both ends.
#[derive(Default)]
pub struct LocalChannelFactory;

impl ChannelFactory for LocalChannelFactory {
    fn new_channel(&self, event_loop: EventLoop, options: &ChannelOptions) -> Result<Arc<dyn Channel>> {
        let buffer_allocator = buffer_allocator_from(options);
        Ok(LocalChannel::new(event_loop, buffer_allocator) as Arc<dyn Channel>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_allocator_defaults_to_pooled_when_absent() {
        let options = ChannelOptions::new();
        assert!(buffer_allocator_from(&options).buffer(16, 16).readable_bytes() == 0);
    }
}
