//! `ember-core`: the buffer, event-loop, channel, and pipeline machinery
//! shared by every `ember` transport. Protocol codecs, TLS, and bootstrap
//! sugar live above this crate; this crate only provides the reusable
//! plumbing they're built from.

pub mod bootstrap;
pub mod buffer;
pub mod channel;
pub mod error;
pub mod pipeline;
pub mod promise;
pub mod reactor;
pub mod resolver;

pub use bootstrap::{AttributeKey, Attributes, Bootstrap, ChannelFactory, ChannelOptions, ServerBootstrap};
pub use buffer::{Buffer, BufferAllocator, CompositeBuffer, PooledBufferAllocator, UnpooledBufferAllocator};
pub use channel::{Channel, ChannelId, ChannelState};
pub use error::{CoreError, ErrorKind, Result};
pub use pipeline::{InboundHandler, OutboundHandler, Pipeline};
pub use promise::Promise;
pub use reactor::{EventLoop, EventLoopGroup, LoopState};
