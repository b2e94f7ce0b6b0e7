//! Thin builder glue over [`EventLoopGroup`], a [`ChannelFactory`], and an
//! initializer closure: `Bootstrap` for clients, `ServerBootstrap` for
//! servers. Neither owns any protocol knowledge; that lives entirely in the
//! `ChannelFactory` a transport crate supplies.

use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::channel::{Channel, ChannelAddress};
use crate::error::Result;
use crate::pipeline::{Context, EventMask, InboundHandler, OutboundHandler, Pipeline, UserEvent};
use crate::promise::PromiseWatcher;
use crate::reactor::EventLoopGroup;

/// A typed slot in an [`Attributes`] map. Two keys with the same `name` but
/// different `T` are treated as distinct slots, matching Netty's
/// `AttributeKey` identity-by-declaration-site convention, but keyed here by
/// name for simplicity rather than a process-wide identity table.
pub struct AttributeKey<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for AttributeKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for AttributeKey<T> {}

impl<T> AttributeKey<T> {
    pub const fn new(name: &'static str) -> Self {
        Self { name, _marker: PhantomData }
    }
}

/// A per-channel bag of arbitrary typed values, for application code to
/// stash connection-scoped state (a session id, an auth principal) that
/// doesn't belong in the pipeline chain itself.
#[derive(Default)]
pub struct Attributes {
    values: Mutex<HashMap<&'static str, Box<dyn Any + Send + Sync>>>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set<T: Send + Sync + 'static>(&self, key: AttributeKey<T>, value: T) {
        self.values.lock().insert(key.name, Box::new(value));
    }

    pub fn get<T: Clone + Send + Sync + 'static>(&self, key: AttributeKey<T>) -> Option<T> {
        self.values.lock().get(key.name).and_then(|v| v.downcast_ref::<T>()).cloned()
    }
}

/// A deferred set of attribute assignments, recorded on a bootstrap builder
/// and replayed onto each freshly constructed channel's own [`Attributes`].
#[derive(Clone, Default)]
pub struct AttributeSpec {
    appliers: Vec<Arc<dyn Fn(&Attributes) + Send + Sync>>,
}

impl AttributeSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set<T: Clone + Send + Sync + 'static>(mut self, key: AttributeKey<T>, value: T) -> Self {
        self.appliers.push(Arc::new(move |attrs: &Attributes| attrs.set(key, value.clone())));
        self
    }

    pub fn apply(&self, attrs: &Attributes) {
        for applier in &self.appliers {
            applier(attrs);
        }
    }
}

/// Protocol-level socket options (`TCP_NODELAY`, `SO_REUSEADDR`, datagram
/// buffer sizes, ...). Transport crates define their own well-known keys and
/// read them back out during [`ChannelFactory::new_channel`]; this type is
/// just an opaque, cheaply cloned carrier between the bootstrap builder and
/// the factory.
#[derive(Clone, Default)]
pub struct ChannelOptions {
    values: Arc<HashMap<&'static str, Arc<dyn Any + Send + Sync>>>,
}

impl ChannelOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set<T: Send + Sync + 'static>(mut self, key: &'static str, value: T) -> Self {
        Arc::make_mut(&mut self.values).insert(key, Arc::new(value));
        self
    }

    pub fn get<T: Clone + Send + Sync + 'static>(&self, key: &'static str) -> Option<T> {
        self.values.get(key).and_then(|v| v.downcast_ref::<T>()).cloned()
    }
}

/// Builds a concrete, unregistered [`Channel`] bound to the given loop. Each
/// transport crate (TCP, UDP, local) provides its own implementation; this
/// trait is the only seam `ember-core` needs to stay transport-agnostic.
pub trait ChannelFactory: Send + Sync {
    fn new_channel(&self, event_loop: crate::reactor::EventLoop, options: &ChannelOptions) -> Result<Arc<dyn Channel>>;
}

type Initializer = Arc<dyn Fn(&Pipeline) + Send + Sync>;

/// Client-side bootstrap: picks a loop, builds a channel via the factory,
/// runs the initializer, and connects.
pub struct Bootstrap {
    group: EventLoopGroup,
    factory: Arc<dyn ChannelFactory>,
    options: ChannelOptions,
    attributes: AttributeSpec,
    initializer: Option<Initializer>,
}

impl Bootstrap {
    pub fn new(group: EventLoopGroup, factory: Arc<dyn ChannelFactory>) -> Self {
        Self {
            group,
            factory,
            options: ChannelOptions::new(),
            attributes: AttributeSpec::new(),
            initializer: None,
        }
    }

    pub fn option<T: Send + Sync + 'static>(mut self, key: &'static str, value: T) -> Self {
        self.options = self.options.set(key, value);
        self
    }

    pub fn attr<T: Clone + Send + Sync + 'static>(mut self, key: AttributeKey<T>, value: T) -> Self {
        self.attributes = self.attributes.set(key, value);
        self
    }

    pub fn handler(mut self, initializer: impl Fn(&Pipeline) + Send + Sync + 'static) -> Self {
        self.initializer = Some(Arc::new(initializer));
        self
    }

    /// Build a channel on the next loop in the group, run the initializer,
    /// and issue `connect`. The returned watcher completes once the
    /// transport reports the connection established or failed.
    pub fn connect(&self, remote: ChannelAddress, local: Option<ChannelAddress>) -> Result<PromiseWatcher<()>> {
        let channel = self.build_channel()?;
        Ok(channel.connect(remote, local))
    }

    /// Like [`Self::connect`] but for connectionless transports (UDP, local
    /// datagram) that only need a local bind before sending.
    pub fn bind(&self, local: ChannelAddress) -> Result<PromiseWatcher<()>> {
        let channel = self.build_channel()?;
        Ok(channel.bind(local))
    }

    fn build_channel(&self) -> Result<Arc<dyn Channel>> {
        let event_loop = self.group.next();
        let channel = self.factory.new_channel(event_loop, &self.options)?;
        self.attributes.apply(channel.attributes());
        if let Some(initializer) = &self.initializer {
            initializer(channel.pipeline());
        }
        Ok(channel)
    }
}

/// Server-side bootstrap: binds a listening channel carrying the framework's
/// [`Acceptor`] handler, which hands each accepted child off to the child
/// group.
pub struct ServerBootstrap {
    group: EventLoopGroup,
    child_group: Arc<EventLoopGroup>,
    factory: Arc<dyn ChannelFactory>,
    options: ChannelOptions,
    attributes: AttributeSpec,
    child_options: ChannelOptions,
    child_attributes: AttributeSpec,
    initializer: Option<Initializer>,
    child_initializer: Option<Initializer>,
}

impl ServerBootstrap {
    pub fn new(group: EventLoopGroup, child_group: Arc<EventLoopGroup>, factory: Arc<dyn ChannelFactory>) -> Self {
        Self {
            group,
            child_group,
            factory,
            options: ChannelOptions::new(),
            attributes: AttributeSpec::new(),
            child_options: ChannelOptions::new(),
            child_attributes: AttributeSpec::new(),
            initializer: None,
            child_initializer: None,
        }
    }

    pub fn option<T: Send + Sync + 'static>(mut self, key: &'static str, value: T) -> Self {
        self.options = self.options.set(key, value);
        self
    }

    pub fn child_option<T: Send + Sync + 'static>(mut self, key: &'static str, value: T) -> Self {
        self.child_options = self.child_options.set(key, value);
        self
    }

    pub fn attr<T: Clone + Send + Sync + 'static>(mut self, key: AttributeKey<T>, value: T) -> Self {
        self.attributes = self.attributes.set(key, value);
        self
    }

    pub fn child_attr<T: Clone + Send + Sync + 'static>(mut self, key: AttributeKey<T>, value: T) -> Self {
        self.child_attributes = self.child_attributes.set(key, value);
        self
    }

    /// The listening channel's own initializer (rarely needed; most
    /// protocol setup belongs in `child_handler`).
    pub fn handler(mut self, initializer: impl Fn(&Pipeline) + Send + Sync + 'static) -> Self {
        self.initializer = Some(Arc::new(initializer));
        self
    }

    pub fn child_handler(mut self, initializer: impl Fn(&Pipeline) + Send + Sync + 'static) -> Self {
        self.child_initializer = Some(Arc::new(initializer));
        self
    }

    /// Build the listening channel, install the acceptor, run the
    /// listening channel's own initializer, and bind.
    ///
    /// The factory is handed `child_options`, not `options`: a server
    /// factory's `new_channel` mints the *listening* channel, but the
    /// options it reads back out (see e.g. `ember-transport-tcp`'s
    /// `TcpServerChannelFactory`) are documented as the ones applied to
    /// each *accepted child*, since that's the only socket-level config a
    /// transport like TCP has a use for here. `options`/`attr` remain for
    /// transports that do distinguish listener-level configuration.
    pub fn bind(&self, local: ChannelAddress) -> Result<PromiseWatcher<()>> {
        let event_loop = self.group.next();
        let channel = self.factory.new_channel(event_loop, &self.child_options)?;
        self.attributes.apply(channel.attributes());

        channel.pipeline().add_last(
            "acceptor",
            Acceptor {
                child_group: self.child_group_handle(),
                child_attributes: self.child_attributes.clone(),
                child_initializer: self.child_initializer.clone(),
            },
        )?;

        if let Some(initializer) = &self.initializer {
            initializer(channel.pipeline());
        }

        Ok(channel.bind(local))
    }

    fn child_group_handle(&self) -> EventLoopGroupHandle {
        EventLoopGroupHandle(self.child_group.clone())
    }
}

/// A cloneable handle onto the server's child group, so the [`Acceptor`]
/// (which must be `'static` to live in the pipeline) can assign a loop to
/// each accepted child without owning the whole group.
#[derive(Clone)]
struct EventLoopGroupHandle(Arc<EventLoopGroup>);

impl EventLoopGroupHandle {
    fn next(&self) -> crate::reactor::EventLoop {
        self.0.next()
    }
}

/// A message fired as a [`UserEvent`] on the listening channel's pipeline
/// once the transport has accepted and registered a new child channel on a
/// loop from the server's child group. Message-to-message dispatch in this
/// core is monomorphic over [`crate::buffer::Buffer`], so an accepted
/// channel — which is not a `Buffer` — travels as a user event rather than
/// through `channel-read`.
pub struct AcceptedChild(pub Arc<dyn Channel>);

/// Installed by [`ServerBootstrap::bind`] on the listening channel. Child
/// socket options are already baked in by the time an [`AcceptedChild`]
/// arrives here, since the factory built the listener from `child_options`
/// and most transports apply those to each child at accept time on their
/// own accept loop. On receiving the event, `install` applies the
/// configured child attributes, runs the child initializer, and marks the
/// child active; if that setup fails the child is forcibly closed rather
/// than left half-configured.
struct Acceptor {
    child_group: EventLoopGroupHandle,
    child_attributes: AttributeSpec,
    child_initializer: Option<Initializer>,
}

impl InboundHandler for Acceptor {
    fn event_mask(&self) -> EventMask {
        EventMask::USER_EVENT
    }

    fn user_event_triggered(&self, ctx: &Context, event: UserEvent) {
        let Some(child) = event.downcast_ref::<AcceptedChild>() else {
            ctx.fire_user_event_triggered(event);
            return;
        };
        if let Err(error) = self.install(&child.0) {
            ctx.fire_exception_caught(error);
            let _ = child.0.close();
        }
    }
}

impl Acceptor {
    fn install(&self, child: &Arc<dyn Channel>) -> Result<()> {
        child.register(self.child_group.next())?;
        self.child_attributes.apply(child.attributes());
        if let Some(initializer) = &self.child_initializer {
            initializer(child.pipeline());
        }
        child.pipeline().fire_channel_registered();
        child.pipeline().fire_channel_active();
        Ok(())
    }
}

impl OutboundHandler for Acceptor {}
