//! The per-handler view into the pipeline: lets a handler propagate an
//! event to its neighbour, or push an outbound operation toward the
//! transport.

use crate::buffer::Buffer;
use crate::channel::ChannelAddress;
use crate::error::{CoreError, Result};
use crate::promise::Promise;

use super::handler::EventMask;
use super::{ContextHandle, Pipeline, UserEvent};

/// Identifies a position in the pipeline during dispatch. Cheap to copy;
/// borrowed from the [`Pipeline`] for the duration of one handler callback.
pub struct Context<'p> {
    pipeline: &'p Pipeline,
    handle: ContextHandle,
}

impl<'p> Context<'p> {
    pub(super) fn new(pipeline: &'p Pipeline, handle: ContextHandle) -> Self {
        Self { pipeline, handle }
    }

    pub fn handle(&self) -> ContextHandle {
        self.handle
    }

    pub fn name(&self) -> String {
        self.pipeline.context_name(self.handle)
    }

    /// A cheap owned clone of the pipeline this context belongs to, for a
    /// handler that needs to re-enter the chain later from outside a
    /// dispatch callback (e.g. a timer firing on the event loop).
    pub(crate) fn pipeline_clone(&self) -> Pipeline {
        self.pipeline.clone()
    }

    /// The event loop backing this pipeline, for a handler that schedules
    /// its own recurring work (idle/read/write timeouts).
    pub(crate) fn event_loop(&self) -> crate::reactor::EventLoop {
        self.pipeline.event_loop().clone()
    }

    // ---- inbound propagation (toward the tail) ----

    pub fn fire_channel_registered(&self) {
        self.pipeline
            .dispatch_inbound_from(self.handle, EventMask::CHANNEL_REGISTERED, |h, ctx| h.channel_registered(ctx));
    }

    pub fn fire_channel_unregistered(&self) {
        self.pipeline
            .dispatch_inbound_from(self.handle, EventMask::CHANNEL_UNREGISTERED, |h, ctx| {
                h.channel_unregistered(ctx)
            });
    }

    pub fn fire_channel_active(&self) {
        self.pipeline
            .dispatch_inbound_from(self.handle, EventMask::CHANNEL_ACTIVE, |h, ctx| h.channel_active(ctx));
    }

    pub fn fire_channel_inactive(&self) {
        self.pipeline
            .dispatch_inbound_from(self.handle, EventMask::CHANNEL_INACTIVE, |h, ctx| h.channel_inactive(ctx));
    }

    pub fn fire_channel_read(&self, msg: Buffer) {
        let msg = std::cell::RefCell::new(Some(msg));
        self.pipeline
            .dispatch_inbound_from(self.handle, EventMask::CHANNEL_READ, |h, ctx| {
                let msg = msg.borrow_mut().take().expect("channel_read dispatched twice");
                h.channel_read(ctx, msg);
            });
    }

    pub fn fire_channel_read_complete(&self) {
        self.pipeline
            .dispatch_inbound_from(self.handle, EventMask::CHANNEL_READ_COMPLETE, |h, ctx| {
                h.channel_read_complete(ctx)
            });
    }

    pub fn fire_channel_writability_changed(&self, is_writable: bool) {
        self.pipeline
            .dispatch_inbound_from(self.handle, EventMask::CHANNEL_WRITABILITY, |h, ctx| {
                h.channel_writability_changed(ctx, is_writable)
            });
    }

    pub fn fire_user_event_triggered(&self, event: UserEvent) {
        let event = std::cell::RefCell::new(Some(event));
        self.pipeline
            .dispatch_inbound_from(self.handle, EventMask::USER_EVENT, |h, ctx| {
                let event = event.borrow_mut().take().expect("user_event dispatched twice");
                h.user_event_triggered(ctx, event);
            });
    }

    pub fn fire_exception_caught(&self, error: CoreError) {
        let error = std::cell::RefCell::new(Some(error));
        self.pipeline
            .dispatch_inbound_from(self.handle, EventMask::EXCEPTION_CAUGHT, |h, ctx| {
                let error = error.borrow_mut().take().expect("exception dispatched twice");
                h.exception_caught(ctx, error);
            });
    }

    // ---- outbound propagation (toward the head / transport) ----
    //
    // Each call threads the caller's `Promise` down toward the transport;
    // a handler may intercept and complete it early without forwarding.

    pub fn bind(&self, local: ChannelAddress, promise: Promise<()>) {
        self.pipeline.outbound_bind(self.handle, local, promise)
    }

    pub fn connect(&self, remote: ChannelAddress, local: Option<ChannelAddress>, promise: Promise<()>) {
        self.pipeline.outbound_connect(self.handle, remote, local, promise)
    }

    pub fn disconnect(&self, promise: Promise<()>) {
        self.pipeline.outbound_disconnect(self.handle, promise)
    }

    pub fn close(&self, promise: Promise<()>) {
        self.pipeline.outbound_close(self.handle, promise)
    }

    pub fn read(&self) -> Result<()> {
        self.pipeline.outbound_read(self.handle)
    }

    pub fn write(&self, msg: Buffer, promise: Promise<()>) {
        self.pipeline.outbound_write(self.handle, msg, promise)
    }

    pub fn flush(&self) {
        self.pipeline.outbound_flush(self.handle);
    }
}
