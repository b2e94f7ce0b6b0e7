//! Inbound/outbound handler contracts and the event mask each handler
//! declares up front, in place of runtime reflection over which callbacks
//! it overrides.

use crate::channel::ChannelAddress;
use crate::error::{CoreError, Result};
use crate::promise::Promise;

use super::context::Context;
use super::UserEvent;
use crate::buffer::Buffer;

bitflags::bitflags! {
    /// Which of the fourteen pipeline events a handler actually cares
    /// about. Declared once at construction (via [`InboundHandler::event_mask`]
    /// / [`OutboundHandler::event_mask`]) rather than discovered by
    /// inspecting the handler at dispatch time.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct EventMask: u16 {
        const CHANNEL_REGISTERED      = 1 << 0;
        const CHANNEL_UNREGISTERED    = 1 << 1;
        const CHANNEL_ACTIVE          = 1 << 2;
        const CHANNEL_INACTIVE        = 1 << 3;
        const CHANNEL_READ            = 1 << 4;
        const CHANNEL_READ_COMPLETE   = 1 << 5;
        const CHANNEL_WRITABILITY     = 1 << 6;
        const USER_EVENT              = 1 << 7;
        const EXCEPTION_CAUGHT        = 1 << 8;
        const BIND                    = 1 << 9;
        const CONNECT                 = 1 << 10;
        const DISCONNECT              = 1 << 11;
        const CLOSE                   = 1 << 12;
        const READ                    = 1 << 13;
        const WRITE                   = 1 << 14;
        const FLUSH                   = 1 << 15;

        const ALL_INBOUND = Self::CHANNEL_REGISTERED.bits()
            | Self::CHANNEL_UNREGISTERED.bits()
            | Self::CHANNEL_ACTIVE.bits()
            | Self::CHANNEL_INACTIVE.bits()
            | Self::CHANNEL_READ.bits()
            | Self::CHANNEL_READ_COMPLETE.bits()
            | Self::CHANNEL_WRITABILITY.bits()
            | Self::USER_EVENT.bits()
            | Self::EXCEPTION_CAUGHT.bits();

        const ALL_OUTBOUND = Self::BIND.bits()
            | Self::CONNECT.bits()
            | Self::DISCONNECT.bits()
            | Self::CLOSE.bits()
            | Self::READ.bits()
            | Self::WRITE.bits()
            | Self::FLUSH.bits();
    }
}

/// Inbound event contract: the forward data-flow from transport to
/// application. Every method defaults to forwarding the event unchanged to
/// the next inbound context, so a handler only needs to override the
/// events it actually processes.
pub trait InboundHandler: Send + Sync + 'static {
    fn event_mask(&self) -> EventMask {
        EventMask::ALL_INBOUND
    }

    fn channel_registered(&self, ctx: &Context) {
        ctx.fire_channel_registered();
    }

    fn channel_unregistered(&self, ctx: &Context) {
        ctx.fire_channel_unregistered();
    }

    fn channel_active(&self, ctx: &Context) {
        ctx.fire_channel_active();
    }

    fn channel_inactive(&self, ctx: &Context) {
        ctx.fire_channel_inactive();
    }

    fn channel_read(&self, ctx: &Context, msg: Buffer) {
        ctx.fire_channel_read(msg);
    }

    fn channel_read_complete(&self, ctx: &Context) {
        ctx.fire_channel_read_complete();
    }

    fn channel_writability_changed(&self, ctx: &Context, is_writable: bool) {
        ctx.fire_channel_writability_changed(is_writable);
    }

    fn user_event_triggered(&self, ctx: &Context, event: UserEvent) {
        ctx.fire_user_event_triggered(event);
    }

    fn exception_caught(&self, ctx: &Context, error: CoreError) {
        ctx.fire_exception_caught(error);
    }
}

/// Outbound event contract: the reverse data-flow from application to
/// transport. Every method defaults to forwarding toward the head (the
/// context closer to the transport). Operations that complete
/// asynchronously take the [`Promise`] to fulfil rather than returning
/// one, so a handler can intercept and fail a request early without the
/// transport ever seeing it.
pub trait OutboundHandler: Send + Sync + 'static {
    fn event_mask(&self) -> EventMask {
        EventMask::ALL_OUTBOUND
    }

    fn bind(&self, ctx: &Context, local: ChannelAddress, promise: Promise<()>) {
        ctx.bind(local, promise)
    }

    fn connect(&self, ctx: &Context, remote: ChannelAddress, local: Option<ChannelAddress>, promise: Promise<()>) {
        ctx.connect(remote, local, promise)
    }

    fn disconnect(&self, ctx: &Context, promise: Promise<()>) {
        ctx.disconnect(promise)
    }

    fn close(&self, ctx: &Context, promise: Promise<()>) {
        ctx.close(promise)
    }

    fn read(&self, ctx: &Context) -> Result<()> {
        ctx.read()
    }

    fn write(&self, ctx: &Context, msg: Buffer, promise: Promise<()>) {
        ctx.write(msg, promise)
    }

    fn flush(&self, ctx: &Context) {
        ctx.flush();
    }
}

/// Wraps a handler that only implements [`InboundHandler`], supplying pure
/// pass-through [`OutboundHandler`] behavior so it can still occupy a
/// duplex context slot.
pub struct InboundOnly<H>(pub H);

impl<H: InboundHandler> InboundHandler for InboundOnly<H> {
    fn event_mask(&self) -> EventMask {
        self.0.event_mask()
    }
    fn channel_registered(&self, ctx: &Context) {
        self.0.channel_registered(ctx)
    }
    fn channel_unregistered(&self, ctx: &Context) {
        self.0.channel_unregistered(ctx)
    }
    fn channel_active(&self, ctx: &Context) {
        self.0.channel_active(ctx)
    }
    fn channel_inactive(&self, ctx: &Context) {
        self.0.channel_inactive(ctx)
    }
    fn channel_read(&self, ctx: &Context, msg: Buffer) {
        self.0.channel_read(ctx, msg)
    }
    fn channel_read_complete(&self, ctx: &Context) {
        self.0.channel_read_complete(ctx)
    }
    fn channel_writability_changed(&self, ctx: &Context, is_writable: bool) {
        self.0.channel_writability_changed(ctx, is_writable)
    }
    fn user_event_triggered(&self, ctx: &Context, event: UserEvent) {
        self.0.user_event_triggered(ctx, event)
    }
    fn exception_caught(&self, ctx: &Context, error: CoreError) {
        self.0.exception_caught(ctx, error)
    }
}

impl<H: Send + Sync + 'static> OutboundHandler for InboundOnly<H> {}

/// Wraps a handler that only implements [`OutboundHandler`], supplying pure
/// pass-through [`InboundHandler`] behavior.
pub struct OutboundOnly<H>(pub H);

impl<H: Send + Sync + 'static> InboundHandler for OutboundOnly<H> {}

impl<H: OutboundHandler> OutboundHandler for OutboundOnly<H> {
    fn event_mask(&self) -> EventMask {
        self.0.event_mask()
    }
    fn bind(&self, ctx: &Context, local: ChannelAddress, promise: Promise<()>) {
        self.0.bind(ctx, local, promise)
    }
    fn connect(&self, ctx: &Context, remote: ChannelAddress, local: Option<ChannelAddress>, promise: Promise<()>) {
        self.0.connect(ctx, remote, local, promise)
    }
    fn disconnect(&self, ctx: &Context, promise: Promise<()>) {
        self.0.disconnect(ctx, promise)
    }
    fn close(&self, ctx: &Context, promise: Promise<()>) {
        self.0.close(ctx, promise)
    }
    fn read(&self, ctx: &Context) -> Result<()> {
        self.0.read(ctx)
    }
    fn write(&self, ctx: &Context, msg: Buffer, promise: Promise<()>) {
        self.0.write(ctx, msg, promise)
    }
    fn flush(&self, ctx: &Context) {
        self.0.flush(ctx)
    }
}
