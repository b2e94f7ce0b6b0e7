//! Per-handler read throttling, independent of the channel's own
//! auto-read loop: while switched off, inbound messages are queued here and
//! released one at a time as the application downstream asks for them.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::buffer::Buffer;
use crate::error::Result;

use super::context::Context;
use super::handler::{EventMask, InboundHandler, OutboundHandler};

/// Buffers `channel-read` messages while `auto_read` is false, releasing
/// exactly one per downstream `read()` call. On `channel-inactive`, drains
/// and releases everything still queued.
pub struct FlowControlHandler {
    auto_read: AtomicBool,
    queue: Mutex<VecDeque<Buffer>>,
}

impl FlowControlHandler {
    pub fn new(auto_read: bool) -> Self {
        Self {
            auto_read: AtomicBool::new(auto_read),
            queue: Mutex::new(VecDeque::new()),
        }
    }

    pub fn set_auto_read(&self, auto_read: bool) {
        self.auto_read.store(auto_read, Ordering::Release);
    }

    pub fn is_auto_read(&self) -> bool {
        self.auto_read.load(Ordering::Acquire)
    }
}

impl InboundHandler for FlowControlHandler {
    fn event_mask(&self) -> EventMask {
        EventMask::CHANNEL_READ | EventMask::CHANNEL_INACTIVE
    }

    fn channel_read(&self, ctx: &Context, msg: Buffer) {
        if self.is_auto_read() {
            ctx.fire_channel_read(msg);
            return;
        }
        self.queue.lock().push_back(msg);
    }

    fn channel_inactive(&self, ctx: &Context) {
        let drained: Vec<Buffer> = self.queue.lock().drain(..).collect();
        for msg in drained {
            let _ = msg.release();
        }
        ctx.fire_channel_inactive();
    }
}

impl OutboundHandler for FlowControlHandler {
    fn event_mask(&self) -> EventMask {
        EventMask::READ
    }

    fn read(&self, ctx: &Context) -> Result<()> {
        if let Some(msg) = self.queue.lock().pop_front() {
            ctx.fire_channel_read(msg);
            return Ok(());
        }
        ctx.read()
    }
}
