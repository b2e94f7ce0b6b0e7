//! Aggregates a start message plus its accumulating content messages into
//! one combined message, enforcing a maximum assembled size.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::buffer::{Buffer, BufferAllocator};
use crate::error::{CoreError, ErrorKind};

use super::context::Context;
use super::handler::{EventMask, InboundHandler, OutboundHandler};

/// The structural role of one inbound message in a larger logical frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameRole {
    Start,
    Content,
    LastContent,
    /// A complete frame delivered in a single message.
    StartAndEnd,
}

/// Classifies each inbound message's [`FrameRole`] for the [`Aggregator`]
/// that sits above a decoder in the pipeline.
pub trait FrameClassifier: Send + Sync + 'static {
    fn classify(&self, msg: &Buffer) -> FrameRole;
}

struct AggregatorState {
    parts: Vec<Buffer>,
    total_len: usize,
}

impl AggregatorState {
    fn reset(&mut self) {
        for part in self.parts.drain(..) {
            let _ = part.release();
        }
        self.total_len = 0;
    }
}

/// Sits downstream of a decoder, holding accumulating content until a
/// terminal message arrives, then emits one combined message. Discards and
/// raises [`ErrorKind::TooLongFrame`] if the running total exceeds
/// `max_size` before a terminal message is seen.
pub struct Aggregator<C> {
    classifier: C,
    max_size: usize,
    allocator: Arc<dyn BufferAllocator>,
    state: Mutex<AggregatorState>,
}

impl<C: FrameClassifier> Aggregator<C> {
    pub fn new(classifier: C, max_size: usize, allocator: Arc<dyn BufferAllocator>) -> Self {
        Self {
            classifier,
            max_size,
            allocator,
            state: Mutex::new(AggregatorState {
                parts: Vec::new(),
                total_len: 0,
            }),
        }
    }

    fn combine(&self, state: &mut AggregatorState) -> crate::error::Result<Buffer> {
        let mut combined = self.allocator.buffer(state.total_len, state.total_len);
        for part in state.parts.drain(..) {
            let bytes = part.peek_readable()?;
            combined.write(&bytes)?;
            let _ = part.release();
        }
        state.total_len = 0;
        Ok(combined)
    }
}

impl<C: FrameClassifier> InboundHandler for Aggregator<C> {
    fn event_mask(&self) -> EventMask {
        EventMask::CHANNEL_READ | EventMask::CHANNEL_INACTIVE
    }

    fn channel_read(&self, ctx: &Context, msg: Buffer) {
        let role = self.classifier.classify(&msg);
        if matches!(role, FrameRole::StartAndEnd) {
            ctx.fire_channel_read(msg);
            return;
        }

        let mut state = self.state.lock();
        if matches!(role, FrameRole::Start) {
            state.reset();
        }

        let len = msg.readable_bytes();
        state.parts.push(msg);
        state.total_len += len;

        if state.total_len > self.max_size {
            state.reset();
            drop(state);
            ctx.fire_exception_caught(CoreError::new(
                ErrorKind::TooLongFrame,
                format!("aggregated frame exceeded max size {}", self.max_size),
            ));
            return;
        }

        if matches!(role, FrameRole::LastContent) {
            let combined = self.combine(&mut state);
            drop(state);
            match combined {
                Ok(combined) => ctx.fire_channel_read(combined),
                Err(error) => ctx.fire_exception_caught(error),
            }
        }
    }

    fn channel_inactive(&self, ctx: &Context) {
        self.state.lock().reset();
        ctx.fire_channel_inactive();
    }
}

impl<C: Send + Sync + 'static> OutboundHandler for Aggregator<C> {}
