//! Drives a lazy, finite sequence of payload chunks across the pipeline,
//! one write per writability notification, so a large payload never has to
//! sit fully materialized in memory or ignore the channel's back-pressure.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::buffer::Buffer;
use crate::error::{CoreError, ErrorKind, Result};
use crate::promise::Promise;

use super::context::Context;
use super::handler::{EventMask, InboundHandler, OutboundHandler};

/// A restartable-at-the-source's-discretion sequence of payload chunks.
/// `next_chunk` returning `Ok(None)` signals the source is drained.
pub trait ChunkedInput: Send {
    fn next_chunk(&mut self) -> Result<Option<Buffer>>;

    /// Called once the source is drained, errors, or the channel goes
    /// inactive while it is still pending.
    fn close(&mut self) {}
}

struct PendingChunked {
    source: Box<dyn ChunkedInput>,
    promise: Option<Promise<()>>,
}

/// Sits in the outbound chain; the application calls [`Self::write_chunked`]
/// directly (rather than through `OutboundHandler::write`, since a chunked
/// source is not itself a [`Buffer`]) to enqueue a source for writing.
pub struct ChunkedWriteHandler {
    queue: Mutex<VecDeque<PendingChunked>>,
}

impl Default for ChunkedWriteHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkedWriteHandler {
    pub fn new() -> Self {
        Self { queue: Mutex::new(VecDeque::new()) }
    }

    /// Enqueue `source` and, if nothing is already in flight, attempt the
    /// first pull immediately.
    pub fn write_chunked(&self, ctx: &Context, source: Box<dyn ChunkedInput>) -> crate::promise::PromiseWatcher<()> {
        let (promise, watcher) = Promise::new();
        let was_empty = {
            let mut queue = self.queue.lock();
            let was_empty = queue.is_empty();
            queue.push_back(PendingChunked { source, promise: Some(promise) });
            was_empty
        };
        if was_empty {
            self.pump(ctx);
        }
        watcher
    }

    /// Pull one chunk from the front source and issue a write for it,
    /// advancing past exhausted or failing sources until one yields a
    /// chunk or the queue empties.
    fn pump(&self, ctx: &Context) {
        loop {
            let next_chunk = {
                let mut queue = self.queue.lock();
                let Some(pending) = queue.front_mut() else { return };
                pending.source.next_chunk()
            };

            match next_chunk {
                Ok(Some(chunk)) => {
                    let (chunk_promise, _chunk_watcher) = Promise::new();
                    ctx.write(chunk, chunk_promise);
                    return;
                }
                Ok(None) => {
                    self.finish_front(|s| s.close());
                    continue;
                }
                Err(error) => {
                    self.finish_front_with_error(error);
                    continue;
                }
            }
        }
    }

    fn finish_front(&self, close: impl FnOnce(&mut dyn ChunkedInput)) {
        let mut pending = {
            let mut queue = self.queue.lock();
            queue.pop_front()
        };
        if let Some(pending) = pending.as_mut() {
            close(pending.source.as_mut());
            if let Some(promise) = pending.promise.take() {
                promise.succeed(());
            }
        }
    }

    fn finish_front_with_error(&self, error: CoreError) {
        let mut pending = {
            let mut queue = self.queue.lock();
            queue.pop_front()
        };
        if let Some(pending) = pending.as_mut() {
            pending.source.close();
            if let Some(promise) = pending.promise.take() {
                promise.fail(error);
            }
        }
    }

    fn drain_on_inactive(&self) {
        let drained: Vec<PendingChunked> = self.queue.lock().drain(..).collect();
        for mut pending in drained {
            pending.source.close();
            if let Some(promise) = pending.promise.take() {
                promise.fail(CoreError::new(ErrorKind::TransportClosed, "channel went inactive during chunked write"));
            }
        }
    }
}

impl InboundHandler for ChunkedWriteHandler {
    fn event_mask(&self) -> EventMask {
        EventMask::CHANNEL_WRITABILITY | EventMask::CHANNEL_INACTIVE
    }

    fn channel_writability_changed(&self, ctx: &Context, is_writable: bool) {
        if is_writable {
            self.pump(ctx);
        }
        ctx.fire_channel_writability_changed(is_writable);
    }

    fn channel_inactive(&self, ctx: &Context) {
        self.drain_on_inactive();
        ctx.fire_channel_inactive();
    }
}

impl OutboundHandler for ChunkedWriteHandler {}
