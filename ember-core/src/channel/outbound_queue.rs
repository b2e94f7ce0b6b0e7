//! The two-stage outbound write buffer: an unflushed queue that `flush`
//! moves into a flushed queue, drained head-to-tail against the transport.

use std::collections::VecDeque;

use crate::buffer::Buffer;
use crate::error::{CoreError, ErrorKind, Result};
use crate::promise::Promise;

/// High/low water-marks governing a channel's `is_writable` signal.
#[derive(Clone, Copy, Debug)]
pub struct WaterMark {
    pub high: usize,
    pub low: usize,
}

impl WaterMark {
    pub fn new(low: usize, high: usize) -> Self {
        assert!(low < high, "low water-mark must be below high water-mark");
        Self { high, low }
    }
}

impl Default for WaterMark {
    fn default() -> Self {
        // 64 KiB / 32 KiB.
        Self::new(32 * 1024, 64 * 1024)
    }
}

pub(crate) struct OutboundEntry {
    pub message: Buffer,
    pub estimated_size: usize,
    pub promise: Promise<()>,
}

/// An unflushed/flushed pair of queues plus the pending-bytes counter that
/// drives writability hysteresis.
pub struct OutboundQueue {
    unflushed: VecDeque<OutboundEntry>,
    flushed: VecDeque<OutboundEntry>,
    pending_bytes: usize,
    water_mark: WaterMark,
    writable: bool,
}

impl OutboundQueue {
    pub fn new(water_mark: WaterMark) -> Self {
        Self {
            unflushed: VecDeque::new(),
            flushed: VecDeque::new(),
            pending_bytes: 0,
            water_mark,
            writable: true,
        }
    }

    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Enqueue a message onto the unflushed list. Returns `true` if this
    /// write crossed the high water-mark (caller should fire
    /// `channel-writability-changed(false)`).
    pub fn enqueue(&mut self, message: Buffer, estimated_size: usize, promise: Promise<()>) -> bool {
        self.pending_bytes += estimated_size;
        self.unflushed.push_back(OutboundEntry {
            message,
            estimated_size,
            promise,
        });
        self.check_high_water_mark()
    }

    fn check_high_water_mark(&mut self) -> bool {
        if self.writable && self.pending_bytes >= self.water_mark.high {
            self.writable = false;
            true
        } else {
            false
        }
    }

    fn check_low_water_mark(&mut self) -> bool {
        if !self.writable && self.pending_bytes <= self.water_mark.low {
            self.writable = true;
            true
        } else {
            false
        }
    }

    /// Move every unflushed entry to the flushed list, in order.
    pub fn flush(&mut self) {
        self.flushed.append(&mut self.unflushed);
    }

    pub fn has_flushed(&self) -> bool {
        !self.flushed.is_empty()
    }

    /// Drain the flushed list, writing each entry via `write_fn`, which
    /// returns the number of bytes of the entry's message actually written.
    /// Stops at the first zero-progress write (backpressure from the
    /// transport) or once the list is empty. Returns `true` if this drain
    /// crossed the low water-mark downward.
    pub fn drain_with<F>(&mut self, mut write_fn: F) -> Result<bool>
    where
        F: FnMut(&mut Buffer) -> Result<usize>,
    {
        let mut crossed_low = false;
        while let Some(entry) = self.flushed.front_mut() {
            let before = entry.message.readable_bytes();
            if before == 0 {
                let entry = self.flushed.pop_front().unwrap();
                entry.promise.succeed(());
                self.pending_bytes = self.pending_bytes.saturating_sub(entry.estimated_size);
                crossed_low |= self.check_low_water_mark();
                continue;
            }
            let written = write_fn(&mut entry.message)?;
            if written == 0 {
                break;
            }
            if entry.message.readable_bytes() == 0 {
                let entry = self.flushed.pop_front().unwrap();
                entry.promise.succeed(());
                self.pending_bytes = self.pending_bytes.saturating_sub(entry.estimated_size);
                crossed_low |= self.check_low_water_mark();
            }
        }
        Ok(crossed_low)
    }

    /// Fail every queued entry (both lists) with a `transport-closed` error
    /// and release their buffers. Used on channel close.
    pub fn fail_all_transport_closed(&mut self) {
        let failure = || CoreError::new(ErrorKind::TransportClosed, "channel closed with pending writes");
        for entry in self.flushed.drain(..).chain(self.unflushed.drain(..)) {
            entry.promise.fail(failure());
            entry.message.release();
        }
        self.pending_bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Origin;

    fn buf(bytes: &[u8]) -> Buffer {
        Buffer::new_root(bytes.to_vec(), bytes.len(), Origin::Unpooled)
    }

    #[test]
    fn crosses_high_then_low_water_mark() {
        let mut queue = OutboundQueue::new(WaterMark::new(16 * 1024, 64 * 1024));
        let mut crossed_high = false;
        for _ in 0..200 {
            let (promise, _) = Promise::new();
            crossed_high |= queue.enqueue(buf(&[0u8; 1024]), 1024, promise);
        }
        assert!(crossed_high);
        assert!(!queue.is_writable());

        queue.flush();
        let crossed_low = queue
            .drain_with(|msg| {
                let n = msg.readable_bytes();
                msg.advance_reader(n).unwrap();
                Ok(n)
            })
            .unwrap();
        assert!(crossed_low);
        assert!(queue.is_writable());
    }

    #[test]
    fn close_fails_pending_writes() {
        let mut queue = OutboundQueue::new(WaterMark::default());
        let (promise, watcher) = Promise::new();
        queue.enqueue(buf(b"hi"), 2, promise);
        queue.fail_all_transport_closed();
        let outcome = watcher.try_take().expect("promise already completed");
        assert!(outcome.is_failure());
    }
}
