//! Receive-buffer sizing: how big a guess buffer the channel's read loop
//! should allocate for its next read.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Produces a capacity guess for the next read, and records how many bytes
/// were actually read so the next guess can adapt.
pub trait RecvBufferAllocator: Send + Sync {
    fn guess(&self) -> usize;
    fn record(&self, actual: usize);
}

/// Doubling step table above a 16-byte floor: linear steps of 16 up to
/// 512, then straight doubling up to 64 KiB.
fn size_table() -> &'static [usize] {
    const fn build() -> [usize; 39] {
        let mut table = [0usize; 39];
        let mut i = 0;
        let mut v = 16;
        while v <= 512 {
            table[i] = v;
            v += 16;
            i += 1;
        }
        v = 1024;
        while v <= 65536 {
            table[i] = v;
            v *= 2;
            i += 1;
        }
        table
    }
    static TABLE: [usize; 39] = build();
    &TABLE
}

/// Adapts its guess from recent read sizes: two consecutive reads at or
/// under the step below the current guess move the index down one step;
/// a read that completely fills the current guess moves it up one step.
pub struct AdaptiveRecvBufferAllocator {
    index: AtomicUsize,
    underfill_streak: AtomicUsize,
    min_index: usize,
    max_index: usize,
}

impl AdaptiveRecvBufferAllocator {
    pub fn new(initial: usize, minimum: usize, maximum: usize) -> Self {
        let table = size_table();
        let index_of = |target: usize| {
            table
                .iter()
                .position(|&v| v >= target)
                .unwrap_or(table.len() - 1)
        };
        Self {
            index: AtomicUsize::new(index_of(initial)),
            underfill_streak: AtomicUsize::new(0),
            min_index: index_of(minimum),
            max_index: index_of(maximum),
        }
    }
}

impl Default for AdaptiveRecvBufferAllocator {
    fn default() -> Self {
        Self::new(1024, 64, 65536)
    }
}

impl RecvBufferAllocator for AdaptiveRecvBufferAllocator {
    fn guess(&self) -> usize {
        size_table()[self.index.load(Ordering::Acquire)]
    }

    fn record(&self, actual: usize) {
        let table = size_table();
        let index = self.index.load(Ordering::Acquire);
        let current = table[index];

        if index > self.min_index && actual <= table[index.saturating_sub(1)] {
            let streak = self.underfill_streak.fetch_add(1, Ordering::AcqRel) + 1;
            if streak >= 2 {
                self.index.store(index.saturating_sub(1).max(self.min_index), Ordering::Release);
                self.underfill_streak.store(0, Ordering::Release);
            }
        } else {
            self.underfill_streak.store(0, Ordering::Release);
            if actual >= current && index < self.max_index {
                self.index.store(index + 1, Ordering::Release);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_reads_grow_the_guess() {
        let allocator = AdaptiveRecvBufferAllocator::new(16, 16, 65536);
        let first = allocator.guess();
        allocator.record(first);
        assert!(allocator.guess() > first);
    }

    #[test]
    fn two_consecutive_small_reads_shrink_the_guess() {
        let allocator = AdaptiveRecvBufferAllocator::new(1024, 16, 65536);
        let start = allocator.guess();
        allocator.record(8);
        assert_eq!(allocator.guess(), start, "one small read is not enough");
        allocator.record(8);
        assert!(allocator.guess() < start);
    }
}
