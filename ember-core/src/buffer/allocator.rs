//! Pooled and unpooled buffer allocation strategies.

use super::pool::{PoolArena, PoolStats};
use super::{Buffer, Origin};
use std::sync::Arc;

/// The size band a requested initial capacity falls into. Huge requests
/// bypass the pool and fall back to [`UnpooledBufferAllocator`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SizeClass {
    /// `< 512 B`
    Tiny,
    /// `< 8 KiB`
    Small,
    /// `< 16 MiB`
    Normal,
    /// `>= 16 MiB`, never pooled.
    Huge,
}

impl SizeClass {
    pub fn classify(requested: usize) -> Self {
        const TINY_MAX: usize = 512;
        const SMALL_MAX: usize = 8 * 1024;
        const NORMAL_MAX: usize = 16 * 1024 * 1024;
        if requested < TINY_MAX {
            SizeClass::Tiny
        } else if requested < SMALL_MAX {
            SizeClass::Small
        } else if requested < NORMAL_MAX {
            SizeClass::Normal
        } else {
            SizeClass::Huge
        }
    }

    /// The chunk size allocated for this class (its upper bound).
    pub fn bytes(self) -> usize {
        match self {
            SizeClass::Tiny => 512,
            SizeClass::Small => 8 * 1024,
            SizeClass::Normal => 16 * 1024 * 1024,
            SizeClass::Huge => 0,
        }
    }
}

/// Common contract for anything that can mint a fresh [`Buffer`].
pub trait BufferAllocator: Send + Sync {
    fn buffer(&self, initial_capacity: usize, max_capacity: usize) -> Buffer;
}

/// One allocation (`Vec::with_capacity`) per buffer; no reuse.
#[derive(Default)]
pub struct UnpooledBufferAllocator;

impl BufferAllocator for UnpooledBufferAllocator {
    fn buffer(&self, initial_capacity: usize, max_capacity: usize) -> Buffer {
        Buffer::new_root(Vec::with_capacity(initial_capacity), max_capacity, Origin::Unpooled)
    }
}

/// A size-classed arena of reusable chunks, intended to be owned one-per
/// event loop to avoid churn on hot read/write paths.
pub struct PooledBufferAllocator {
    arena: Arc<PoolArena>,
    unpooled: UnpooledBufferAllocator,
}

impl Default for PooledBufferAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl PooledBufferAllocator {
    pub fn new() -> Self {
        Self {
            arena: Arc::new(PoolArena::new()),
            unpooled: UnpooledBufferAllocator,
        }
    }

    pub fn stats(&self) -> PoolStats {
        self.arena.stats()
    }
}

impl BufferAllocator for PooledBufferAllocator {
    fn buffer(&self, initial_capacity: usize, max_capacity: usize) -> Buffer {
        let class = SizeClass::classify(initial_capacity);
        if class == SizeClass::Huge {
            return self.unpooled.buffer(initial_capacity, max_capacity);
        }
        let chunk = self.arena.take(class);
        Buffer::new_root(
            chunk,
            max_capacity,
            Origin::Pooled {
                pool: self.arena.clone(),
                class,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn huge_requests_bypass_the_pool() {
        let alloc = PooledBufferAllocator::new();
        let buf = alloc.buffer(32 * 1024 * 1024, 32 * 1024 * 1024);
        assert!(buf.release());
        assert_eq!(alloc.stats().normal_free, 0);
    }

    #[test]
    fn released_chunks_are_reused() {
        let alloc = PooledBufferAllocator::new();
        let buf = alloc.buffer(100, 100);
        assert!(buf.release());
        assert_eq!(alloc.stats().tiny_free, 1);
        let _buf2 = alloc.buffer(100, 100);
        assert_eq!(alloc.stats().tiny_free, 0);
    }
}
