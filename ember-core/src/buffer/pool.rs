//! Thread-local, size-classed chunk pools backing [`super::PooledBufferAllocator`].

use super::SizeClass;
use parking_lot::Mutex;

/// A single event loop's (or thread's) pool of reusable chunks, one free
/// list per size class.
pub(crate) struct PoolArena {
    tiny: Mutex<Vec<Vec<u8>>>,
    small: Mutex<Vec<Vec<u8>>>,
    normal: Mutex<Vec<Vec<u8>>>,
}

impl PoolArena {
    pub(crate) fn new() -> Self {
        Self {
            tiny: Mutex::new(Vec::new()),
            small: Mutex::new(Vec::new()),
            normal: Mutex::new(Vec::new()),
        }
    }

    fn list_for(&self, class: SizeClass) -> &Mutex<Vec<Vec<u8>>> {
        match class {
            SizeClass::Tiny => &self.tiny,
            SizeClass::Small => &self.small,
            SizeClass::Normal => &self.normal,
            SizeClass::Huge => unreachable!("huge requests are routed to the unpooled allocator"),
        }
    }

    /// Take a chunk of at least `class.bytes()` capacity, reusing a freed one
    /// if the free list for this class is non-empty.
    pub(crate) fn take(&self, class: SizeClass) -> Vec<u8> {
        let mut list = self.list_for(class).lock();
        match list.pop() {
            Some(mut chunk) => {
                chunk.clear();
                chunk
            }
            None => Vec::with_capacity(class.bytes()),
        }
    }

    /// Return a chunk to its size class's free list for reuse.
    pub(crate) fn reclaim(&self, class: SizeClass, mut storage: Vec<u8>) {
        storage.clear();
        self.list_for(class).lock().push(storage);
    }

    pub(crate) fn stats(&self) -> PoolStats {
        PoolStats {
            tiny_free: self.tiny.lock().len(),
            small_free: self.small.lock().len(),
            normal_free: self.normal.lock().len(),
        }
    }
}

/// A snapshot of free-list occupancy, useful for tests and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub tiny_free: usize,
    pub small_free: usize,
    pub normal_free: usize,
}
