//! Reference-counted, sliceable byte buffers: the payload representation
//! shared by every layer above this one.
//!
//! Splits a read-facing and a write-facing view over one backing store,
//! using a manual atomic refcount (see [`Buffer::retain`]/[`Buffer::release`])
//! rather than `Arc`-only counting, because slices and duplicates must share
//! one logical count while carrying independent reader/writer indices, which
//! `Arc` alone cannot express without also sharing the indices.

mod allocator;
mod composite;
mod pool;
mod readable;
mod writable;

pub use allocator::{BufferAllocator, PooledBufferAllocator, SizeClass, UnpooledBufferAllocator};
pub use composite::CompositeBuffer;
pub use readable::ReadableBuffer;
pub use writable::WritableBuffer;

use crate::error::{CoreError, ErrorKind, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub(crate) enum Origin {
    Unpooled,
    Pooled {
        pool: Arc<pool::PoolArena>,
        class: SizeClass,
    },
}

struct Shared {
    storage: parking_lot::Mutex<Vec<u8>>,
    max_capacity: usize,
    count: AtomicUsize,
    origin: Origin,
}

impl Shared {
    fn reclaim(&self, storage: Vec<u8>) {
        match &self.origin {
            Origin::Unpooled => {}
            Origin::Pooled { pool, class } => pool.reclaim(*class, storage),
        }
    }
}

/// A growable, sliceable window over byte data.
///
/// Invariant (enforced by every mutating method):
/// `0 <= reader_index <= writer_index <= capacity <= max_capacity`.
pub struct Buffer {
    shared: Arc<Shared>,
    base: usize,
    /// `Some(len)` for a fixed-size view (slice); `None` for a view that
    /// tracks the shared storage's current length (root buffer / duplicate).
    window: Option<usize>,
    reader_index: usize,
    writer_index: usize,
}

fn checked_decrement(count: &AtomicUsize) -> usize {
    loop {
        let current = count.load(Ordering::Acquire);
        assert!(
            current > 0,
            "buffer released more times than retained (reference-count-violation)"
        );
        if count
            .compare_exchange(current, current - 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return current - 1;
        }
    }
}

impl Buffer {
    pub(crate) fn new_root(storage: Vec<u8>, max_capacity: usize, origin: Origin) -> Self {
        let len = storage.len();
        Self {
            shared: Arc::new(Shared {
                storage: parking_lot::Mutex::new(storage),
                max_capacity,
                count: AtomicUsize::new(1),
                origin,
            }),
            base: 0,
            window: None,
            reader_index: 0,
            writer_index: len,
        }
    }

    fn is_live(&self) -> bool {
        self.shared.count.load(Ordering::Acquire) > 0
    }

    fn require_live(&self) -> Result<()> {
        if self.is_live() {
            Ok(())
        } else {
            Err(CoreError::new(
                ErrorKind::ReferenceCountViolation,
                "access to a released buffer",
            ))
        }
    }

    pub fn reader_index(&self) -> usize {
        self.reader_index
    }

    pub fn writer_index(&self) -> usize {
        self.writer_index
    }

    pub fn capacity(&self) -> usize {
        match self.window {
            Some(len) => len,
            None => self.shared.storage.lock().len() - self.base,
        }
    }

    pub fn max_capacity(&self) -> usize {
        match self.window {
            Some(len) => len,
            None => self.shared.max_capacity - self.base,
        }
    }

    pub fn readable_bytes(&self) -> usize {
        self.writer_index - self.reader_index
    }

    pub fn ref_count(&self) -> usize {
        self.shared.count.load(Ordering::Acquire)
    }

    /// Increment the shared reference count and return an additional owned
    /// handle with the same indices as `self`.
    pub fn retain(&self) -> Result<Buffer> {
        self.require_live()?;
        self.shared.count.fetch_add(1, Ordering::AcqRel);
        Ok(Buffer {
            shared: self.shared.clone(),
            base: self.base,
            window: self.window,
            reader_index: self.reader_index,
            writer_index: self.writer_index,
        })
    }

    /// Decrement the shared reference count, consuming this handle. Returns
    /// `true` if this was the last reference, in which case the backing
    /// storage has been released (or returned to its pool).
    ///
    /// Panics if the shared count was already zero: a double-release is a
    /// fatal logic error, not a recoverable one.
    pub fn release(self) -> bool {
        let remaining = checked_decrement(&self.shared.count);
        if remaining == 0 {
            let storage = std::mem::take(&mut *self.shared.storage.lock());
            self.shared.reclaim(storage);
            true
        } else {
            false
        }
    }

    /// A view sharing storage and reference count, with its own independent
    /// reader/writer indices initialized to `self`'s current indices. Does
    /// NOT increment the reference count; see [`Self::retained_duplicate`].
    pub fn duplicate(&self) -> Result<Buffer> {
        self.require_live()?;
        Ok(Buffer {
            shared: self.shared.clone(),
            base: self.base,
            window: self.window,
            reader_index: self.reader_index,
            writer_index: self.writer_index,
        })
    }

    pub fn retained_duplicate(&self) -> Result<Buffer> {
        let dup = self.duplicate()?;
        self.shared.count.fetch_add(1, Ordering::AcqRel);
        Ok(dup)
    }

    /// A fixed-size view over `[offset, offset + len)` of this buffer's
    /// readable+writable window, sharing storage and reference count. The
    /// slice's own reader index starts at 0 and writer index at `len`.
    pub fn slice(&self, offset: usize, len: usize) -> Result<Buffer> {
        self.require_live()?;
        if offset + len > self.capacity() {
            return Err(CoreError::new(
                ErrorKind::IndexOutOfRange,
                format!(
                    "slice[{offset}, {offset}+{len}) exceeds capacity {}",
                    self.capacity()
                ),
            ));
        }
        Ok(Buffer {
            shared: self.shared.clone(),
            base: self.base + offset,
            window: Some(len),
            reader_index: 0,
            writer_index: len,
        })
    }

    pub fn retained_slice(&self, offset: usize, len: usize) -> Result<Buffer> {
        let view = self.slice(offset, len)?;
        self.shared.count.fetch_add(1, Ordering::AcqRel);
        Ok(view)
    }

    /// Ensure the backing storage has at least `additional` bytes of spare
    /// capacity past `writer_index`, growing (up to `max_capacity`) if this
    /// is a growable (non-slice) view.
    fn ensure_writable(&mut self, additional: usize) -> Result<()> {
        self.require_live()?;
        let needed = self.writer_index + additional;
        match self.window {
            Some(len) => {
                if needed > len {
                    return Err(CoreError::new(
                        ErrorKind::IndexOutOfRange,
                        "write exceeds fixed-size slice capacity",
                    ));
                }
                Ok(())
            }
            None => {
                let mut storage = self.shared.storage.lock();
                let absolute_needed = self.base + needed;
                if absolute_needed > self.shared.max_capacity {
                    return Err(CoreError::new(
                        ErrorKind::IndexOutOfRange,
                        "write exceeds max_capacity",
                    ));
                }
                if storage.len() < absolute_needed {
                    storage.resize(absolute_needed, 0);
                }
                Ok(())
            }
        }
    }

    /// Read up to `dst.len()` bytes starting at `reader_index`, advancing it.
    /// Reading with `reader_index == writer_index` returns `0` without
    /// moving any index.
    pub fn read(&mut self, dst: &mut [u8]) -> Result<usize> {
        self.require_live()?;
        let available = self.readable_bytes();
        if available == 0 {
            return Ok(0);
        }
        let n = dst.len().min(available);
        let storage = self.shared.storage.lock();
        let start = self.base + self.reader_index;
        dst[..n].copy_from_slice(&storage[start..start + n]);
        drop(storage);
        self.reader_index += n;
        Ok(n)
    }

    /// Append `src` at `writer_index`, growing the backing storage if this
    /// is not a fixed-size slice and capacity allows it.
    pub fn write(&mut self, src: &[u8]) -> Result<()> {
        self.ensure_writable(src.len())?;
        let mut storage = self.shared.storage.lock();
        let start = self.base + self.writer_index;
        storage[start..start + src.len()].copy_from_slice(src);
        drop(storage);
        self.writer_index += src.len();
        Ok(())
    }

    /// Return a copy of the readable region without advancing `reader_index`.
    pub fn peek_readable(&self) -> Result<Vec<u8>> {
        self.require_live()?;
        let storage = self.shared.storage.lock();
        let start = self.base + self.reader_index;
        let end = self.base + self.writer_index;
        Ok(storage[start..end].to_vec())
    }

    pub fn advance_reader(&mut self, n: usize) -> Result<()> {
        self.require_live()?;
        if self.reader_index + n > self.writer_index {
            return Err(CoreError::new(
                ErrorKind::IndexOutOfRange,
                "advance_reader past writer_index",
            ));
        }
        self.reader_index += n;
        Ok(())
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("reader_index", &self.reader_index)
            .field("writer_index", &self.writer_index)
            .field("capacity", &self.capacity())
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root(bytes: &[u8]) -> Buffer {
        Buffer::new_root(bytes.to_vec(), 4096, Origin::Unpooled)
    }

    #[test]
    fn read_at_empty_window_is_noop() {
        let mut buf = root(b"");
        let mut out = [0u8; 4];
        assert_eq!(buf.read(&mut out).unwrap(), 0);
        assert_eq!(buf.reader_index(), 0);
        assert_eq!(buf.writer_index(), 0);
    }

    #[test]
    fn write_then_read_round_trips() {
        let mut buf = Buffer::new_root(Vec::new(), 64, Origin::Unpooled);
        buf.write(b"hello").unwrap();
        let mut out = [0u8; 5];
        assert_eq!(buf.read(&mut out).unwrap(), 5);
        assert_eq!(&out, b"hello");
    }

    #[test]
    fn retain_release_commute() {
        let buf = root(b"abc");
        let r1 = buf.retain().unwrap();
        let r2 = r1.retain().unwrap();
        assert_eq!(buf.ref_count(), 3);
        assert!(!r2.release());
        assert!(!r1.release());
        assert!(buf.release());
    }

    #[test]
    #[should_panic(expected = "reference-count-violation")]
    fn double_release_panics() {
        let buf = root(b"abc");
        let dup = buf.duplicate().unwrap();
        assert!(buf.release());
        dup.release();
    }

    #[test]
    fn slice_shares_storage_and_count() {
        let buf = root(b"hello world");
        let mut slice = buf.slice(6, 5).unwrap();
        let mut out = [0u8; 5];
        slice.read(&mut out).unwrap();
        assert_eq!(&out, b"world");
        assert_eq!(buf.ref_count(), 1, "slice does not bump the shared count");
    }

    #[test]
    fn over_read_does_not_panic_or_move_indices() {
        let mut buf = root(b"ab");
        let mut out = [0u8; 8];
        let n = buf.read(&mut out).unwrap();
        assert_eq!(n, 2);
        assert_eq!(buf.reader_index(), 2);
    }

    #[test]
    fn write_beyond_max_capacity_errors() {
        let mut buf = Buffer::new_root(Vec::new(), 4, Origin::Unpooled);
        buf.write(b"ab").unwrap();
        let err = buf.write(b"abc").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IndexOutOfRange);
    }

    proptest::proptest! {
        /// `0 <= reader_index <= writer_index <= capacity <= max_capacity`
        /// holds after any sequence of writes and reads, including ones that
        /// overflow `max_capacity` (rejected) or over-read past `writer_index`
        /// (truncated to what's available).
        #[test]
        fn reader_writer_capacity_invariant_holds(
            chunks in proptest::collection::vec(proptest::collection::vec(proptest::prelude::any::<u8>(), 0..20), 0..12),
            read_sizes in proptest::collection::vec(0usize..24, 0..12),
        ) {
            let mut buf = Buffer::new_root(Vec::new(), 64, Origin::Unpooled);
            for (chunk, read_size) in chunks.into_iter().zip(read_sizes.into_iter()) {
                let _ = buf.write(&chunk);
                let mut scratch = vec![0u8; read_size];
                let _ = buf.read(&mut scratch);

                proptest::prop_assert!(buf.reader_index() <= buf.writer_index());
                proptest::prop_assert!(buf.writer_index() <= buf.capacity());
                proptest::prop_assert!(buf.capacity() <= buf.max_capacity());
            }
        }
    }
}
