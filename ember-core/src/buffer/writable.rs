//! The write-facing view of a [`super::Buffer`], bridging to `bytes::BufMut`.

use super::Buffer;
use crate::error::Result;
use bytes::BufMut;

/// Operations available on the writable half of a buffer. Implemented for
/// [`Buffer`] directly; encoders write against this trait rather than the
/// inherent methods when they need to stay generic over buffer type.
pub trait WritableBuffer {
    fn writable_capacity(&self) -> usize;
    fn write_from(&mut self, src: &[u8]) -> Result<()>;
}

impl WritableBuffer for Buffer {
    fn writable_capacity(&self) -> usize {
        self.max_capacity().saturating_sub(self.writer_index())
    }

    fn write_from(&mut self, src: &[u8]) -> Result<()> {
        self.write(src)
    }
}

/// A `bytes::BufMut` adapter accumulating into a private scratch buffer,
/// for encoders written against the `bytes` ecosystem. The accumulated
/// bytes are appended to the destination [`Buffer`] via [`Self::finish`];
/// kept separate from `Buffer` itself so a single encoder invocation can
/// put multiple values (varints, length prefixes, payload) before one
/// `write` call takes the whole lot.
pub struct BufMutView {
    scratch: Vec<u8>,
}

impl BufMutView {
    pub fn new() -> Self {
        Self { scratch: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            scratch: Vec::with_capacity(capacity),
        }
    }

    /// Append everything written into this view onto `dest`, consuming it.
    pub fn finish(self, dest: &mut Buffer) -> Result<()> {
        dest.write(&self.scratch)
    }
}

impl Default for BufMutView {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl BufMut for BufMutView {
    fn remaining_mut(&self) -> usize {
        usize::MAX - self.scratch.len()
    }

    unsafe fn advance_mut(&mut self, cnt: usize) {
        let len = self.scratch.len();
        self.scratch.set_len(len + cnt);
    }

    fn chunk_mut(&mut self) -> &mut bytes::buf::UninitSlice {
        let len = self.scratch.len();
        let cap = self.scratch.capacity();
        if cap == len {
            self.scratch.reserve(64);
        }
        let uninit = &mut self.scratch.spare_capacity_mut()[..];
        unsafe { bytes::buf::UninitSlice::from_raw_parts_mut(uninit.as_mut_ptr() as *mut u8, uninit.len()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Origin;

    #[test]
    fn buf_mut_view_accumulates_then_flushes_into_buffer() {
        let mut view = BufMutView::new();
        view.put_u8(b'h');
        view.put_slice(b"i");
        let mut dest = Buffer::new_root(Vec::new(), 16, Origin::Unpooled);
        view.finish(&mut dest).unwrap();
        assert_eq!(dest.peek_readable().unwrap(), b"hi");
    }
}
