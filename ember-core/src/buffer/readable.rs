//! The read-facing view of a [`super::Buffer`], bridging to `bytes::Buf`.

use super::Buffer;
use crate::error::Result;
use bytes::Buf;

/// Operations available on the readable half of a buffer. Implemented for
/// [`Buffer`] directly so callers can use either the inherent methods or
/// this trait when writing code generic over the buffer type (decoders,
/// mostly, which only ever read).
pub trait ReadableBuffer {
    fn readable_bytes(&self) -> usize;
    fn read_into(&mut self, dst: &mut [u8]) -> Result<usize>;
    fn peek(&self) -> Result<Vec<u8>>;
    fn skip(&mut self, n: usize) -> Result<()>;
}

impl ReadableBuffer for Buffer {
    fn readable_bytes(&self) -> usize {
        Buffer::readable_bytes(self)
    }

    fn read_into(&mut self, dst: &mut [u8]) -> Result<usize> {
        self.read(dst)
    }

    fn peek(&self) -> Result<Vec<u8>> {
        self.peek_readable()
    }

    fn skip(&mut self, n: usize) -> Result<()> {
        self.advance_reader(n)
    }
}

/// A `bytes::Buf` adapter over a live [`Buffer`] handle, for codecs written
/// against the `bytes` ecosystem (length-prefix framing, varints, and so
/// on) rather than against [`ReadableBuffer`] directly.
///
/// Built by copying the remaining readable region once at construction
/// time; cheap for the frame-sized reads codecs perform, and it keeps
/// `Buffer`'s own reader index as the single source of truth until the
/// adapter is advanced or dropped.
pub struct BufView {
    remaining: std::io::Cursor<Vec<u8>>,
}

impl BufView {
    pub fn new(source: &Buffer) -> Result<Self> {
        Ok(Self {
            remaining: std::io::Cursor::new(source.peek_readable()?),
        })
    }

    /// Bytes consumed from this view since construction; callers use this
    /// to advance the originating [`Buffer`]'s reader index by the same
    /// amount once decoding succeeds.
    pub fn consumed(&self) -> usize {
        self.remaining.position() as usize
    }
}

impl Buf for BufView {
    fn remaining(&self) -> usize {
        Buf::remaining(&self.remaining)
    }

    fn chunk(&self) -> &[u8] {
        Buf::chunk(&self.remaining)
    }

    fn advance(&mut self, cnt: usize) {
        Buf::advance(&mut self.remaining, cnt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Origin;

    #[test]
    fn buf_view_tracks_consumption_against_source() {
        let buf = Buffer::new_root(b"length-prefixed".to_vec(), 64, Origin::Unpooled);
        let mut view = BufView::new(&buf).unwrap();
        let got = view.get_u8();
        assert_eq!(got, b'l');
        assert_eq!(view.consumed(), 1);
    }
}
