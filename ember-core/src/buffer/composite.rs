//! An ordered sequence of component buffers presented as one.

use super::Buffer;
use crate::error::{CoreError, ErrorKind, Result};

/// A composite view over several [`Buffer`]s. Each component keeps its own
/// reference count; [`CompositeBuffer::release`] releases every component.
///
/// The composite's own reader/writer indices are tracked independently of
/// the components' indices — components are only ever read through
/// [`Buffer::peek_readable`], never mutated, so composing the same buffer
/// twice or re-reading is well-defined.
pub struct CompositeBuffer {
    components: Vec<Buffer>,
    lengths: Vec<usize>,
    reader_index: usize,
    writer_index: usize,
}

impl CompositeBuffer {
    /// Take ownership of `parts`, presenting them as a single buffer. The
    /// writer index starts at the sum of each component's readable bytes.
    pub fn compose(parts: Vec<Buffer>) -> Self {
        let lengths: Vec<usize> = parts.iter().map(Buffer::readable_bytes).collect();
        let writer_index = lengths.iter().sum();
        Self {
            components: parts,
            lengths,
            reader_index: 0,
            writer_index,
        }
    }

    pub fn readable_bytes(&self) -> usize {
        self.writer_index - self.reader_index
    }

    /// Read up to `dst.len()` bytes, walking components in order, advancing
    /// the composite's reader index but never the components' own indices.
    pub fn read(&mut self, dst: &mut [u8]) -> Result<usize> {
        let mut written = 0usize;
        let mut cursor = 0usize; // absolute offset from the start of component 0
        for (component, &len) in self.components.iter().zip(&self.lengths) {
            if written == dst.len() || self.reader_index + written == self.writer_index {
                break;
            }
            let component_start = cursor;
            let component_end = cursor + len;
            cursor = component_end;

            let global_pos = self.reader_index + written;
            if global_pos >= component_end {
                continue;
            }
            let local_offset = global_pos.saturating_sub(component_start);
            let readable = component.peek_readable()?;
            let available_here = len - local_offset;
            let take = available_here.min(dst.len() - written);
            dst[written..written + take].copy_from_slice(&readable[local_offset..local_offset + take]);
            written += take;
        }
        self.reader_index += written;
        Ok(written)
    }

    pub fn advance_reader(&mut self, n: usize) -> Result<()> {
        if self.reader_index + n > self.writer_index {
            return Err(CoreError::new(
                ErrorKind::IndexOutOfRange,
                "advance_reader past writer_index on composite buffer",
            ));
        }
        self.reader_index += n;
        Ok(())
    }

    /// Release every component buffer, consuming the composite. Returns the
    /// number of components whose release brought their count to zero.
    pub fn release(self) -> usize {
        self.components
            .into_iter()
            .filter(|c| c.release())
            .count()
    }

    pub fn component_count(&self) -> usize {
        self.components.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Origin;

    #[test]
    fn compose_reads_across_components_in_order() {
        let a = Buffer::new_root(b"hel".to_vec(), 3, Origin::Unpooled);
        let b = Buffer::new_root(b"lo".to_vec(), 2, Origin::Unpooled);
        let mut composite = CompositeBuffer::compose(vec![a, b]);
        assert_eq!(composite.readable_bytes(), 5);
        let mut out = [0u8; 5];
        let n = composite.read(&mut out).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&out, b"hello");
    }

    #[test]
    fn partial_reads_span_component_boundaries() {
        let a = Buffer::new_root(b"hel".to_vec(), 3, Origin::Unpooled);
        let b = Buffer::new_root(b"lo".to_vec(), 2, Origin::Unpooled);
        let mut composite = CompositeBuffer::compose(vec![a, b]);
        let mut first = [0u8; 4];
        assert_eq!(composite.read(&mut first).unwrap(), 4);
        assert_eq!(&first, b"hell");
        let mut second = [0u8; 4];
        assert_eq!(composite.read(&mut second).unwrap(), 1);
        assert_eq!(&second[..1], b"o");
    }
}
