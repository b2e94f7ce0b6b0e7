//! Estimating the pending-bytes contribution of an outbound message, for
//! water-mark accounting without requiring every message type to be a
//! [`Buffer`].

use crate::buffer::Buffer;

/// A fixed per-message overhead charged to non-buffer messages.
pub const NON_BUFFER_OVERHEAD: usize = 8;

pub trait MessageSizeEstimator<M> {
    fn size(&self, message: &M) -> usize;
}

#[derive(Default)]
pub struct DefaultMessageSizeEstimator;

impl MessageSizeEstimator<Buffer> for DefaultMessageSizeEstimator {
    fn size(&self, message: &Buffer) -> usize {
        message.readable_bytes()
    }
}

impl DefaultMessageSizeEstimator {
    /// The estimate used for outbound messages with no buffer-derived size
    /// of their own (control signals, and the like).
    pub fn opaque_estimate(&self) -> usize {
        NON_BUFFER_OVERHEAD
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Origin;

    #[test]
    fn buffer_size_is_readable_bytes() {
        let estimator = DefaultMessageSizeEstimator;
        let buf = Buffer::new_root(b"hello".to_vec(), 16, Origin::Unpooled);
        assert_eq!(estimator.size(&buf), 5);
    }
}
