use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::{CoreError, ErrorKind, Result};

/// A channel's lifecycle state. Transitions are strictly monotone toward
/// `Closed`; there is no path back to an earlier state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelState {
    Unregistered = 0,
    Registered = 1,
    Active = 2,
    Closed = 3,
}

impl ChannelState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ChannelState::Unregistered,
            1 => ChannelState::Registered,
            2 => ChannelState::Active,
            _ => ChannelState::Closed,
        }
    }
}

/// An atomic cell holding a [`ChannelState`], rejecting any transition that
/// would move backwards.
pub struct ChannelStateCell(AtomicU8);

impl ChannelStateCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(ChannelState::Unregistered as u8))
    }

    pub fn get(&self) -> ChannelState {
        ChannelState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Advance to `next`, rejecting a non-forward transition.
    pub fn advance(&self, next: ChannelState) -> Result<()> {
        let current = self.0.load(Ordering::Acquire);
        if next as u8 <= current {
            return Err(CoreError::new(
                ErrorKind::IndexOutOfRange,
                "channel state transitions must move strictly toward closed",
            ));
        }
        self.0.store(next as u8, Ordering::Release);
        Ok(())
    }

    /// Idempotent transition to `Closed`; returns `true` if this call
    /// performed the transition, `false` if the channel was already closed.
    pub fn close(&self) -> bool {
        let current = self.0.swap(ChannelState::Closed as u8, Ordering::AcqRel);
        current != ChannelState::Closed as u8
    }
}

impl Default for ChannelStateCell {
    fn default() -> Self {
        Self::new()
    }
}
