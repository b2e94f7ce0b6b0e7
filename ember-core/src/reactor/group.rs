//! A fixed pool of [`EventLoop`]s with round-robin assignment.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::event_loop::EventLoop;

/// A pool of `n` event loops, each on its own thread, handed out in
/// round-robin order to new channels via [`EventLoopGroup::next`].
pub struct EventLoopGroup {
    loops: Vec<EventLoop>,
    cursor: AtomicUsize,
}

impl EventLoopGroup {
    pub fn new(size: usize, name_prefix: &str) -> io::Result<Self> {
        assert!(size > 0, "an event loop group needs at least one loop");
        let loops = (0..size)
            .map(|i| EventLoop::spawn(format!("{name_prefix}-{i}")))
            .collect::<io::Result<Vec<_>>>()?;
        Ok(Self {
            loops,
            cursor: AtomicUsize::new(0),
        })
    }

    /// Assign the next loop in round-robin order.
    pub fn next(&self) -> EventLoop {
        let i = self.cursor.fetch_add(1, Ordering::Relaxed) % self.loops.len();
        self.loops[i].clone()
    }

    pub fn len(&self) -> usize {
        self.loops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    /// Initiate graceful shutdown on every loop in the group.
    pub fn shutdown_gracefully(&self, quiet: Duration, timeout: Duration) {
        for event_loop in &self.loops {
            event_loop.shutdown_gracefully(quiet, timeout);
        }
    }

    /// Block until every loop in the group has terminated.
    pub fn join(&self) {
        for event_loop in &self.loops {
            event_loop.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robin_cycles_through_all_loops() {
        let group = EventLoopGroup::new(3, "test-group").unwrap();
        let names: Vec<String> = (0..6).map(|_| group.next().name().to_string()).collect();
        assert_eq!(names[0], names[3]);
        assert_eq!(names[1], names[4]);
        assert_eq!(names[2], names[5]);
        group.shutdown_gracefully(Duration::from_millis(1), Duration::from_millis(50));
        group.join();
    }
}
