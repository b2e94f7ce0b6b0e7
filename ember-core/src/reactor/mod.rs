//! The event-loop runtime: single-threaded schedulers that multiplex I/O
//! readiness and run submitted/scheduled work, grounded on `tokio-rs-mio`'s
//! `Poll`/`Registry`/`Waker` primitives since this core owns its reactor
//! directly rather than delegating to an injected async runtime.

mod event_loop;
mod group;
mod task;

pub use event_loop::{EventLoop, LoopState, Readiness};
pub use group::EventLoopGroup;
pub use task::ScheduledHandle;

pub use mio::{Interest, Token};

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn execute_runs_on_the_loop_thread() {
        let event_loop = EventLoop::spawn("exec-test").unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        let loop_for_check = event_loop.clone();
        event_loop
            .execute(move || {
                assert!(loop_for_check.in_event_loop());
                ran2.store(true, Ordering::SeqCst);
            })
            .unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert!(ran.load(Ordering::SeqCst));
        event_loop.shutdown_gracefully(Duration::from_millis(1), Duration::from_millis(200));
        event_loop.join();
        assert_eq!(event_loop.state(), LoopState::Terminated);
    }

    #[test]
    fn cancelled_scheduled_task_never_runs() {
        let event_loop = EventLoop::spawn("cancel-test").unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        let handle = event_loop
            .schedule(Duration::from_millis(30), move || {
                ran2.store(true, Ordering::SeqCst);
            })
            .unwrap();
        handle.cancel();
        std::thread::sleep(Duration::from_millis(80));
        assert!(!ran.load(Ordering::SeqCst));
        event_loop.shutdown_gracefully(Duration::from_millis(1), Duration::from_millis(200));
        event_loop.join();
    }

    #[test]
    fn shutdown_rejects_new_work() {
        let event_loop = EventLoop::spawn("shutdown-test").unwrap();
        event_loop.shutdown_gracefully(Duration::from_millis(1), Duration::from_millis(200));
        event_loop.join();
        let err = event_loop.execute(|| {}).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ShutdownInProgress);
    }
}
