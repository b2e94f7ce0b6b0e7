//! A single-shot completion sink linking an outbound operation to its
//! eventual success, failure, or cancellation.

use std::fmt;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::CoreError;

/// How a [`Promise`] was completed.
pub enum Outcome<T> {
    Success(T),
    Failure(CoreError),
    Cancelled,
}

impl<T: fmt::Debug> fmt::Debug for Outcome<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success(v) => write!(f, "Success({v:?})"),
            Outcome::Failure(e) => write!(f, "Failure({e})"),
            Outcome::Cancelled => write!(f, "Cancelled"),
        }
    }
}

impl<T> Outcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failure(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Outcome::Cancelled)
    }
}

type Continuation<T> = Box<dyn FnOnce(&Outcome<T>) + Send>;

enum State<T> {
    Pending(Vec<Continuation<T>>),
    Done(Arc<Outcome<T>>),
}

struct Inner<T> {
    state: Mutex<State<T>>,
    ready: Condvar,
}

/// The producer side of a promise: exactly one of [`Promise::succeed`],
/// [`Promise::fail`], or a watcher-initiated cancellation completes it.
pub struct Promise<T> {
    inner: Arc<Inner<T>>,
}

/// The consumer side: registers continuations and can cancel before the
/// promise is completed.
pub struct PromiseWatcher<T> {
    inner: Arc<Inner<T>>,
}

impl<T: Send + 'static> Promise<T> {
    /// Create a linked producer/watcher pair.
    pub fn new() -> (Self, PromiseWatcher<T>) {
        let inner = Arc::new(Inner {
            state: Mutex::new(State::Pending(Vec::new())),
            ready: Condvar::new(),
        });
        (
            Promise {
                inner: inner.clone(),
            },
            PromiseWatcher { inner },
        )
    }

    /// An already-completed, successful promise — used for operations like
    /// a second `close()` call that are idempotent no-ops.
    pub fn already_succeeded(value: T) -> Self {
        let inner = Arc::new(Inner {
            state: Mutex::new(State::Done(Arc::new(Outcome::Success(value)))),
            ready: Condvar::new(),
        });
        Promise { inner }
    }

    pub fn succeed(self, value: T) {
        complete(&self.inner, Outcome::Success(value));
    }

    pub fn fail(self, error: CoreError) {
        complete(&self.inner, Outcome::Failure(error));
    }
}

impl<T> PromiseWatcher<T> {
    /// Cancel the operation. No-op if it has already completed (best-effort
    /// cancellation past that point).
    pub fn cancel(&self) {
        complete(&self.inner, Outcome::Cancelled);
    }

    /// Register a continuation, invoked exactly once: immediately if the
    /// promise is already done, or when it completes.
    pub fn on_complete(&self, continuation: impl FnOnce(&Outcome<T>) + Send + 'static) {
        let mut state = self.inner.state.lock();
        match &mut *state {
            State::Done(outcome) => {
                let outcome = outcome.clone();
                drop(state);
                continuation(&outcome);
            }
            State::Pending(continuations) => continuations.push(Box::new(continuation)),
        }
    }

    /// Non-blocking poll for tests and synchronous call sites.
    pub fn try_take(&self) -> Option<Arc<Outcome<T>>> {
        match &*self.inner.state.lock() {
            State::Done(outcome) => Some(outcome.clone()),
            State::Pending(_) => None,
        }
    }

    /// Block the calling thread until the promise completes. Only for call
    /// sites genuinely off the event loop (blocking bootstrap calls,
    /// tests); never call this from inside a handler callback, since the
    /// producer side usually runs on the same loop and would deadlock.
    pub fn wait(&self) -> Arc<Outcome<T>> {
        let mut state = self.inner.state.lock();
        loop {
            match &*state {
                State::Done(outcome) => return outcome.clone(),
                State::Pending(_) => self.inner.ready.wait(&mut state),
            }
        }
    }
}

fn complete<T>(inner: &Arc<Inner<T>>, outcome: Outcome<T>) {
    let outcome = Arc::new(outcome);
    let continuations = {
        let mut state = inner.state.lock();
        match &*state {
            State::Done(_) => return,
            State::Pending(_) => {
                let previous = std::mem::replace(&mut *state, State::Done(outcome.clone()));
                match previous {
                    State::Pending(continuations) => continuations,
                    State::Done(_) => unreachable!(),
                }
            }
        }
    };
    inner.ready.notify_all();
    for continuation in continuations {
        continuation(&outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn continuation_runs_exactly_once_on_success() {
        let (promise, watcher) = Promise::<u32>::new();
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        watcher.on_complete(move |outcome| {
            assert!(outcome.is_success());
            ran2.store(true, Ordering::SeqCst);
        });
        promise.succeed(42);
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn late_registration_still_fires() {
        let (promise, watcher) = Promise::<u32>::new();
        promise.succeed(7);
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        watcher.on_complete(move |_| ran2.store(true, Ordering::SeqCst));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn cancel_before_completion_short_circuits_producer() {
        let (promise, watcher) = Promise::<u32>::new();
        watcher.cancel();
        promise.succeed(1);
        match &*watcher.try_take().unwrap() {
            Outcome::Cancelled => {}
            other => panic!("expected Cancelled, got {other:?}"),
        }
    }
}
