//! The single-threaded event loop: I/O multiplexing plus a task/scheduled-task
//! queue, built directly on `mio`'s `Poll`/`Registry`/`Waker` since this core
//! owns its reactor rather than delegating to an injected async runtime.

use std::collections::{BinaryHeap, HashMap};
use std::io;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use mio::{Events, Interest, Poll, Registry, Token};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::task::{next_seq, LoopTask, ScheduledEntry, ScheduledHandle};
use crate::error::{CoreError, ErrorKind, Result};

const WAKE_TOKEN: Token = Token(usize::MAX);
/// Fraction of each wakeup's time budget spent draining ready I/O before the
/// task queue gets a turn, commonly called `io_ratio`.
const DEFAULT_IO_RATIO: f32 = 0.5;
const MAX_TASKS_PER_CYCLE: usize = 4096;

/// Monotone loop lifecycle: `NotStarted -> Started -> ShuttingDown ->
/// Shutdown -> Terminated`. Never moves backwards.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum LoopState {
    NotStarted = 0,
    Started = 1,
    ShuttingDown = 2,
    Shutdown = 3,
    Terminated = 4,
}

impl LoopState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => LoopState::NotStarted,
            1 => LoopState::Started,
            2 => LoopState::ShuttingDown,
            3 => LoopState::Shutdown,
            _ => LoopState::Terminated,
        }
    }
}

/// Implemented by anything registered with an [`EventLoop`] (concrete
/// transport channels); dispatches readiness notifications and the
/// loop's shutdown signal.
pub trait Readiness: Send + Sync {
    fn handle_ready(&self, readable: bool, writable: bool);
    /// Called once when the owning loop reaches `Shutdown`, before
    /// `Terminated`. Implementors should close out any outstanding state.
    fn on_shutdown(&self) {}
}

struct ShutdownPlan {
    quiet: Duration,
    quiet_deadline: Instant,
    hard_deadline: Instant,
}

struct Shared {
    task_tx: std::sync::mpsc::Sender<LoopTask>,
    waker: Arc<mio::Waker>,
    registry: Registry,
    state: AtomicU8,
    thread_id: Mutex<Option<ThreadId>>,
    token_seq: AtomicUsize,
    registrations: Mutex<HashMap<Token, Arc<dyn Readiness>>>,
    shutdown: Mutex<Option<ShutdownPlan>>,
    last_submission: Mutex<Instant>,
    join: Mutex<Option<JoinHandle<()>>>,
    name: String,
}

/// A handle to one running event loop. Cheaply cloneable; every clone
/// refers to the same underlying thread and task queue.
#[derive(Clone)]
pub struct EventLoop {
    shared: Arc<Shared>,
}

impl EventLoop {
    /// Spawn a new loop on its own OS thread and return a handle to it.
    pub fn spawn(name: impl Into<String>) -> io::Result<Self> {
        let name = name.into();
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Arc::new(mio::Waker::new(&registry, WAKE_TOKEN)?);
        let (task_tx, task_rx) = std::sync::mpsc::channel::<LoopTask>();

        let shared = Arc::new(Shared {
            task_tx,
            waker,
            registry,
            state: AtomicU8::new(LoopState::NotStarted as u8),
            thread_id: Mutex::new(None),
            token_seq: AtomicUsize::new(0),
            registrations: Mutex::new(HashMap::new()),
            shutdown: Mutex::new(None),
            last_submission: Mutex::new(Instant::now()),
            join: Mutex::new(None),
            name: name.clone(),
        });

        let loop_shared = shared.clone();
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || run(loop_shared, poll, task_rx))?;
        *shared.join.lock() = Some(handle);
        shared.state.store(LoopState::Started as u8, Ordering::Release);

        Ok(Self { shared })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> LoopState {
        LoopState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// True if the calling thread is this loop's own thread.
    pub fn in_event_loop(&self) -> bool {
        matches!(*self.shared.thread_id.lock(), Some(id) if id == thread::current().id())
    }

    pub fn allocate_token(&self) -> Token {
        Token(self.shared.token_seq.fetch_add(1, Ordering::Relaxed))
    }

    fn require_accepting_work(&self) -> Result<()> {
        match self.state() {
            LoopState::ShuttingDown | LoopState::Shutdown | LoopState::Terminated => Err(
                CoreError::new(ErrorKind::ShutdownInProgress, "event loop is shutting down"),
            ),
            _ => Ok(()),
        }
    }

    /// Enqueue a task for execution on this loop's thread.
    pub fn execute(&self, task: impl FnOnce() + Send + 'static) -> Result<()> {
        self.require_accepting_work()?;
        *self.shared.last_submission.lock() = Instant::now();
        self.shared
            .task_tx
            .send(LoopTask::Immediate(Box::new(task)))
            .map_err(|_| CoreError::new(ErrorKind::ShutdownInProgress, "event loop task queue closed"))?;
        let _ = self.shared.waker.wake();
        Ok(())
    }

    /// Schedule a task to run no earlier than `delay` from now. Returns a
    /// handle that can cancel the task until it begins executing.
    pub fn schedule(
        &self,
        delay: Duration,
        task: impl FnOnce() + Send + 'static,
    ) -> Result<ScheduledHandle> {
        self.require_accepting_work()?;
        let cancelled = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let deadline = Instant::now() + delay;
        let seq = next_seq();
        *self.shared.last_submission.lock() = Instant::now();
        self.shared
            .task_tx
            .send(LoopTask::At {
                deadline,
                seq,
                cancelled: cancelled.clone(),
                task: Box::new(task),
            })
            .map_err(|_| CoreError::new(ErrorKind::ShutdownInProgress, "event loop task queue closed"))?;
        let _ = self.shared.waker.wake();
        Ok(ScheduledHandle::new(cancelled))
    }

    /// Register an I/O source under `token`, binding it permanently to this
    /// loop. Rejected once the loop has entered `ShuttingDown` or later.
    pub fn register(
        &self,
        source: &mut dyn mio::event::Source,
        token: Token,
        interest: Interest,
        readiness: Arc<dyn Readiness>,
    ) -> Result<()> {
        self.require_accepting_work()?;
        self.shared
            .registry
            .register(source, token, interest)
            .map_err(|e| CoreError::from_io("failed to register I/O source", e))?;
        self.shared.registrations.lock().insert(token, readiness);
        Ok(())
    }

    pub fn reregister(
        &self,
        source: &mut dyn mio::event::Source,
        token: Token,
        interest: Interest,
    ) -> Result<()> {
        self.shared
            .registry
            .reregister(source, token, interest)
            .map_err(|e| CoreError::from_io("failed to reregister I/O source", e))
    }

    pub fn deregister(&self, source: &mut dyn mio::event::Source, token: Token) -> Result<()> {
        self.shared
            .registry
            .deregister(source)
            .map_err(|e| CoreError::from_io("failed to deregister I/O source", e))?;
        self.shared.registrations.lock().remove(&token);
        Ok(())
    }

    /// Initiate graceful shutdown: refuse further registrations and new
    /// work immediately; once `quiet` elapses with no task submissions,
    /// drain and terminate, no later than `timeout` from this call.
    pub fn shutdown_gracefully(&self, quiet: Duration, timeout: Duration) {
        let now = Instant::now();
        self.shared.state.store(LoopState::ShuttingDown as u8, Ordering::Release);
        *self.shared.shutdown.lock() = Some(ShutdownPlan {
            quiet,
            quiet_deadline: now + quiet,
            hard_deadline: now + timeout,
        });
        let _ = self.shared.waker.wake();
    }

    /// Block until the loop thread has terminated.
    pub fn join(&self) {
        if let Some(handle) = self.shared.join.lock().take() {
            let _ = handle.join();
        }
    }
}

fn run(shared: Arc<Shared>, mut poll: Poll, task_rx: std::sync::mpsc::Receiver<LoopTask>) {
    *shared.thread_id.lock() = Some(thread::current().id());
    let mut events = Events::with_capacity(1024);
    let mut heap: BinaryHeap<std::cmp::Reverse<ScheduledEntry>> = BinaryHeap::new();

    debug!(loop_name = %shared.name, "event loop started");

    loop {
        let state = LoopState::from_u8(shared.state.load(Ordering::Acquire));
        if state == LoopState::Terminated {
            break;
        }

        let next_deadline = heap.peek().map(|e| e.0.deadline);
        let poll_timeout = compute_poll_timeout(&shared, next_deadline, state);

        if let Err(err) = poll.poll(&mut events, poll_timeout) {
            if err.kind() != io::ErrorKind::Interrupted {
                warn!(loop_name = %shared.name, error = %err, "poll failed");
            }
        }

        let ready_count = events.iter().count();
        let mut io_budget = ((ready_count as f32 * DEFAULT_IO_RATIO).ceil() as usize).max(ready_count.min(1));
        for event in events.iter() {
            if event.token() == WAKE_TOKEN {
                continue;
            }
            if io_budget == 0 {
                break;
            }
            io_budget -= 1;
            let readiness = shared.registrations.lock().get(&event.token()).cloned();
            if let Some(readiness) = readiness {
                readiness.handle_ready(event.is_readable(), event.is_writable());
            }
        }

        drain_task_queue(&task_rx, &shared, &mut heap);
        run_due_tasks(&mut heap);

        if check_shutdown(&shared, &mut heap) {
            break;
        }
    }

    debug!(loop_name = %shared.name, "event loop terminated");
}

fn compute_poll_timeout(shared: &Shared, next_deadline: Option<Instant>, state: LoopState) -> Option<Duration> {
    let now = Instant::now();
    let mut timeout = next_deadline.map(|d| d.saturating_duration_since(now));

    if state == LoopState::ShuttingDown {
        if let Some(plan) = shared.shutdown.lock().as_ref() {
            let shutdown_poll = plan.hard_deadline.min(plan.quiet_deadline).saturating_duration_since(now);
            timeout = Some(match timeout {
                Some(t) => t.min(shutdown_poll),
                None => shutdown_poll,
            });
        }
    }

    timeout
}

fn drain_task_queue(
    task_rx: &std::sync::mpsc::Receiver<LoopTask>,
    shared: &Shared,
    heap: &mut BinaryHeap<std::cmp::Reverse<ScheduledEntry>>,
) {
    let mut processed = 0usize;
    while processed < MAX_TASKS_PER_CYCLE {
        match task_rx.try_recv() {
            Ok(LoopTask::Immediate(task)) => {
                trace!(loop_name = %shared.name, "running immediate task");
                task();
                processed += 1;
            }
            Ok(LoopTask::At {
                deadline,
                seq,
                cancelled,
                task,
            }) => {
                heap.push(std::cmp::Reverse(ScheduledEntry {
                    deadline,
                    seq,
                    cancelled,
                    task,
                }));
                processed += 1;
            }
            Err(_) => break,
        }
    }
}

fn run_due_tasks(heap: &mut BinaryHeap<std::cmp::Reverse<ScheduledEntry>>) {
    let now = Instant::now();
    while let Some(entry) = heap.peek() {
        if entry.0.deadline > now {
            break;
        }
        let std::cmp::Reverse(entry) = heap.pop().unwrap();
        if !entry.cancelled.load(Ordering::Acquire) {
            (entry.task)();
        }
    }
}

/// Returns `true` once the loop should stop running.
fn check_shutdown(shared: &Shared, heap: &mut BinaryHeap<std::cmp::Reverse<ScheduledEntry>>) -> bool {
    let state = LoopState::from_u8(shared.state.load(Ordering::Acquire));
    if state != LoopState::ShuttingDown {
        return false;
    }

    let now = Instant::now();
    let (quiet_elapsed, hard_elapsed) = {
        let plan = shared.shutdown.lock();
        match plan.as_ref() {
            Some(plan) => {
                let last_submission = *shared.last_submission.lock();
                let quiet_satisfied = now.saturating_duration_since(last_submission) >= plan.quiet;
                (quiet_satisfied, now >= plan.hard_deadline)
            }
            None => (false, false),
        }
    };

    if !quiet_elapsed && !hard_elapsed {
        return false;
    }

    shared.state.store(LoopState::Shutdown as u8, Ordering::Release);
    for readiness in shared.registrations.lock().values() {
        readiness.on_shutdown();
    }
    shared.registrations.lock().clear();
    heap.clear();
    shared.state.store(LoopState::Terminated as u8, Ordering::Release);
    true
}
