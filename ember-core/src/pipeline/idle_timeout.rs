//! Recurring idle/read/write timeout handlers: each schedules a task on the
//! channel's own loop and checks, at every tick, whether the events it
//! cares about have been observed since the last check.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{CoreError, ErrorKind};
use crate::reactor::{EventLoop, ScheduledHandle};

use super::context::Context;
use super::handler::{EventMask, InboundHandler, OutboundHandler};
use super::{ContextHandle, Pipeline, UserEvent};

/// Fired inbound as a user event when one of [`IdleStateHandler`]'s
/// configured dimensions goes idle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IdleStateEvent {
    pub read_idle: bool,
    pub write_idle: bool,
    pub all_idle: bool,
}

struct Activity {
    last_read: Mutex<Instant>,
    last_write: Mutex<Instant>,
}

impl Activity {
    fn now() -> Self {
        let now = Instant::now();
        Self {
            last_read: Mutex::new(now),
            last_write: Mutex::new(now),
        }
    }
}

struct Ticker {
    handle: Mutex<Option<ScheduledHandle>>,
}

impl Ticker {
    fn new() -> Self {
        Self { handle: Mutex::new(None) }
    }

    fn cancel(&self) {
        if let Some(handle) = self.handle.lock().take() {
            handle.cancel();
        }
    }
}

fn reenter(pipeline: &Pipeline, handle: ContextHandle) -> Context<'_> {
    Context::new(pipeline, handle)
}

/// Schedules a recurring task on `event_loop` that fires `on_tick` every
/// `interval`, storing the cancellable handle in `ticker` so
/// `channel-inactive` can stop it. `on_tick` returns `false` once the
/// channel has gone away and no further ticks should be scheduled.
fn schedule_recurring(
    ticker: Arc<Ticker>,
    event_loop: EventLoop,
    interval: Duration,
    on_tick: Arc<dyn Fn() -> bool + Send + Sync>,
) {
    let handle = event_loop.schedule(interval, {
        let ticker = ticker.clone();
        let event_loop = event_loop.clone();
        move || {
            if on_tick() {
                schedule_recurring(ticker, event_loop, interval, on_tick);
            }
        }
    });
    if let Ok(handle) = handle {
        *ticker.handle.lock() = Some(handle);
    }
}

/// Fires [`IdleStateEvent`] inbound when no `channel-read`, outbound
/// `write`, or either has been observed for the configured duration(s).
/// Any dimension left `None` is not checked.
pub struct IdleStateHandler {
    read_idle: Option<Duration>,
    write_idle: Option<Duration>,
    all_idle: Option<Duration>,
    activity: Arc<Activity>,
    ticker: Arc<Ticker>,
}

impl IdleStateHandler {
    pub fn new(read_idle: Option<Duration>, write_idle: Option<Duration>, all_idle: Option<Duration>) -> Self {
        Self {
            read_idle,
            write_idle,
            all_idle,
            activity: Arc::new(Activity::now()),
            ticker: Arc::new(Ticker::new()),
        }
    }

    fn min_interval(&self) -> Option<Duration> {
        [self.read_idle, self.write_idle, self.all_idle].into_iter().flatten().min()
    }

    fn start(&self, ctx: &Context) {
        let Some(interval) = self.min_interval() else { return };
        let pipeline = ctx.pipeline_clone();
        let handle = ctx.handle();
        let activity = self.activity.clone();
        let (read_idle, write_idle, all_idle) = (self.read_idle, self.write_idle, self.all_idle);

        let on_tick: Arc<dyn Fn() -> bool + Send + Sync> = Arc::new(move || {
            let now = Instant::now();
            let since_read = now.duration_since(*activity.last_read.lock());
            let since_write = now.duration_since(*activity.last_write.lock());
            let since_any = since_read.min(since_write);

            let event = IdleStateEvent {
                read_idle: read_idle.is_some_and(|d| since_read >= d),
                write_idle: write_idle.is_some_and(|d| since_write >= d),
                all_idle: all_idle.is_some_and(|d| since_any >= d),
            };
            if event.read_idle || event.write_idle || event.all_idle {
                let user_event: UserEvent = Arc::new(event);
                reenter(&pipeline, handle).fire_user_event_triggered(user_event);
            }
            true
        });

        schedule_recurring(self.ticker.clone(), ctx.event_loop(), interval, on_tick);
    }
}

impl InboundHandler for IdleStateHandler {
    fn event_mask(&self) -> EventMask {
        EventMask::CHANNEL_READ | EventMask::CHANNEL_ACTIVE | EventMask::CHANNEL_INACTIVE
    }

    fn channel_active(&self, ctx: &Context) {
        self.start(ctx);
        ctx.fire_channel_active();
    }

    fn channel_read(&self, ctx: &Context, msg: crate::buffer::Buffer) {
        *self.activity.last_read.lock() = Instant::now();
        ctx.fire_channel_read(msg);
    }

    fn channel_inactive(&self, ctx: &Context) {
        self.ticker.cancel();
        ctx.fire_channel_inactive();
    }
}

impl OutboundHandler for IdleStateHandler {
    fn event_mask(&self) -> EventMask {
        EventMask::WRITE
    }

    fn write(&self, ctx: &Context, msg: crate::buffer::Buffer, promise: crate::promise::Promise<()>) {
        *self.activity.last_write.lock() = Instant::now();
        ctx.write(msg, promise);
    }
}

/// Fires `exception-caught(Timeout)` if no `channel-read` is observed for
/// `timeout`.
pub struct ReadTimeoutHandler {
    timeout: Duration,
    last_read: Arc<Mutex<Instant>>,
    ticker: Arc<Ticker>,
}

impl ReadTimeoutHandler {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            last_read: Arc::new(Mutex::new(Instant::now())),
            ticker: Arc::new(Ticker::new()),
        }
    }

    fn start(&self, ctx: &Context) {
        let pipeline = ctx.pipeline_clone();
        let handle = ctx.handle();
        let last_read = self.last_read.clone();
        let timeout = self.timeout;

        let on_tick: Arc<dyn Fn() -> bool + Send + Sync> = Arc::new(move || {
            if Instant::now().duration_since(*last_read.lock()) >= timeout {
                reenter(&pipeline, handle)
                    .fire_exception_caught(CoreError::new(ErrorKind::Timeout, "read timeout elapsed"));
            }
            true
        });

        schedule_recurring(self.ticker.clone(), ctx.event_loop(), timeout, on_tick);
    }
}

impl InboundHandler for ReadTimeoutHandler {
    fn event_mask(&self) -> EventMask {
        EventMask::CHANNEL_READ | EventMask::CHANNEL_ACTIVE | EventMask::CHANNEL_INACTIVE
    }

    fn channel_active(&self, ctx: &Context) {
        self.start(ctx);
        ctx.fire_channel_active();
    }

    fn channel_read(&self, ctx: &Context, msg: crate::buffer::Buffer) {
        *self.last_read.lock() = Instant::now();
        ctx.fire_channel_read(msg);
    }

    fn channel_inactive(&self, ctx: &Context) {
        self.ticker.cancel();
        ctx.fire_channel_inactive();
    }
}

impl OutboundHandler for ReadTimeoutHandler {}

/// Fires `exception-caught(Timeout)` if no outbound `write` passes through
/// this handler for `timeout`.
pub struct WriteTimeoutHandler {
    timeout: Duration,
    last_write: Arc<Mutex<Instant>>,
    ticker: Arc<Ticker>,
}

impl WriteTimeoutHandler {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            last_write: Arc::new(Mutex::new(Instant::now())),
            ticker: Arc::new(Ticker::new()),
        }
    }

    fn start(&self, ctx: &Context) {
        let pipeline = ctx.pipeline_clone();
        let handle = ctx.handle();
        let last_write = self.last_write.clone();
        let timeout = self.timeout;

        let on_tick: Arc<dyn Fn() -> bool + Send + Sync> = Arc::new(move || {
            if Instant::now().duration_since(*last_write.lock()) >= timeout {
                reenter(&pipeline, handle)
                    .fire_exception_caught(CoreError::new(ErrorKind::Timeout, "write timeout elapsed"));
            }
            true
        });

        schedule_recurring(self.ticker.clone(), ctx.event_loop(), timeout, on_tick);
    }
}

impl InboundHandler for WriteTimeoutHandler {
    fn event_mask(&self) -> EventMask {
        EventMask::CHANNEL_ACTIVE | EventMask::CHANNEL_INACTIVE
    }

    fn channel_active(&self, ctx: &Context) {
        self.start(ctx);
        ctx.fire_channel_active();
    }

    fn channel_inactive(&self, ctx: &Context) {
        self.ticker.cancel();
        ctx.fire_channel_inactive();
    }
}

impl OutboundHandler for WriteTimeoutHandler {
    fn event_mask(&self) -> EventMask {
        EventMask::WRITE
    }

    fn write(&self, ctx: &Context, msg: crate::buffer::Buffer, promise: crate::promise::Promise<()>) {
        *self.last_write.lock() = Instant::now();
        ctx.write(msg, promise);
    }
}
