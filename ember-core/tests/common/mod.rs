//! Shared fixtures for the pipeline-level end-to-end scenarios: a
//! [`TransportSink`] double that records what reached it instead of touching
//! a real socket, and a terminal handler that records what reached the
//! inbound tail.

#![allow(dead_code)]

use std::sync::{Arc, Mutex, Weak};

use ember_core::buffer::Buffer;
use ember_core::error::CoreError;
use ember_core::pipeline::{Context, EventMask, InboundHandler, OutboundHandler, Pipeline, TransportSink, UserEvent};
use ember_core::promise::Promise;
use ember_core::reactor::EventLoop;
use ember_core::Result;

/// Records every `do_write` it receives (as raw bytes) and every `do_bind`/
/// `do_connect`/`do_close` call, succeeding every promise immediately.
pub struct RecordingSink {
    pub writes: Mutex<Vec<Vec<u8>>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { writes: Mutex::new(Vec::new()) })
    }
}

impl TransportSink for RecordingSink {
    fn do_bind(&self, _local: ember_core::channel::ChannelAddress, promise: Promise<()>) {
        promise.succeed(());
    }
    fn do_connect(&self, _remote: ember_core::channel::ChannelAddress, _local: Option<ember_core::channel::ChannelAddress>, promise: Promise<()>) {
        promise.succeed(());
    }
    fn do_disconnect(&self, promise: Promise<()>) {
        promise.succeed(());
    }
    fn do_close(&self, promise: Promise<()>) {
        promise.succeed(());
    }
    fn do_read(&self) -> Result<()> {
        Ok(())
    }
    fn do_write(&self, msg: Buffer, promise: Promise<()>) {
        match msg.peek_readable() {
            Ok(bytes) => self.writes.lock().unwrap().push(bytes),
            Err(err) => {
                promise.fail(err);
                return;
            }
        }
        let _ = msg.release();
        promise.succeed(());
    }
    fn do_flush(&self) {}
}

/// Terminal inbound handler recording every message and exception that
/// reaches it, for assertions once a test has driven some inbound traffic.
pub struct Recorder {
    pub messages: Mutex<Vec<Vec<u8>>>,
    pub exceptions: Mutex<Vec<CoreError>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self {
            messages: Mutex::new(Vec::new()),
            exceptions: Mutex::new(Vec::new()),
        }
    }
}

impl InboundHandler for Recorder {
    fn event_mask(&self) -> EventMask {
        EventMask::CHANNEL_READ | EventMask::EXCEPTION_CAUGHT
    }

    fn channel_read(&self, _ctx: &Context, msg: Buffer) {
        let bytes = msg.peek_readable().expect("recorder reads a live buffer");
        let _ = msg.release();
        self.messages.lock().unwrap().push(bytes);
    }

    fn exception_caught(&self, _ctx: &Context, error: CoreError) {
        self.exceptions.lock().unwrap().push(error);
    }
}

impl OutboundHandler for Recorder {}

/// `add_last` takes handlers by value, but assertions need to outlive the
/// pipeline; this shares one [`Recorder`] between the pipeline slot and the
/// test body.
pub struct RecorderRef(pub Arc<Recorder>);

impl InboundHandler for RecorderRef {
    fn event_mask(&self) -> EventMask {
        self.0.event_mask()
    }
    fn channel_read(&self, ctx: &Context, msg: Buffer) {
        self.0.channel_read(ctx, msg)
    }
    fn exception_caught(&self, ctx: &Context, error: CoreError) {
        self.0.exception_caught(ctx, error)
    }
}

impl OutboundHandler for RecorderRef {}

pub fn test_pipeline(loop_name: &str) -> (EventLoop, Pipeline, Arc<RecordingSink>) {
    let event_loop = EventLoop::spawn(loop_name).expect("spawning a test event loop");
    let sink = RecordingSink::new();
    let weak: Weak<dyn TransportSink> = Arc::downgrade(&sink) as Weak<dyn TransportSink>;
    let pipeline = Pipeline::new(event_loop.clone(), weak);
    (event_loop, pipeline, sink)
}

pub fn user_event<T: std::any::Any + Send + Sync>(value: T) -> UserEvent {
    Arc::new(value)
}
