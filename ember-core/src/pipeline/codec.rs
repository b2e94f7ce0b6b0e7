//! Message-to-message codec handlers: a decoder/encoder consumes one
//! message and produces zero or more, forwarding each in turn.

use parking_lot::Mutex;

use crate::buffer::Buffer;
use crate::error::{CoreError, Result};
use crate::promise::Promise;

use super::context::Context;
use super::handler::{EventMask, InboundHandler, OutboundHandler};

/// Decodes one inbound message into a freshly allocated list of messages.
/// Producing zero messages (the decoder is still accumulating) is legal.
pub trait MessageDecoder: Send + 'static {
    fn decode(&mut self, ctx: &Context, msg: Buffer) -> Result<Vec<Buffer>>;
}

/// Encodes one outbound message into a freshly allocated list of messages.
pub trait MessageEncoder: Send + 'static {
    fn encode(&mut self, ctx: &Context, msg: Buffer) -> Result<Vec<Buffer>>;
}

/// Wraps a [`MessageDecoder`] as an inbound handler. Interior mutability is
/// required because `InboundHandler::channel_read` takes `&self`, while
/// decoding state (an accumulation buffer, a parser) is inherently mutable.
pub struct DecoderHandler<D> {
    inner: Mutex<D>,
}

impl<D: MessageDecoder> DecoderHandler<D> {
    pub fn new(decoder: D) -> Self {
        Self { inner: Mutex::new(decoder) }
    }
}

impl<D: MessageDecoder> InboundHandler for DecoderHandler<D> {
    fn event_mask(&self) -> EventMask {
        EventMask::CHANNEL_READ | EventMask::CHANNEL_INACTIVE
    }

    fn channel_read(&self, ctx: &Context, msg: Buffer) {
        let decoded = self.inner.lock().decode(ctx, msg);
        match decoded {
            Ok(messages) => {
                for message in messages {
                    ctx.fire_channel_read(message);
                }
            }
            Err(error) => ctx.fire_exception_caught(error),
        }
    }
}

impl<D: Send + Sync + 'static> OutboundHandler for DecoderHandler<D> {}

/// Wraps a [`MessageEncoder`] as an outbound handler, fanning a multi-message
/// encode out across the tail promise: it succeeds only once every produced
/// message has itself been written successfully, and fails as soon as one
/// does.
pub struct EncoderHandler<E> {
    inner: Mutex<E>,
}

impl<E: MessageEncoder> EncoderHandler<E> {
    pub fn new(encoder: E) -> Self {
        Self { inner: Mutex::new(encoder) }
    }
}

impl<E: Send + Sync + 'static> InboundHandler for EncoderHandler<E> {}

impl<E: MessageEncoder> OutboundHandler for EncoderHandler<E> {
    fn event_mask(&self) -> EventMask {
        EventMask::WRITE
    }

    fn write(&self, ctx: &Context, msg: Buffer, promise: Promise<()>) {
        let encoded = self.inner.lock().encode(ctx, msg);
        let mut messages = match encoded {
            Ok(messages) => messages,
            Err(error) => {
                promise.fail(error);
                return;
            }
        };

        match messages.len() {
            0 => promise.succeed(()),
            1 => ctx.write(messages.pop().unwrap(), promise),
            _ => fan_out_write(ctx, messages, promise),
        }
    }
}

fn fan_out_write(ctx: &Context, messages: Vec<Buffer>, promise: Promise<()>) {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex as StdMutex};

    let remaining = Arc::new(AtomicUsize::new(messages.len()));
    let failed = Arc::new(AtomicBool::new(false));
    let promise = Arc::new(StdMutex::new(Some(promise)));

    for message in messages {
        let (part_promise, part_watcher) = Promise::new();
        let remaining = remaining.clone();
        let failed = failed.clone();
        let promise = promise.clone();
        part_watcher.on_complete(move |outcome| {
            use crate::promise::Outcome;
            match outcome {
                Outcome::Success(()) => {}
                Outcome::Failure(error) => {
                    if !failed.swap(true, Ordering::AcqRel) {
                        if let Some(p) = promise.lock().unwrap().take() {
                            p.fail(CoreError::new(error.kind(), error.message().to_string()));
                        }
                    }
                }
                Outcome::Cancelled => {
                    if !failed.swap(true, Ordering::AcqRel) {
                        if let Some(p) = promise.lock().unwrap().take() {
                            p.fail(CoreError::new(
                                crate::error::ErrorKind::ShutdownInProgress,
                                "a fanned-out write was cancelled",
                            ));
                        }
                    }
                }
            }
            if remaining.fetch_sub(1, Ordering::AcqRel) == 1 && !failed.load(Ordering::Acquire) {
                if let Some(p) = promise.lock().unwrap().take() {
                    p.succeed(());
                }
            }
        });
        ctx.write(message, part_promise);
    }
}
