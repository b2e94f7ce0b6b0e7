//! Scenario 2 from the testable-properties list: a length-prefixed codec
//! round-trips messages of size 0, 1, 65535, and 65536 bytes bit-for-bit,
//! surviving encoding on one pipeline, arbitrary re-chunking across the
//! "wire", and decoding on another.

mod common;

use std::sync::Arc;
use std::time::Duration;

use ember_core::buffer::{Buffer, BufferAllocator, UnpooledBufferAllocator};
use ember_core::error::Result;
use ember_core::pipeline::{Context, DecoderHandler, EncoderHandler, MessageDecoder, MessageEncoder};

use common::{test_pipeline, Recorder, RecorderRef};

const HEADER_LEN: usize = 4;

struct LengthPrefixedEncoder;

impl MessageEncoder for LengthPrefixedEncoder {
    fn encode(&mut self, _ctx: &Context, msg: Buffer) -> Result<Vec<Buffer>> {
        let payload = msg.peek_readable()?;
        let _ = msg.release();
        let allocator = UnpooledBufferAllocator::default();
        let mut framed = allocator.buffer(HEADER_LEN + payload.len(), HEADER_LEN + payload.len());
        framed.write(&(payload.len() as u32).to_be_bytes())?;
        framed.write(&payload)?;
        Ok(vec![framed])
    }
}

/// Accumulates raw bytes across however many `channel_read` calls it takes
/// to see a full header plus payload, emitting one decoded message per
/// complete frame (never more than one still-partial frame buffered).
struct LengthPrefixedDecoder {
    accumulated: Vec<u8>,
}

impl LengthPrefixedDecoder {
    fn new() -> Self {
        Self { accumulated: Vec::new() }
    }
}

impl MessageDecoder for LengthPrefixedDecoder {
    fn decode(&mut self, _ctx: &Context, msg: Buffer) -> Result<Vec<Buffer>> {
        let chunk = msg.peek_readable()?;
        let _ = msg.release();
        self.accumulated.extend_from_slice(&chunk);

        let mut out = Vec::new();
        loop {
            if self.accumulated.len() < HEADER_LEN {
                break;
            }
            let len = u32::from_be_bytes(self.accumulated[..HEADER_LEN].try_into().unwrap()) as usize;
            if self.accumulated.len() < HEADER_LEN + len {
                break;
            }
            let payload: Vec<u8> = self.accumulated.drain(..HEADER_LEN + len).skip(HEADER_LEN).collect();
            let allocator = UnpooledBufferAllocator::default();
            let mut buf = allocator.buffer(payload.len(), payload.len());
            buf.write(&payload)?;
            out.push(buf);
        }
        Ok(out)
    }
}

fn wire_bytes(sizes: &[usize]) -> (Vec<Vec<u8>>, Vec<u8>) {
    let (event_loop, pipeline, sink) = test_pipeline("framing-encode");
    pipeline.add_last("encoder", EncoderHandler::new(LengthPrefixedEncoder)).unwrap();

    let payloads: Vec<Vec<u8>> = sizes
        .iter()
        .map(|&size| (0..size).map(|i| (i % 256) as u8).collect())
        .collect();

    let allocator = UnpooledBufferAllocator::default();
    for payload in &payloads {
        let mut buf = allocator.buffer(payload.len(), payload.len());
        buf.write(payload).unwrap();
        let watcher = pipeline.write(buf);
        let outcome = watcher.wait();
        assert!(outcome.is_success(), "encode-side write should succeed");
    }

    let wire: Vec<u8> = sink.writes.lock().unwrap().iter().flatten().copied().collect();
    event_loop.shutdown_gracefully(Duration::from_millis(1), Duration::from_millis(50));
    event_loop.join();
    (payloads, wire)
}

fn feed_in_chunks(wire: &[u8], chunk_size: usize) -> Arc<Recorder> {
    let (event_loop, pipeline, _sink) = test_pipeline("framing-decode");
    let recorder = Arc::new(Recorder::new());
    pipeline.add_last("decoder", DecoderHandler::new(LengthPrefixedDecoder::new())).unwrap();
    pipeline.add_last("recorder", RecorderRef(recorder.clone())).unwrap();

    let allocator = UnpooledBufferAllocator::default();
    for chunk in wire.chunks(chunk_size.max(1)) {
        let mut buf = allocator.buffer(chunk.len(), chunk.len());
        buf.write(chunk).unwrap();
        pipeline.fire_channel_read(buf);
    }

    event_loop.shutdown_gracefully(Duration::from_millis(1), Duration::from_millis(50));
    event_loop.join();
    recorder
}

#[test]
fn round_trips_boundary_sizes_bit_for_bit() {
    let sizes = [0usize, 1, 65535, 65536];
    let (payloads, wire) = wire_bytes(&sizes);

    // Feed the whole wire stream as one chunk, then again split into small,
    // header-straddling chunks, to exercise both the common case and partial
    // accumulation across several reads.
    for chunk_size in [wire.len(), 3, 17] {
        let recorder = feed_in_chunks(&wire, chunk_size);
        let received = recorder.messages.lock().unwrap();
        assert_eq!(received.len(), payloads.len(), "chunk size {chunk_size}");
        for (expected, actual) in payloads.iter().zip(received.iter()) {
            assert_eq!(expected, actual, "chunk size {chunk_size}");
        }
        assert!(recorder.exceptions.lock().unwrap().is_empty());
    }
}

#[test]
fn encoder_rejects_nothing_and_header_matches_payload_length() {
    let (payloads, wire) = wire_bytes(&[10]);
    assert_eq!(wire.len(), HEADER_LEN + 10);
    let declared_len = u32::from_be_bytes(wire[..HEADER_LEN].try_into().unwrap()) as usize;
    assert_eq!(declared_len, payloads[0].len());
}
