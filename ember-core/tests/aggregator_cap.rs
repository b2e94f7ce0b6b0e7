//! Scenario 4 from the testable-properties list: an aggregator configured
//! with a 10-byte cap accepts a 5-byte start message, then rejects once a
//! 6-byte content message would push the running total over the cap.

mod common;

use std::sync::Arc;
use std::time::Duration;

use ember_core::buffer::{Buffer, BufferAllocator, UnpooledBufferAllocator};
use ember_core::error::ErrorKind;
use ember_core::pipeline::aggregator::{Aggregator, FrameClassifier, FrameRole};

use common::{test_pipeline, Recorder, RecorderRef};

struct TaggedClassifier;

impl FrameClassifier for TaggedClassifier {
    fn classify(&self, msg: &Buffer) -> FrameRole {
        let tag = msg.peek_readable().expect("live buffer")[0];
        match tag {
            b'S' => FrameRole::Start,
            b'C' => FrameRole::Content,
            b'L' => FrameRole::LastContent,
            _ => FrameRole::StartAndEnd,
        }
    }
}

fn tagged(tag: u8, payload_len: usize) -> Buffer {
    let allocator = UnpooledBufferAllocator::default();
    let mut buf = allocator.buffer(1 + payload_len, 1 + payload_len);
    buf.write(&[tag]).unwrap();
    buf.write(&vec![0u8; payload_len]).unwrap();
    buf
}

#[test]
fn frame_exceeding_cap_is_rejected_and_discarded() {
    let (event_loop, pipeline, _sink) = test_pipeline("aggregator-cap");
    let recorder = Arc::new(Recorder::new());

    let allocator = Arc::new(UnpooledBufferAllocator::default());
    pipeline.add_last("aggregator", Aggregator::new(TaggedClassifier, 10, allocator)).unwrap();
    pipeline.add_last("recorder", RecorderRef(recorder.clone())).unwrap();

    // 1 tag byte + 5 payload bytes = 6, then 1 + 6 = 7 more -> running total
    // crosses from 6 to 13, over the 10-byte cap.
    pipeline.fire_channel_read(tagged(b'S', 5));
    pipeline.fire_channel_read(tagged(b'C', 6));

    assert!(recorder.messages.lock().unwrap().is_empty(), "no aggregated message should have been emitted");
    let exceptions = recorder.exceptions.lock().unwrap();
    assert_eq!(exceptions.len(), 1);
    assert_eq!(exceptions[0].kind(), ErrorKind::TooLongFrame);
    drop(exceptions);

    event_loop.shutdown_gracefully(Duration::from_millis(1), Duration::from_millis(50));
    event_loop.join();
}

#[test]
fn frame_at_exactly_the_cap_is_accepted() {
    let (event_loop, pipeline, _sink) = test_pipeline("aggregator-cap-exact");
    let recorder = Arc::new(Recorder::new());

    let allocator = Arc::new(UnpooledBufferAllocator::default());
    pipeline.add_last("aggregator", Aggregator::new(TaggedClassifier, 10, allocator)).unwrap();
    pipeline.add_last("recorder", RecorderRef(recorder.clone())).unwrap();

    // 1 + 4 = 5, then 1 + 4 = 5 more, total payload+tag bytes combine to 10.
    pipeline.fire_channel_read(tagged(b'S', 4));
    pipeline.fire_channel_read(tagged(b'L', 4));

    assert!(recorder.exceptions.lock().unwrap().is_empty());
    assert_eq!(recorder.messages.lock().unwrap().len(), 1);

    event_loop.shutdown_gracefully(Duration::from_millis(1), Duration::from_millis(50));
    event_loop.join();
}

