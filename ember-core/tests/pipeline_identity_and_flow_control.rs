//! Two pipeline-level invariants that don't already have source-level unit
//! coverage: removing a handler leaves the remaining chain observationally
//! identical to never having added it, and `FlowControlHandler` with
//! auto-read off gates every inbound message behind an explicit `read()`.

mod common;

use std::sync::Arc;
use std::time::Duration;

use ember_core::buffer::{Buffer, BufferAllocator, UnpooledBufferAllocator};
use ember_core::pipeline::flow_control::FlowControlHandler;

use common::{test_pipeline, Recorder, RecorderRef};

fn payload(byte: u8) -> Buffer {
    let allocator = UnpooledBufferAllocator::default();
    let mut buf = allocator.buffer(1, 1);
    buf.write(&[byte]).unwrap();
    buf
}

#[test]
fn removing_a_handler_matches_never_having_added_it() {
    let (loop_with, pipeline_with, _sink_with) = test_pipeline("identity-with-removed");
    let recorder_with = Arc::new(Recorder::new());
    // auto_read(false) would gate every message behind an explicit read()
    // if left in place; removing it must restore plain pass-through.
    let middle = pipeline_with.add_last("middle", FlowControlHandler::new(false)).unwrap();
    pipeline_with.add_last("recorder", RecorderRef(recorder_with.clone())).unwrap();
    pipeline_with.remove(middle).unwrap();

    let (loop_without, pipeline_without, _sink_without) = test_pipeline("identity-without");
    let recorder_without = Arc::new(Recorder::new());
    pipeline_without.add_last("recorder", RecorderRef(recorder_without.clone())).unwrap();

    for byte in [0x11, 0x22, 0x33] {
        pipeline_with.fire_channel_read(payload(byte));
        pipeline_without.fire_channel_read(payload(byte));
    }

    assert_eq!(*recorder_with.messages.lock().unwrap(), *recorder_without.messages.lock().unwrap());

    for event_loop in [&loop_with, &loop_without] {
        event_loop.shutdown_gracefully(Duration::from_millis(1), Duration::from_millis(50));
        event_loop.join();
    }
}

#[test]
fn flow_control_with_auto_read_off_gates_every_message_behind_read() {
    let (event_loop, pipeline, _sink) = test_pipeline("flow-control-gating");
    let recorder = Arc::new(Recorder::new());
    pipeline.add_last("flow-control", FlowControlHandler::new(false)).unwrap();
    pipeline.add_last("recorder", RecorderRef(recorder.clone())).unwrap();

    pipeline.fire_channel_read(payload(0xAA));
    pipeline.fire_channel_read(payload(0xBB));
    assert!(recorder.messages.lock().unwrap().is_empty(), "nothing should pass with auto-read off and no read()");

    pipeline.read().unwrap();
    assert_eq!(*recorder.messages.lock().unwrap(), vec![vec![0xAA]], "exactly one release per read()");

    pipeline.read().unwrap();
    assert_eq!(*recorder.messages.lock().unwrap(), vec![vec![0xAA], vec![0xBB]]);

    event_loop.shutdown_gracefully(Duration::from_millis(1), Duration::from_millis(50));
    event_loop.join();
}
