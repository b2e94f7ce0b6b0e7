//! Scenario 5: two datagram channels join the same multicast group; a
//! datagram sent from one is observed at the other as a `DatagramMeta` user
//! event immediately followed by its payload; after the receiver leaves the
//! group, further sends are not observed within a bounded window.

use std::net::{IpAddr, SocketAddr};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ember_core::buffer::{Buffer, BufferAllocator, UnpooledBufferAllocator};
use ember_core::channel::ChannelAddress;
use ember_core::pipeline::{Context, EventMask, InboundHandler, OutboundHandler, UserEvent};
use ember_core::reactor::EventLoop;
use ember_core::Channel;

use ember_transport_udp::{DatagramMeta, UdpChannel, UdpSocketConfig};

fn allocator() -> Arc<dyn BufferAllocator> {
    Arc::new(UnpooledBufferAllocator::default())
}

fn buffer_of(bytes: &[u8]) -> Buffer {
    let mut buf = allocator().buffer(bytes.len(), bytes.len());
    buf.write(bytes).unwrap();
    buf
}

/// Confirms every `channel-read` is preceded by its `DatagramMeta`, then
/// forwards the payload bytes to the test thread.
struct DatagramRecorder {
    sender: mpsc::Sender<Vec<u8>>,
    pending_meta: Mutex<Option<DatagramMeta>>,
}

impl InboundHandler for DatagramRecorder {
    fn event_mask(&self) -> EventMask {
        EventMask::USER_EVENT | EventMask::CHANNEL_READ
    }

    fn user_event_triggered(&self, _ctx: &Context, event: UserEvent) {
        if let Some(meta) = event.downcast_ref::<DatagramMeta>() {
            *self.pending_meta.lock().unwrap() = Some(meta.clone());
        }
    }

    fn channel_read(&self, _ctx: &Context, msg: Buffer) {
        let bytes = msg.peek_readable().expect("live buffer");
        let _ = msg.release();
        assert!(
            self.pending_meta.lock().unwrap().take().is_some(),
            "every datagram read must be preceded by its DatagramMeta"
        );
        let _ = self.sender.send(bytes);
    }
}

impl OutboundHandler for DatagramRecorder {}

#[test]
fn multicast_datagram_is_observed_then_stops_after_leaving_the_group() {
    let group: IpAddr = "230.0.0.1".parse().unwrap();

    let receiver_loop = EventLoop::spawn("udp-multicast-receiver").expect("spawning the receiver loop");
    let receiver = UdpChannel::new(receiver_loop.clone(), allocator(), UdpSocketConfig::default());
    let bind_watcher = receiver.bind(ChannelAddress::Socket("0.0.0.0:0".parse().unwrap()));
    assert!(bind_watcher.wait().is_success(), "receiver bind should succeed");

    let receiver_port = match receiver.local_addr() {
        Some(ChannelAddress::Socket(addr)) => addr.port(),
        other => panic!("expected a bound socket address, got {other:?}"),
    };
    receiver.join_group(group, None).expect("joining the multicast group");

    let (tx, rx) = mpsc::channel();
    receiver
        .pipeline()
        .add_last("recorder", DatagramRecorder { sender: tx, pending_meta: Mutex::new(None) })
        .unwrap();

    let sender_loop = EventLoop::spawn("udp-multicast-sender").expect("spawning the sender loop");
    let sender = UdpChannel::new(sender_loop.clone(), allocator(), UdpSocketConfig::default());
    let target = ChannelAddress::Socket(SocketAddr::new(group, receiver_port));

    let payload = b"multicast-hello".to_vec();
    let send_watcher = sender.send_to(buffer_of(&payload), target.clone());
    assert!(send_watcher.wait().is_success(), "sending a multicast datagram should succeed");

    let observed = rx.recv_timeout(Duration::from_secs(2)).expect("the datagram should be observed within the timeout");
    assert_eq!(observed, payload);

    receiver.leave_group(group, None).expect("leaving the multicast group");

    let after_leave = sender.send_to(buffer_of(b"should-not-arrive"), target);
    assert!(after_leave.wait().is_success(), "the send itself still succeeds; only delivery to this receiver stops");
    assert!(
        rx.recv_timeout(Duration::from_millis(500)).is_err(),
        "no datagram should be observed once the receiver has left the group"
    );

    for event_loop in [&receiver_loop, &sender_loop] {
        event_loop.shutdown_gracefully(Duration::from_millis(1), Duration::from_millis(200));
        event_loop.join();
    }
}
