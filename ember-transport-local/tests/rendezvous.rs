//! A bind/connect pairing rendezvous: a write from either side is delivered
//! to the other's inbound tail, and closing one side cascades into the
//! other going inactive too.

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use ember_core::buffer::{Buffer, BufferAllocator, UnpooledBufferAllocator};
use ember_core::channel::ChannelAddress;
use ember_core::pipeline::{Context, EventMask, InboundHandler, OutboundHandler};
use ember_core::reactor::EventLoop;
use ember_core::{Channel, ChannelState};

use ember_transport_local::LocalChannel;

fn allocator() -> Arc<dyn BufferAllocator> {
    Arc::new(UnpooledBufferAllocator::default())
}

fn buffer_of(bytes: &[u8]) -> Buffer {
    let mut buf = allocator().buffer(bytes.len(), bytes.len());
    buf.write(bytes).unwrap();
    buf
}

struct Recorder {
    messages: mpsc::Sender<Vec<u8>>,
    inactive: mpsc::Sender<()>,
}

impl InboundHandler for Recorder {
    fn event_mask(&self) -> EventMask {
        EventMask::CHANNEL_READ | EventMask::CHANNEL_INACTIVE
    }

    fn channel_read(&self, _ctx: &Context, msg: Buffer) {
        let bytes = msg.peek_readable().expect("live buffer");
        let _ = msg.release();
        let _ = self.messages.send(bytes);
    }

    fn channel_inactive(&self, _ctx: &Context) {
        let _ = self.inactive.send(());
    }
}

impl OutboundHandler for Recorder {}

#[test]
fn write_is_delivered_and_close_cascades_to_the_peer() {
    let server_loop = EventLoop::spawn("local-rendezvous-server").expect("spawning the server loop");
    let client_loop = EventLoop::spawn("local-rendezvous-client").expect("spawning the client loop");

    let server = LocalChannel::new(server_loop.clone(), allocator());
    let client = LocalChannel::new(client_loop.clone(), allocator());

    let (server_msgs_tx, server_msgs_rx) = mpsc::channel();
    let (server_inactive_tx, server_inactive_rx) = mpsc::channel();
    server
        .pipeline()
        .add_last("recorder", Recorder { messages: server_msgs_tx, inactive: server_inactive_tx })
        .unwrap();

    let (client_msgs_tx, client_msgs_rx) = mpsc::channel();
    let (client_inactive_tx, _client_inactive_rx) = mpsc::channel();
    client
        .pipeline()
        .add_last("recorder", Recorder { messages: client_msgs_tx, inactive: client_inactive_tx })
        .unwrap();

    let bind_watcher = server.bind(ChannelAddress::Local("rendezvous-test".to_string()));
    assert!(bind_watcher.wait().is_success(), "server bind should succeed");

    let connect_watcher = client.connect(ChannelAddress::Local("rendezvous-test".to_string()), None);
    assert!(connect_watcher.wait().is_success(), "client connect should find the bound peer");

    assert_eq!(client.state(), ChannelState::Active);
    // The peer's own transition happens on its own loop; poll briefly rather
    // than assume it is visible the instant connect() returns.
    let mut server_active = false;
    for _ in 0..200 {
        if server.state() == ChannelState::Active {
            server_active = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(server_active, "server channel should become active once rendezvous completes");

    let payload = b"hello-from-client".to_vec();
    let write_watcher = client.write(buffer_of(&payload));
    assert!(write_watcher.wait().is_success(), "client write should succeed");
    client.flush();

    let received = server_msgs_rx.recv_timeout(Duration::from_secs(2)).expect("server should observe the client's write");
    assert_eq!(received, payload);

    let reply = b"hello-from-server".to_vec();
    let reply_watcher = server.write(buffer_of(&reply));
    assert!(reply_watcher.wait().is_success(), "server write should succeed");
    server.flush();

    let echoed = client_msgs_rx.recv_timeout(Duration::from_secs(2)).expect("client should observe the server's reply");
    assert_eq!(echoed, reply);

    let close_watcher = client.close();
    assert!(close_watcher.wait().is_success(), "client close should succeed");

    server_inactive_rx.recv_timeout(Duration::from_secs(2)).expect("server should observe channel-inactive once its peer closes");
    assert_eq!(server.state(), ChannelState::Closed);

    for event_loop in [&server_loop, &client_loop] {
        event_loop.shutdown_gracefully(Duration::from_millis(1), Duration::from_millis(200));
        event_loop.join();
    }
}
