//! Two end-to-end scenarios that only a real socket transport can exercise:
//! a client writes bytes to an echo server and reads the identical bytes
//! back, then closes, which cascades into the server's accepted channel
//! going inactive; and a loop carrying channels with still-queued writes
//! tears them down within its graceful-shutdown deadline.

use std::net::SocketAddr;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ember_core::buffer::{Buffer, BufferAllocator, UnpooledBufferAllocator};
use ember_core::channel::ChannelAddress;
use ember_core::pipeline::{Context, EventMask, InboundHandler, OutboundHandler, UserEvent};
use ember_core::promise::Promise;
use ember_core::reactor::{EventLoop, LoopState};
use ember_core::{Channel, ChannelState};

use ember_transport_tcp::{TcpChannel, TcpServerChannel, TcpSocketConfig};

fn allocator() -> Arc<dyn BufferAllocator> {
    Arc::new(UnpooledBufferAllocator::default())
}

fn buffer_of(bytes: &[u8]) -> Buffer {
    let mut buf = allocator().buffer(bytes.len(), bytes.len());
    buf.write(bytes).unwrap();
    buf
}

/// Writes every inbound buffer straight back out, flushing immediately.
struct EchoHandler;

impl InboundHandler for EchoHandler {
    fn event_mask(&self) -> EventMask {
        EventMask::CHANNEL_READ
    }

    fn channel_read(&self, ctx: &Context, msg: Buffer) {
        let (promise, _watcher) = Promise::new();
        ctx.write(msg, promise);
        ctx.flush();
    }
}

impl OutboundHandler for EchoHandler {}

/// Sits on the listening channel's pipeline; on each accepted connection it
/// attaches an [`EchoHandler`], registers the child with its own loop, and
/// hands the accepted `Channel` back to the test through `accepted`.
struct ServerAcceptor {
    child_loop: EventLoop,
    accepted: Mutex<Option<Arc<dyn Channel>>>,
}

impl InboundHandler for ServerAcceptor {
    fn event_mask(&self) -> EventMask {
        EventMask::USER_EVENT
    }

    fn user_event_triggered(&self, ctx: &Context, event: UserEvent) {
        match event.downcast_ref::<ember_core::bootstrap::AcceptedChild>() {
            Some(child) => {
                let channel = child.0.clone();
                channel.pipeline().add_last("echo", EchoHandler).expect("add_last on a fresh pipeline");
                channel.register(self.child_loop.clone()).expect("registering an accepted child");
                *self.accepted.lock().unwrap() = Some(channel);
            }
            None => ctx.fire_user_event_triggered(event),
        }
    }
}

impl OutboundHandler for ServerAcceptor {}

/// Records every inbound payload on the client side and signals a watcher
/// the moment one arrives, since client and server run on separate loops.
struct ClientRecorder {
    sender: mpsc::Sender<Vec<u8>>,
}

impl InboundHandler for ClientRecorder {
    fn event_mask(&self) -> EventMask {
        EventMask::CHANNEL_READ
    }

    fn channel_read(&self, _ctx: &Context, msg: Buffer) {
        let bytes = msg.peek_readable().expect("live buffer");
        let _ = msg.release();
        let _ = self.sender.send(bytes);
    }
}

impl OutboundHandler for ClientRecorder {}

fn start_echo_server() -> (EventLoop, Arc<TcpServerChannel>, Arc<ServerAcceptor>, SocketAddr) {
    let server_loop = EventLoop::spawn("tcp-echo-server").expect("spawning the server loop");
    let child_loop = EventLoop::spawn("tcp-echo-children").expect("spawning the child loop");
    let listener = TcpServerChannel::new(server_loop.clone(), allocator(), TcpSocketConfig::default());

    let acceptor = Arc::new(ServerAcceptor { child_loop, accepted: Mutex::new(None) });
    // `ServerAcceptor` isn't `Clone`; `add_last` needs an owned handler, so a
    // second handle stays with the test via a thin by-reference wrapper.
    struct AcceptorRef(Arc<ServerAcceptor>);
    impl InboundHandler for AcceptorRef {
        fn event_mask(&self) -> EventMask {
            self.0.event_mask()
        }
        fn user_event_triggered(&self, ctx: &Context, event: UserEvent) {
            self.0.user_event_triggered(ctx, event)
        }
    }
    impl OutboundHandler for AcceptorRef {}

    listener.pipeline().add_last("acceptor", AcceptorRef(acceptor.clone())).unwrap();

    let bind_watcher = listener.bind(ChannelAddress::Socket("127.0.0.1:0".parse().unwrap()));
    let outcome = bind_watcher.wait();
    assert!(outcome.is_success(), "listener bind should succeed on an ephemeral port");

    let bound = match listener.local_addr() {
        Some(ChannelAddress::Socket(addr)) => addr,
        other => panic!("expected a bound socket address, got {other:?}"),
    };
    (server_loop, listener, acceptor, bound)
}

#[test]
fn echo_round_trip_then_close_cascades_to_server_inactive() {
    let (server_loop, listener, acceptor, bound_addr) = start_echo_server();

    let client_loop = EventLoop::spawn("tcp-echo-client").expect("spawning the client loop");
    let client = TcpChannel::new_client(client_loop.clone(), allocator(), TcpSocketConfig::default());

    let (tx, rx) = mpsc::channel();
    client.pipeline().add_last("recorder", ClientRecorder { sender: tx }).unwrap();

    let connect_watcher = client.connect(ChannelAddress::Socket(bound_addr), None);
    assert!(connect_watcher.wait().is_success(), "client connect should succeed");

    let payload = [0x41u8, 0x42, 0x43];
    let write_watcher = client.write(buffer_of(&payload));
    assert!(write_watcher.wait().is_success(), "client write should succeed");
    client.flush();

    let echoed = rx.recv_timeout(Duration::from_secs(2)).expect("echoed bytes within the timeout");
    assert_eq!(echoed, payload);

    let close_watcher = client.close();
    assert!(close_watcher.wait().is_success(), "client close should succeed");

    // The server's accepted child only goes inactive once it observes the
    // peer's FIN on its own loop; poll briefly rather than assuming an
    // instant cascade.
    let server_child = {
        let mut observed = None;
        for _ in 0..200 {
            if let Some(channel) = acceptor.accepted.lock().unwrap().clone() {
                observed = Some(channel);
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        observed.expect("server should have accepted the connection")
    };
    let mut became_inactive = false;
    for _ in 0..200 {
        if server_child.state() == ChannelState::Closed {
            became_inactive = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(became_inactive, "server-side channel should go inactive after the client closed");

    for event_loop in [&server_loop, &client_loop] {
        event_loop.shutdown_gracefully(Duration::from_millis(1), Duration::from_millis(200));
        event_loop.join();
    }
    drop(listener);
}

#[test]
fn shutdown_gracefully_fails_pending_writes_and_reaches_terminated() {
    let (server_loop, listener, _acceptor, bound_addr) = start_echo_server();

    let shared_loop = EventLoop::spawn("tcp-shutdown-shared").expect("spawning the shared loop");
    let first = TcpChannel::new_client(shared_loop.clone(), allocator(), TcpSocketConfig::default());
    let second = TcpChannel::new_client(shared_loop.clone(), allocator(), TcpSocketConfig::default());

    for client in [&first, &second] {
        let watcher = client.connect(ChannelAddress::Socket(bound_addr), None);
        assert!(watcher.wait().is_success(), "both clients should connect before the loop shuts down");
    }

    // Queue writes large enough that at least some bytes are still pending
    // once shutdown tears the sockets down, without ever calling flush().
    let big_payload = vec![0xABu8; 1 << 20];
    let pending: Vec<_> = [&first, &second]
        .iter()
        .map(|client| client.write(buffer_of(&big_payload)))
        .collect();

    shared_loop.shutdown_gracefully(Duration::from_millis(100), Duration::from_secs(1));
    shared_loop.join();

    assert_eq!(shared_loop.state(), LoopState::Terminated, "loop should reach Terminated once join() returns");

    for watcher in pending {
        let outcome = watcher.wait();
        assert!(outcome.is_failure(), "a write still queued at shutdown should fail, not silently vanish");
    }

    for client in [&first, &second] {
        assert_eq!(client.state(), ChannelState::Closed, "each channel should observe its own teardown");
    }

    server_loop.shutdown_gracefully(Duration::from_millis(1), Duration::from_millis(200));
    server_loop.join();
    drop(listener);
}
