//! End-to-end exercises of the endpoint over real sockets.
//!
//! Each test stands up an endpoint on a scratch path, drives it with a
//! minimal wire-level client built on the shared codec, and plays both
//! sides of the protocol: channel lifecycle, payload echo, descriptor and
//! channel passing, impulses, and cancellation.

use std::fs::File;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use nix::sys::stat::fstat;
use tempfile::TempDir;

use patchbay_core::wire::framing::{RequestHeader, ResponseHeader};
use patchbay_core::wire::sockio;
use patchbay_core::{BorrowedHandle, Error, LocalHandle, IMPULSE_PAYLOAD_SIZE};
use patchbay_endpoint::{opcodes, Endpoint, IMPULSE_MESSAGE_ID};

// =============================================================================
// Test Helpers
// =============================================================================

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// A scratch endpoint bound under a temp directory. The directory must
/// outlive the endpoint.
fn scratch_endpoint(blocking: bool) -> (TempDir, Arc<Endpoint>) {
    init_tracing();
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("endpoint.sock");
    let endpoint = Endpoint::create_and_bind(path.to_str().expect("utf-8 path"), blocking);
    (dir, endpoint)
}

/// Wire-level client: drives the endpoint through the shared codec, with
/// no client-side channel machinery in the way.
struct TestClient {
    stream: UnixStream,
}

impl TestClient {
    fn connect(endpoint: &Endpoint) -> Self {
        let stream = UnixStream::connect(endpoint.path()).expect("connect to endpoint");
        Self { stream }
    }

    fn sock(&self) -> BorrowedHandle {
        BorrowedHandle::from_raw(self.stream.as_raw_fd())
    }

    fn send(&self, op: i32, payload: &[u8], max_recv_len: u32) {
        let header = RequestHeader::<BorrowedHandle> {
            op,
            send_len: payload.len() as u32,
            max_recv_len,
            ..Default::default()
        };
        sockio::send_request(self.sock(), &header).expect("send request");
        if !payload.is_empty() {
            sockio::send_payload(self.sock(), payload).expect("send payload");
        }
    }

    fn send_impulse(&self, op: i32, payload: &[u8]) {
        assert!(payload.len() <= IMPULSE_PAYLOAD_SIZE);
        let mut impulse_payload = [0u8; IMPULSE_PAYLOAD_SIZE];
        impulse_payload[..payload.len()].copy_from_slice(payload);
        let header = RequestHeader::<BorrowedHandle> {
            op,
            send_len: payload.len() as u32,
            is_impulse: true,
            impulse_payload,
            ..Default::default()
        };
        sockio::send_request(self.sock(), &header).expect("send impulse");
    }

    fn receive_response(&self) -> (ResponseHeader<LocalHandle>, Vec<u8>) {
        let header = sockio::receive_response(self.sock()).expect("receive response header");
        let mut payload = vec![0u8; header.recv_len as usize];
        if !payload.is_empty() {
            sockio::receive_payload(self.sock(), &mut payload).expect("receive response payload");
        }
        (header, payload)
    }

    /// Plays the client half of channel open; returns the event fd from
    /// the reply.
    fn open_channel(&self) -> LocalHandle {
        self.send(opcodes::CHANNEL_OPEN, &[], 0);
        let (mut header, _payload) = self.receive_response();
        assert_eq!(
            header.file_descriptors.len(),
            1,
            "open reply must carry exactly the event fd"
        );
        assert_eq!(
            header.ret_code, 0,
            "open return code is the event fd's file reference"
        );
        header.file_descriptors.remove(0)
    }
}

/// Server half of channel open: receive the `CHANNEL_OPEN` message and
/// accept it. Returns the new channel id.
fn serve_open(endpoint: &Arc<Endpoint>) -> i32 {
    let message = endpoint.message_receive().expect("receive open");
    assert_eq!(message.op(), opcodes::CHANNEL_OPEN);
    let channel_id = message.channel_id();
    assert!(channel_id >= 1, "channel ids start at 1");
    message.reply(0).expect("reply to open");
    channel_id
}

// =============================================================================
// Scenario (a): basic open/close
// =============================================================================

#[test]
fn open_then_close_tears_the_channel_down() {
    let (_dir, endpoint) = scratch_endpoint(true);
    let client = TestClient::connect(&endpoint);

    client.send(opcodes::CHANNEL_OPEN, &[], 0);
    let message = endpoint.message_receive().expect("receive open");
    assert_eq!(message.op(), opcodes::CHANNEL_OPEN);
    let channel_id = message.channel_id();
    message.reply(0).expect("reply to open");

    // The client observes exactly one fd in the reply ancillary data.
    let (header, _payload) = client.receive_response();
    assert_eq!(header.file_descriptors.len(), 1);
    assert!(header.file_descriptors[0].is_valid());
    assert!(
        endpoint.get_channel_socket_fd(channel_id).is_some(),
        "channel is live after accepting the open"
    );

    // Peer hangup surfaces as a synthesised close for the same channel.
    drop(client);
    let close = endpoint.message_receive().expect("receive close");
    assert_eq!(close.op(), opcodes::CHANNEL_CLOSE);
    assert_eq!(close.channel_id(), channel_id);
    assert_eq!(close.info().pid, -1);
    assert_eq!(close.info().euid, -1);
    assert_eq!(close.send_length(), 0);

    // The service's reply completes the teardown.
    close.reply(0).expect("reply to close");
    assert!(
        endpoint.get_channel_socket_fd(channel_id).is_none(),
        "channel table entry must be gone after the close reply"
    );
}

// =============================================================================
// Scenario (b): payload echo
// =============================================================================

#[test]
fn payload_echo_round_trip() {
    let (_dir, endpoint) = scratch_endpoint(true);
    let client = TestClient::connect(&endpoint);

    client.send(opcodes::CHANNEL_OPEN, &[], 0);
    serve_open(&endpoint);
    let _event_fd = {
        let (mut header, _) = client.receive_response();
        header.file_descriptors.remove(0)
    };

    client.send(42, b"hello", 64);
    let mut message = endpoint.message_receive().expect("receive echo request");
    assert_eq!(message.op(), 42);
    assert_eq!(message.send_length(), 5);
    assert_eq!(message.receive_length(), 64);

    let mut buf = [0u8; 16];
    let read = message.read(&mut buf);
    assert_eq!(read, 5, "payload bytes readable must equal send_len");
    assert_eq!(&buf[..5], b"hello");
    assert_eq!(message.read(&mut buf), 0, "cursor exhausted");

    let written = message.write(b"HELLO");
    assert_eq!(written, 5);
    message.reply(0).expect("reply with payload");

    let (header, payload) = client.receive_response();
    assert_eq!(header.ret_code, 0);
    assert_eq!(header.recv_len, 5);
    assert_eq!(payload, b"HELLO");
}

// =============================================================================
// Scenario (c): fd passing
// =============================================================================

#[test]
fn pushed_file_handle_names_the_same_file() {
    let (_dir, endpoint) = scratch_endpoint(true);
    let client = TestClient::connect(&endpoint);

    client.send(opcodes::CHANNEL_OPEN, &[], 0);
    serve_open(&endpoint);
    client.receive_response();

    client.send(13, &[], 0);
    let mut message = endpoint.message_receive().expect("receive fd request");
    let dev_null = File::open("/dev/null").expect("open /dev/null");
    let handle = LocalHandle::from(OwnedFd::from(dev_null));
    let reference = message.push_file_handle(&handle).expect("push fd");
    message.reply(reference).expect("reply with fd reference");

    let (header, _payload) = client.receive_response();
    let received = &header.file_descriptors[header.ret_code as usize];
    assert!(received.is_valid());

    // Same kernel object: (st_dev, st_ino) match a fresh /dev/null open.
    let expected = File::open("/dev/null").expect("reopen /dev/null");
    let expected_stat = fstat(expected.as_raw_fd()).expect("fstat /dev/null");
    let received_stat = fstat(received.raw()).expect("fstat received fd");
    assert_eq!(received_stat.st_dev, expected_stat.st_dev);
    assert_eq!(received_stat.st_ino, expected_stat.st_ino);
}

// =============================================================================
// Scenario (d): channel push
// =============================================================================

#[test]
fn pushed_channel_accepts_its_own_open() {
    let (_dir, endpoint) = scratch_endpoint(true);
    let client = TestClient::connect(&endpoint);

    client.send(opcodes::CHANNEL_OPEN, &[], 0);
    let first_channel = serve_open(&endpoint);
    client.receive_response();

    client.send(77, &[], 0);
    let mut message = endpoint.message_receive().expect("receive push request");
    let (remote, pushed_channel) = message.push_channel(0, None).expect("push channel");
    assert_ne!(pushed_channel, first_channel);
    assert!(
        endpoint.get_channel_socket_fd(pushed_channel).is_some(),
        "pushed channel is registered before the reply"
    );
    message
        .reply_channel_handle_remote(remote)
        .expect("reply with channel reference");

    let (mut header, _payload) = client.receive_response();
    assert_eq!(header.channels.len(), 1, "reply carries one channel pair");
    assert_eq!(header.ret_code, 0, "first pushed channel gets reference 0");
    let pushed = header.channels.remove(0);
    assert!(pushed.data_fd.is_valid());
    assert!(pushed.event_fd.is_valid());

    // A CHANNEL_OPEN sent down the pushed data fd surfaces on the pushed
    // channel id.
    let open = RequestHeader::<BorrowedHandle> {
        op: opcodes::CHANNEL_OPEN,
        ..Default::default()
    };
    sockio::send_request(pushed.data_fd.borrow(), &open).expect("open pushed channel");
    let second_open = endpoint.message_receive().expect("receive pushed open");
    assert_eq!(second_open.op(), opcodes::CHANNEL_OPEN);
    assert_eq!(second_open.channel_id(), pushed_channel);
    second_open.reply(0).expect("accept pushed open");

    let reply = sockio::receive_response(pushed.data_fd.borrow()).expect("pushed open reply");
    assert_eq!(reply.file_descriptors.len(), 1);
}

// =============================================================================
// Scenario (e): impulse
// =============================================================================

#[test]
fn impulse_carries_inline_payload_and_rearms() {
    let (_dir, endpoint) = scratch_endpoint(true);
    let client = TestClient::connect(&endpoint);

    client.send(opcodes::CHANNEL_OPEN, &[], 0);
    let channel_id = serve_open(&endpoint);
    client.receive_response();

    let impulse_bytes = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
    client.send_impulse(7, &impulse_bytes);
    let impulse = endpoint.message_receive().expect("receive impulse");
    assert_eq!(impulse.op(), 7);
    assert_eq!(impulse.message_id(), IMPULSE_MESSAGE_ID);
    assert!(impulse.is_impulse());
    assert_eq!(impulse.channel_id(), channel_id);
    assert_eq!(impulse.impulse_data(), &impulse_bytes);
    drop(impulse); // no reply for impulses

    // The receive path rearmed the channel: a regular request still flows.
    client.send(9, b"after", 16);
    let mut follow_up = endpoint.message_receive().expect("receive follow-up");
    assert_eq!(follow_up.op(), 9);
    let mut buf = [0u8; 8];
    assert_eq!(follow_up.read(&mut buf), 5);
    follow_up.reply(0).expect("reply to follow-up");
    let (header, _) = client.receive_response();
    assert_eq!(header.ret_code, 0);
}

// =============================================================================
// Scenario (f): cancellation
// =============================================================================

#[test]
fn cancel_unblocks_a_waiting_receiver() {
    let (_dir, endpoint) = scratch_endpoint(true);

    let (result_tx, result_rx) = mpsc::channel();
    let receiver = {
        let endpoint = Arc::clone(&endpoint);
        thread::spawn(move || {
            let result = endpoint.message_receive();
            result_tx.send(result.map(|_| ())).expect("report result");
        })
    };

    // Give the receiver time to block inside the readiness wait.
    thread::sleep(Duration::from_millis(50));
    endpoint.cancel().expect("cancel");

    let result = result_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("receiver must unblock within bounded time");
    assert!(matches!(result, Err(Error::Shutdown)));
    receiver.join().expect("join receiver");

    // The cancel fd is never drained: later receives keep reporting
    // shutdown.
    assert!(matches!(
        endpoint.message_receive(),
        Err(Error::Shutdown)
    ));
}

// =============================================================================
// Rejected opens, stale replies, timeouts
// =============================================================================

#[test]
fn rejected_open_closes_the_channel() {
    let (_dir, endpoint) = scratch_endpoint(true);
    let client = TestClient::connect(&endpoint);

    client.send(opcodes::CHANNEL_OPEN, &[], 0);
    let message = endpoint.message_receive().expect("receive open");
    let channel_id = message.channel_id();
    message.reply(-libc::EACCES).expect("reject open");

    assert!(
        endpoint.get_channel_socket_fd(channel_id).is_none(),
        "rejected open must tear the channel down"
    );

    // The client sees the socket close without a response frame.
    let err = sockio::receive_response(client.sock()).expect_err("no reply after rejection");
    assert!(matches!(err, Error::Shutdown));
}

#[test]
fn reply_after_close_reports_stale_channel() {
    let (_dir, endpoint) = scratch_endpoint(true);
    let client = TestClient::connect(&endpoint);

    client.send(opcodes::CHANNEL_OPEN, &[], 0);
    let message = endpoint.message_receive().expect("receive open");
    let channel_id = message.channel_id();

    endpoint.close_channel(channel_id).expect("explicit close");
    let err = message.reply(0).expect_err("reply on a closed channel");
    assert!(matches!(err, Error::StaleChannel));
}

#[test]
fn non_blocking_receive_times_out_when_idle() {
    let (_dir, endpoint) = scratch_endpoint(false);
    let err = endpoint.message_receive().expect_err("no events pending");
    assert!(matches!(err, Error::TimedOut));
}

#[test]
fn check_channel_is_unimplemented() {
    let (_dir, endpoint) = scratch_endpoint(true);
    let client = TestClient::connect(&endpoint);

    client.send(opcodes::CHANNEL_OPEN, &[], 0);
    let message = endpoint.message_receive().expect("receive open");
    let err = endpoint
        .check_channel(&message, 0)
        .expect_err("declared but unimplemented");
    assert!(matches!(err, Error::NotImplemented));
    message.reply(0).expect("reply to open");
}

// =============================================================================
// Concurrent dispatch: no duplicate delivery
// =============================================================================

#[test]
fn concurrent_receivers_never_duplicate_a_frame() {
    const CLIENTS: usize = 8;

    let (_dir, endpoint) = scratch_endpoint(true);

    // Dispatchers first: the backlog is 1, so connects complete only as
    // fast as the accept path drains them.
    let (result_tx, result_rx) = mpsc::channel();
    let dispatchers: Vec<_> = (0..CLIENTS)
        .map(|_| {
            let endpoint = Arc::clone(&endpoint);
            let result_tx = result_tx.clone();
            thread::spawn(move || {
                let message = endpoint.message_receive().expect("receive open");
                let channel_id = message.channel_id();
                message.reply(0).expect("reply to open");
                result_tx.send(channel_id).expect("report channel id");
            })
        })
        .collect();
    drop(result_tx);

    let clients: Vec<TestClient> = (0..CLIENTS)
        .map(|_| {
            let client = TestClient::connect(&endpoint);
            client.send(opcodes::CHANNEL_OPEN, &[], 0);
            client
        })
        .collect();

    let mut channel_ids: Vec<i32> = result_rx.iter().collect();
    for dispatcher in dispatchers {
        dispatcher.join().expect("join dispatcher");
    }

    channel_ids.sort_unstable();
    let before = channel_ids.len();
    channel_ids.dedup();
    assert_eq!(channel_ids.len(), before, "no frame is dispatched twice");
    assert_eq!(channel_ids.len(), CLIENTS, "every open was dispatched");

    for client in &clients {
        let (header, _) = client.receive_response();
        assert_eq!(header.file_descriptors.len(), 1);
    }
}
