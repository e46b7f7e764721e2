//! Shared fixtures for the scenario-level integration tests in `tests/`.
//!
//! Each test file is its own process, so there is no cross-file state to worry about; within one
//! file, tests share the process-wide `TimeWaitValue` selection (harmless here since none of
//! these scenarios depend on a particular clamped value).

use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Once;
use std::time::{Duration, Instant};
use tcpcq::{ConnectionHandler, SocketHandle};

static INIT_TRACING: Once = Once::new();

pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

/// Forwards every `on_receive` payload to an `mpsc` channel, unmodified.
pub struct ForwardingHandler {
    tx: Sender<Vec<u8>>,
}

impl ForwardingHandler {
    pub fn new() -> (Self, Receiver<Vec<u8>>) {
        let (tx, rx) = channel();
        (Self { tx }, rx)
    }
}

impl ConnectionHandler for ForwardingHandler {
    fn on_receive(&self, data: &[u8], _socket: SocketHandle) -> i32 {
        let _ = self.tx.send(data.to_vec());
        0
    }
}

/// Replies to `b"ping\n"` with `b"pong"` and to `b"quit\n"` with a graceful close request,
/// forwarding every payload it sees to an `mpsc` channel like [`ForwardingHandler`].
pub struct EchoHandler {
    tx: Sender<Vec<u8>>,
}

impl EchoHandler {
    pub fn new() -> (Self, Receiver<Vec<u8>>) {
        let (tx, rx) = channel();
        (Self { tx }, rx)
    }
}

impl ConnectionHandler for EchoHandler {
    fn on_receive(&self, data: &[u8], socket: SocketHandle) -> i32 {
        if data == b"ping\n" {
            socket.send(b"pong");
        } else if data == b"quit\n" {
            socket.close();
        }
        let _ = self.tx.send(data.to_vec());
        0
    }
}

/// Polls `condition` every 10ms until it returns `true` or `timeout` elapses.
pub fn wait_until<F: Fn() -> bool>(condition: F, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

pub fn recv_within(rx: &Receiver<Vec<u8>>, timeout: Duration) -> Option<Vec<u8>> {
    rx.recv_timeout(timeout).ok()
}
