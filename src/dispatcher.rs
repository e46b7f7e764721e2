//! The fixed worker-thread pool and the completion/error dispatch switch.
//!
//! Each worker loops forever on [`CompletionPort::dequeue`] - the single suspension point in the
//! whole design (§5: "workers never await in userspace"). Every other code path here is either a
//! direct function call or a non-blocking `Post*` call into the OS.

use crate::buffer::{Buffer, Operation};
use crate::completion_port::Completion;
use crate::config::DEFAULT_MAX_PENDING_BYTE_SENT;
use crate::manager::ManagerInner;
use crate::ops::{self, PostOutcome};
use crate::socket::{Socket, SocketState};
use std::net::SocketAddrV4;
use std::pin::Pin;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::{event, Level};
use windows::Win32::Networking::WinSock::WSAEADDRINUSE;

/// Spawns `count` worker threads, each dequeuing from `inner`'s completion port until it
/// observes an `End` buffer.
pub(crate) fn spawn_workers(inner: Arc<ManagerInner>, count: usize) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|index| {
            let inner = inner.clone();
            std::thread::Builder::new()
                .name(format!("tcpcq-worker-{index}"))
                .spawn(move || worker_loop(inner))
                .expect("spawning a worker thread should never fail")
        })
        .collect()
}

fn worker_loop(inner: Arc<ManagerInner>) {
    loop {
        let completion = inner.port.dequeue();
        if handle_completion(&inner, completion) {
            break;
        }
    }
}

/// Recovers the owning `Socket` from a completion key without a registry lookup, per §4.4 - the
/// key is the address of the `Socket`'s own allocation, handed to `CompletionPort::bind` when the
/// socket was first associated. One extra strong count is taken so this function returns an
/// owning `Arc` without disturbing the registry's/reuse-queue's own reference.
fn socket_from_key(completion_key: usize) -> Arc<Socket> {
    let ptr = completion_key as *const Socket;
    // SAFETY: `completion_key` was produced by `Arc::as_ptr` on a `Socket` that is still alive -
    // every path that drops a socket's last owning `Arc` also removes it from every container
    // that could hand its pointer back here as a completion key.
    unsafe {
        Arc::increment_strong_count(ptr);
        Arc::from_raw(ptr)
    }
}

/// Handles one dequeued completion (or dequeue failure). Returns `true` if this was the worker's
/// `End` signal and it should exit.
fn handle_completion(inner: &Arc<ManagerInner>, completion: Completion) -> bool {
    if completion.overlapped.is_null() {
        event!(Level::ERROR, message = "dequeued a null overlapped pointer, dropping");
        return false;
    }

    // SAFETY: every overlapped pointer we ever post is the address of a `Buffer`'s `overlapped`
    // field, leaked via `Buffer::into_raw`/left un-reclaimed by a synchronous `Immediate` path.
    let buf = unsafe { Buffer::from_overlapped(completion.overlapped) };

    if buf.operation() == Operation::End {
        return true;
    }

    let socket = socket_from_key(completion.completion_key);

    if let Some(dequeue_error) = completion.dequeue_error {
        handle_error(inner, &socket, buf, dequeue_error);
    } else {
        handle_io(inner, &socket, buf, completion.bytes_transferred);
    }

    maybe_cleanup(inner, &socket);
    false
}

/// Runs the handling code for one successful `Post*` outcome, whether it arrived via the
/// completion port or synchronously at the post call site. Mirrors `handle_completion`'s body
/// without the dequeue-specific framing.
pub(crate) fn handle_post_outcome(inner: &Arc<ManagerInner>, socket: &Arc<Socket>, outcome: PostOutcome) {
    match outcome {
        PostOutcome::Pending => {}
        PostOutcome::Immediate { bytes, buf } => {
            handle_io(inner, socket, buf, bytes);
            maybe_cleanup(inner, socket);
        }
    }
}

fn handle_io(inner: &Arc<ManagerInner>, socket: &Arc<Socket>, buf: Pin<Box<Buffer>>, bytes_transferred: u32) {
    match buf.operation() {
        Operation::Read => handle_read(inner, socket, buf, bytes_transferred),
        Operation::Write => handle_write(inner, socket, buf, bytes_transferred),
        Operation::Connect | Operation::Accept => handle_connection(inner, socket, buf),
        Operation::Disconnect => handle_disconnect(inner, socket, buf),
        Operation::IsbChange => handle_isb_change(inner, socket, buf),
        Operation::End => unreachable!("End is handled by the caller before dispatch"),
    }
}

fn handle_read(inner: &Arc<ManagerInner>, socket: &Arc<Socket>, mut buf: Pin<Box<Buffer>>, bytes_transferred: u32) {
    socket.dec_outstanding_recv();

    if bytes_transferred > 0 {
        unsafe { buf.as_mut().get_unchecked_mut().set_payload_len(bytes_transferred) };
        let handle = crate::handle::SocketHandle::new(&inner.self_arc(), socket.id());
        inner.handler.on_receive(buf.payload(), handle);

        if socket.state() != SocketState::Connected {
            inner.buffer_pool.delete(buf);
        } else {
            unsafe { buf.as_mut().get_unchecked_mut().set_payload_len(0) };
            repost_recv(inner, socket, buf);
        }
    } else {
        event!(Level::DEBUG, socket = %socket.id(), "peer half-closed, entering CLOSING");
        socket.set_state(SocketState::Closing);
        inner.buffer_pool.delete(buf);
    }
}

fn repost_recv(inner: &Arc<ManagerInner>, socket: &Arc<Socket>, buf: Pin<Box<Buffer>>) {
    socket.inc_outstanding_recv();
    match ops::post_recv(socket, buf) {
        Ok(outcome) => handle_post_outcome(inner, socket, outcome),
        Err((e, buf)) => {
            event!(Level::ERROR, error = %e, "PostRecv failed");
            socket.dec_outstanding_recv();
            socket.set_state(SocketState::Failure);
            inner.buffer_pool.delete(buf);
        }
    }
}

fn handle_write(inner: &Arc<ManagerInner>, socket: &Arc<Socket>, buf: Pin<Box<Buffer>>, bytes_transferred: u32) {
    let posted_len = buf.payload_len() as i64;
    socket.dec_outstanding_send();
    socket.sub_pending_bytes_sent(posted_len);

    if (bytes_transferred as i64) < posted_len {
        event!(Level::ERROR, socket = %socket.id(), "short write, stream integrity lost");
        socket.set_state(SocketState::Failure);
    }

    inner.buffer_pool.delete(buf);
}

fn handle_connection(inner: &Arc<ManagerInner>, socket: &Arc<Socket>, mut buf: Pin<Box<Buffer>>) {
    let is_accept = buf.operation() == Operation::Accept;

    let comm_socket = if is_accept {
        let accepted = inner.take_current_accept_socket().expect("AcceptEx completion with no pending accept socket");
        if let Err(e) = ops::update_accept_context(accepted.raw_handle(), socket.raw_handle()) {
            event!(Level::ERROR, error = %e, "SO_UPDATE_ACCEPT_CONTEXT failed");
        }
        inner.post_accept_replacement(socket);
        accepted
    } else {
        if let Err(e) = ops::update_connect_context(socket.raw_handle()) {
            event!(Level::ERROR, error = %e, "SO_UPDATE_CONNECT_CONTEXT failed");
        }
        socket.clone()
    };

    comm_socket.set_state(SocketState::Connected);
    unsafe { buf.as_mut().get_unchecked_mut().set_operation(Operation::Read) };
    repost_recv(inner, &comm_socket, buf);

    if inner.isb_factor > 0 {
        let isb_buf = inner.buffer_pool.create(Operation::IsbChange);
        arm_isb(inner, &comm_socket, isb_buf);
    }

    if comm_socket.state() == SocketState::Failure {
        maybe_cleanup(inner, &comm_socket);
    }
}

fn handle_disconnect(inner: &Arc<ManagerInner>, socket: &Arc<Socket>, buf: Pin<Box<Buffer>>) {
    socket.set_state(SocketState::Disconnected);
    socket.stamp_time_wait_start();
    inner.reuse_queue.enqueue(socket.clone());
    event!(Level::DEBUG, socket = %socket.id(), "disconnected, queued for reuse");
    inner.buffer_pool.delete(buf);
}

fn handle_isb_change(inner: &Arc<ManagerInner>, socket: &Arc<Socket>, buf: Pin<Box<Buffer>>) {
    arm_isb(inner, socket, buf);
}

/// Re-arms the ISB-change notification and applies whatever value is current now, mirroring
/// `UpdateISB`: the notify-post and the query are independent calls, and either can fail without
/// invalidating the other.
fn arm_isb(inner: &Arc<ManagerInner>, socket: &Arc<Socket>, buf: Pin<Box<Buffer>>) {
    match ops::post_isb_notify(socket, buf) {
        Ok(outcome) => handle_post_outcome(inner, socket, outcome),
        Err((e, buf)) => {
            event!(Level::ERROR, error = %e, "PostISBNotify failed");
            inner.buffer_pool.delete(buf);
        }
    }

    let isb = ops::query_isb(socket.raw_handle()).unwrap_or_else(|e| {
        event!(Level::ERROR, error = %e, "ideal-send-backlog query failed, falling back to default");
        DEFAULT_MAX_PENDING_BYTE_SENT as u32
    });

    if let Err(e) = ops::set_send_buffer_size(socket.raw_handle(), isb) {
        event!(Level::ERROR, error = %e, "SO_SNDBUF update failed");
    }
    socket.set_max_pending_bytes_sent(isb as i64 * inner.isb_factor);
}

/// The GetQueuedCompletionStatus-failure path (§4.4/§7): recovers the failed operation's tag from
/// the buffer and applies the error-specific state transition.
fn handle_error(inner: &Arc<ManagerInner>, socket: &Arc<Socket>, buf: Pin<Box<Buffer>>, error: windows::core::Error) {
    event!(Level::ERROR, socket = %socket.id(), operation = ?buf.operation(), error = %error, "completion reported failure");

    match buf.operation() {
        Operation::Connect => {
            if error.code().0 as u32 == WSAEADDRINUSE.0 as u32 {
                let new_value = crate::time_wait::double();
                event!(Level::DEBUG, new_value_ms = new_value, "connect retrying under doubled TimeWaitValue");
                let target = socket.remote();
                let id = socket.id();
                socket.set_state(SocketState::RetryConnection);
                if let Some(target) = target {
                    inner.relaunch_connect(target, id);
                }
            } else {
                socket.set_state(SocketState::ConnectFailure);
            }
        }
        Operation::Read => {
            socket.dec_outstanding_recv();
            socket.set_state(SocketState::Failure);
        }
        Operation::Write => {
            socket.dec_outstanding_send();
            socket.sub_pending_bytes_sent(buf.payload_len() as i64);
            socket.set_state(SocketState::Failure);
        }
        _ => socket.set_state(SocketState::Failure),
    }

    inner.buffer_pool.delete(buf);
}

/// After any dispatch, if the socket has crossed the teardown watershed and drained its
/// outstanding operations, performs the close-or-reuse decision exactly once.
fn maybe_cleanup(inner: &Arc<ManagerInner>, socket: &Arc<Socket>) {
    if socket.ready_for_teardown() {
        inner.delete_or_disconnect(socket);
    }
}

/// Used by `handle_disconnect` to timestamp the cooldown window.
impl Socket {
    pub(crate) fn stamp_time_wait_start(&self) {
        let mut inner = self.inner.lock();
        inner.time_wait_start = Some(Instant::now());
    }
}

/// Re-exported so `manager.rs` can reuse the same connect-target bookkeeping on the retry path.
pub(crate) type ConnectTarget = SocketAddrV4;
