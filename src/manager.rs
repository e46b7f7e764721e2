//! The public façade: construction, the connect/listen/send surface, and orderly shutdown.

use crate::buffer::{Buffer, BufferPool, Operation};
use crate::completion_port::CompletionPort;
use crate::config::{DEFAULT_ISB_FACTOR, MAX_UNUSED_SOCKET, SMALL_BACKLOG, THREADS_PER_PROC};
use crate::dispatcher;
use crate::error::Result;
use crate::handle::SocketHandle;
use crate::handler::ConnectionHandler;
use crate::ops;
use crate::registry::SocketRegistry;
use crate::reuse_queue::ReuseQueue;
use crate::socket::{AddressFamily, Socket, SocketId, SocketState};
use crate::time_wait::{self, RegistryTimeWaitSource, TimeWaitSource};
use crate::winsock;
use parking_lot::Mutex;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use tracing::{event, Level};
use uuid::Uuid;
use windows::Win32::Foundation::HANDLE;
use windows::Win32::Networking::WinSock::SOMAXCONN;

/// Which side of a connection a manager was constructed to run. Both kinds share every code
/// path in this module; the distinction only gates `is_client_socket_ready`/
/// `is_server_socket_ready`, mirroring the two separate readiness queries the original exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerKind {
    Client,
    Server,
}

/// Shared state behind every [`Manager`]. Kept separate from `Manager` itself so that worker
/// threads (which must outlive a `connect`/`send` call returning) and [`SocketHandle`] (which
/// must not keep the manager alive on its own) can each hold their own reference kind - an
/// owning `Arc` for workers, a non-owning `Weak` for handles.
pub(crate) struct ManagerInner {
    self_weak: Weak<ManagerInner>,
    kind: ManagerKind,
    pub(crate) port: CompletionPort,
    pub(crate) registry: SocketRegistry,
    pub(crate) reuse_queue: ReuseQueue,
    pub(crate) buffer_pool: BufferPool,
    pub(crate) handler: Box<dyn ConnectionHandler>,
    pub(crate) isb_factor: i64,
    listener: Mutex<Option<Arc<Socket>>>,
    current_accept_socket: Mutex<Option<Arc<Socket>>>,
    shutdown: AtomicBool,
}

impl ManagerInner {
    pub(crate) fn self_arc(&self) -> Arc<ManagerInner> {
        self.self_weak.upgrade().expect("ManagerInner outlives every Arc clone it hands out")
    }

    fn bind_to_port(&self, socket: &Arc<Socket>) -> Result<()> {
        let key = Arc::as_ptr(socket) as usize;
        let handle = HANDLE(socket.raw_handle().0 as _);
        self.port.bind(handle, key)
    }

    /// Creates a socket, binds it to an ephemeral local port, and posts `ConnectEx` toward
    /// `target`. `reuse_id` carries a `RETRY_CONNECTION` handoff's existing id forward; a fresh
    /// `connect()` call passes `None` and gets a freshly minted one.
    ///
    /// Before creating anything, tries the reuse queue (§4.5: "reusing from the queue if the
    /// oldest entry has cooled past `TimeWaitValue`, else creating fresh"). A reused socket keeps
    /// its own id (the data model's "stable across reuse") rather than being handed a new one -
    /// `reuse_id` is not consulted on this path since it exists for the unrelated
    /// `RETRY_CONNECTION` handoff, which never goes through the reuse queue.
    fn launch_connect(&self, target: SocketAddrV4, reuse_id: Option<SocketId>) -> Option<SocketId> {
        let time_wait_value = std::time::Duration::from_millis(time_wait::current() as u64);
        if let Some(socket) = self.reuse_queue.try_reuse(time_wait_value) {
            return Some(self.relaunch_on_reused(socket, target));
        }

        let raw = ops::create_socket()
            .map_err(|e| event!(Level::ERROR, error = %e, "WSASocketW failed for outbound connect"))
            .ok()?;
        if let Err(e) = ops::bind_ephemeral(raw.raw()) {
            event!(Level::ERROR, error = %e, "bind_ephemeral failed");
            return None;
        }

        let id = reuse_id.unwrap_or_else(Uuid::new_v4);
        let socket = Arc::new(Socket::new(id, AddressFamily::Inet, raw, SocketState::Associated));
        socket.set_remote(target);

        if let Err(e) = self.bind_to_port(&socket) {
            event!(Level::ERROR, error = %e, "CreateIoCompletionPort(bind) failed for outbound socket");
            return None;
        }

        self.registry.insert(socket.clone());
        self.registry.register(id, socket.clone());

        let buf = self.buffer_pool.create(Operation::Connect);
        match ops::post_connect(&socket, target, buf) {
            Ok(outcome) => dispatcher::handle_post_outcome(&self.self_arc(), &socket, outcome),
            Err((e, buf)) => {
                event!(Level::ERROR, error = %e, "ConnectEx failed to post");
                socket.set_state(SocketState::ConnectFailure);
                self.buffer_pool.delete(buf);
            }
        }

        Some(id)
    }

    /// Relaunches a connect attempt under the same id after an address-in-use/timeout failure,
    /// per the `RETRY_CONNECTION` transition (§7/§9). The original record is left to tear down
    /// on its own through the normal `ready_for_teardown` path.
    pub(crate) fn relaunch_connect(&self, target: SocketAddrV4, id: SocketId) {
        self.launch_connect(target, Some(id));
    }

    /// Re-arms a cooled-down, reuse-queued socket for a fresh `ConnectEx` toward `target`. The
    /// handle is already bound locally (from its original `bind_ephemeral`) and already
    /// associated with the completion port, so neither step is repeated - only the original
    /// implementation's handle-preserving `DisconnectEx` makes this possible. Still registered
    /// under its own id (never deregistered on disconnect, only on terminal close), so
    /// `register` here is a no-op refresh rather than a first registration.
    fn relaunch_on_reused(&self, socket: Arc<Socket>, target: SocketAddrV4) -> SocketId {
        let id = socket.id();
        socket.set_remote(target);
        socket.set_state(SocketState::Associated);
        self.registry.register(id, socket.clone());

        let buf = self.buffer_pool.create(Operation::Connect);
        match ops::post_connect(&socket, target, buf) {
            Ok(outcome) => dispatcher::handle_post_outcome(&self.self_arc(), &socket, outcome),
            Err((e, buf)) => {
                event!(Level::ERROR, error = %e, "ConnectEx failed to post for a reused socket");
                socket.set_state(SocketState::ConnectFailure);
                self.buffer_pool.delete(buf);
            }
        }

        id
    }

    fn start_listener(&self, port: u16, few_clients_expected: bool) -> Option<SocketId> {
        if self.listener.lock().is_some() {
            event!(Level::ERROR, message = "listen() called again; a manager may host only one listener");
            return None;
        }

        let raw = ops::create_socket()
            .map_err(|e| event!(Level::ERROR, error = %e, "WSASocketW failed for listener"))
            .ok()?;
        let backlog = if few_clients_expected { SMALL_BACKLOG } else { SOMAXCONN as i32 };
        if let Err(e) = ops::bind_and_listen(raw.raw(), port, backlog) {
            event!(Level::ERROR, error = %e, "bind_and_listen failed");
            return None;
        }

        let id = Uuid::new_v4();
        let socket = Arc::new(Socket::new(id, AddressFamily::Inet, raw, SocketState::Listening));

        if let Err(e) = self.bind_to_port(&socket) {
            event!(Level::ERROR, error = %e, "CreateIoCompletionPort(bind) failed for listener");
            return None;
        }

        self.registry.insert(socket.clone());
        self.registry.register(id, socket.clone());
        *self.listener.lock() = Some(socket.clone());

        self.post_accept_replacement(&socket);

        Some(id)
    }

    /// Creates a fresh accept-capable socket, arms it as the pending accept-socket handoff slot
    /// (§4.3/§9), and posts `AcceptEx` on `listener`. Called once at `listen()` time and once
    /// more after every accept completion, so there is always exactly one accept outstanding.
    pub(crate) fn post_accept_replacement(&self, listener: &Arc<Socket>) {
        let raw = match ops::create_socket() {
            Ok(raw) => raw,
            Err(e) => {
                event!(Level::ERROR, error = %e, "failed to create socket for AcceptEx, backlog slot dropped");
                return;
            }
        };

        let id = Uuid::new_v4();
        let accept_socket = Arc::new(Socket::new(id, AddressFamily::Inet, raw, SocketState::Accepting));

        if let Err(e) = self.bind_to_port(&accept_socket) {
            event!(Level::ERROR, error = %e, "CreateIoCompletionPort(bind) failed for accepted socket");
            return;
        }

        self.registry.insert(accept_socket.clone());
        self.registry.register(id, accept_socket.clone());

        {
            let mut slot = self.current_accept_socket.lock();
            debug_assert!(slot.is_none(), "accept handoff slot already occupied");
            *slot = Some(accept_socket.clone());
        }

        let buf = self.buffer_pool.create(Operation::Accept);
        match ops::post_accept(listener.raw_handle(), accept_socket.raw_handle(), buf) {
            Ok(outcome) => dispatcher::handle_post_outcome(&self.self_arc(), listener, outcome),
            Err((e, buf)) => {
                event!(Level::ERROR, error = %e, "AcceptEx failed to post");
                self.buffer_pool.delete(buf);
            }
        }
    }

    pub(crate) fn take_current_accept_socket(&self) -> Option<Arc<Socket>> {
        self.current_accept_socket.lock().take()
    }

    /// The only externally reachable `ChangeSocketState` transition: a caller-initiated
    /// graceful close, handled identically to the peer half-closing first.
    pub(crate) fn request_close(&self, id: SocketId) {
        let Some(socket) = self.registry.get(id) else { return };
        if socket.state() == SocketState::Connected {
            socket.set_state(SocketState::Closing);
            if socket.ready_for_teardown() {
                self.delete_or_disconnect(&socket);
            }
        }
    }

    pub(crate) fn send_data(&self, id: SocketId, data: &[u8]) -> bool {
        match self.registry.get(id) {
            Some(socket) => self.send_on(&socket, data),
            None => false,
        }
    }

    /// Fragments `data` into `Buffer::SIZE`-sized chunks, each posted as its own `Write` (§4.5).
    /// The backpressure check is against the whole message up front; once admitted, every
    /// fragment is posted even if later ones push `pending-bytes-sent` past the threshold (the
    /// original only gates admission at the call boundary, not per-fragment). On any post
    /// failure the socket fails and the remaining fragments are dropped.
    fn send_on(&self, socket: &Arc<Socket>, data: &[u8]) -> bool {
        if socket.state() != SocketState::Connected {
            return false;
        }
        if !socket.admit_send(data.len() as i64) {
            return false;
        }

        for chunk in data.chunks(Buffer::SIZE) {
            let mut buf = self.buffer_pool.create(Operation::Write);
            // SAFETY: `buf` was just created and is not yet shared with the OS.
            let filled = unsafe { buf.as_mut().get_unchecked_mut().fill(chunk) } as i64;
            socket.add_pending_bytes_sent(filled);
            socket.inc_outstanding_send();

            match ops::post_send(socket, buf) {
                Ok(outcome) => dispatcher::handle_post_outcome(&self.self_arc(), socket, outcome),
                Err((e, buf)) => {
                    event!(Level::ERROR, error = %e, "WSASend failed to post, dropping remainder of message");
                    socket.dec_outstanding_send();
                    socket.sub_pending_bytes_sent(filled);
                    socket.set_state(SocketState::Failure);
                    self.buffer_pool.delete(buf);
                    break;
                }
            }
        }

        true
    }

    /// The close-or-reuse decision run once a socket crosses the teardown watershed
    /// (§4.4/§9): a peer-initiated graceful close tries to recycle the handle via a reuse-capable
    /// `DisconnectEx` when the reuse queue has room; every other teardown path hard-closes.
    /// Guarded by `Socket::begin_teardown` so a socket's decision is made exactly once, even
    /// though `Disconnected`'s own completion crosses the same watershed a second time.
    pub(crate) fn delete_or_disconnect(&self, socket: &Arc<Socket>) {
        if !socket.begin_teardown() {
            return;
        }

        if socket.state() == SocketState::Closing && self.reuse_queue.has_capacity() {
            socket.set_state(SocketState::Disconnecting);
            let buf = self.buffer_pool.create(Operation::Disconnect);
            match ops::post_disconnect(socket, buf) {
                Ok(outcome) => dispatcher::handle_post_outcome(&self.self_arc(), socket, outcome),
                Err((e, buf)) => {
                    event!(Level::ERROR, error = %e, "DisconnectEx failed to post, closing instead");
                    self.buffer_pool.delete(buf);
                    self.hard_close(socket);
                }
            }
        } else {
            self.hard_close(socket);
        }
    }

    fn hard_close(&self, socket: &Arc<Socket>) {
        self.registry.deregister(socket.id(), socket);
        self.registry.remove_from_list(socket);
        socket.set_state(SocketState::Closed);
    }
}

/// A running connection manager: a completion port, a fixed worker pool, and every socket it
/// currently owns. Construction performs the full readiness ladder (Winsock init, port creation,
/// worker spawn, extension-function discovery, `TimeWaitValue` selection) before returning, so a
/// `Manager` is always either fully usable or not returned at all.
pub struct Manager {
    inner: Arc<ManagerInner>,
    workers: Vec<JoinHandle<()>>,
}

/// Disarms itself once construction fully succeeds; otherwise its `Drop` undoes the one process
/// wide side effect (`WSAStartup`) that isn't already undone by an intermediate value's own
/// `Drop` (the completion port closes its own handle if construction fails after creating it).
struct WsaRollbackGuard(bool);

impl WsaRollbackGuard {
    fn disarm(&mut self) {
        self.0 = false;
    }
}

impl Drop for WsaRollbackGuard {
    fn drop(&mut self) {
        if self.0 {
            winsock::wsa_cleanup();
        }
    }
}

impl Manager {
    pub fn new_client(handler: Box<dyn ConnectionHandler>) -> Result<Self> {
        Self::construct(ManagerKind::Client, handler, DEFAULT_ISB_FACTOR, &RegistryTimeWaitSource)
    }

    pub fn new_server(handler: Box<dyn ConnectionHandler>) -> Result<Self> {
        Self::construct(ManagerKind::Server, handler, DEFAULT_ISB_FACTOR, &RegistryTimeWaitSource)
    }

    /// As [`Manager::new_client`]/[`Manager::new_server`] but with an injectable `isb_factor`
    /// and `TimeWaitSource`, for tests that need determinism a real registry read can't give.
    pub fn with_time_wait_source(
        kind: ManagerKind,
        handler: Box<dyn ConnectionHandler>,
        isb_factor: i64,
        time_wait_source: &dyn TimeWaitSource,
    ) -> Result<Self> {
        Self::construct(kind, handler, isb_factor, time_wait_source)
    }

    fn construct(
        kind: ManagerKind,
        handler: Box<dyn ConnectionHandler>,
        isb_factor: i64,
        time_wait_source: &dyn TimeWaitSource,
    ) -> Result<Self> {
        winsock::wsa_startup()?;
        let mut rollback = WsaRollbackGuard(true);

        let port = CompletionPort::new()?;
        winsock::extension_functions()?;
        time_wait::ensure_selected(time_wait_source);

        let inner = Arc::new_cyclic(|weak| ManagerInner {
            self_weak: weak.clone(),
            kind,
            port,
            registry: SocketRegistry::new(),
            reuse_queue: ReuseQueue::new(MAX_UNUSED_SOCKET),
            buffer_pool: BufferPool::new(),
            handler,
            isb_factor,
            listener: Mutex::new(None),
            current_accept_socket: Mutex::new(None),
            shutdown: AtomicBool::new(false),
        });

        let thread_count = (num_cpus::get() * THREADS_PER_PROC).max(1);
        let workers = dispatcher::spawn_workers(inner.clone(), thread_count);

        rollback.disarm();
        Ok(Manager { inner, workers })
    }

    /// Starts a connect attempt toward `address:port`. Returns the id the new socket will be
    /// known by once it reaches `Connected` - the manager's readiness queries are how a caller
    /// learns when that has happened, matching the original's fire-and-poll connect pattern.
    ///
    /// Fails (`None`) if this manager is not `ManagerKind::Client` (§4.5: `ConnectToNewSocket`
    /// "validates ... type is CLIENT").
    pub fn connect(&self, address: Ipv4Addr, port: u16) -> Option<SocketId> {
        if self.inner.kind != ManagerKind::Client {
            event!(Level::ERROR, message = "connect() called on a non-CLIENT manager");
            return None;
        }
        self.inner.launch_connect(SocketAddrV4::new(address, port), None)
    }

    /// Starts listening on `port`. `few_clients_expected` selects a minimal backlog instead of
    /// `SOMAXCONN`, matching the original's `ListenToNewSocket` parameter of the same name.
    ///
    /// Fails (`None`) if this manager is not `ManagerKind::Server` (§4.5: `ListenToNewSocket`
    /// "validates ... type is SERVER"), or if a listener has already been started - "a manager
    /// may host only one listener; repeated calls fail".
    pub fn listen(&self, port: u16, few_clients_expected: bool) -> Option<SocketId> {
        if self.inner.kind != ManagerKind::Server {
            event!(Level::ERROR, message = "listen() called on a non-SERVER manager");
            return None;
        }
        self.inner.start_listener(port, few_clients_expected)
    }

    /// Sends `data` on `id`. Returns `false` if the socket is not `Connected` or the
    /// backpressure threshold would be exceeded (§4.5) - not an error, just "not sent".
    pub fn send(&self, id: SocketId, data: &[u8]) -> bool {
        self.inner.send_data(id, data)
    }

    /// Sends `data` to every currently `Connected` socket, best-effort (a socket for which
    /// `send` would return `false` is silently skipped).
    pub fn send_to_all(&self, data: &[u8]) {
        for socket in self.inner.registry.connected() {
            self.inner.send_on(&socket, data);
        }
    }

    pub fn is_ready(&self) -> bool {
        !self.inner.shutdown.load(Ordering::Acquire)
    }

    pub fn is_client_socket_ready(&self, id: SocketId) -> bool {
        self.inner.kind == ManagerKind::Client && self.socket_connected(id)
    }

    pub fn is_server_socket_ready(&self, id: SocketId) -> bool {
        self.inner.kind == ManagerKind::Server && self.socket_connected(id)
    }

    fn socket_connected(&self, id: SocketId) -> bool {
        self.inner.registry.get(id).map(|s| s.state() == SocketState::Connected).unwrap_or(false)
    }

    pub fn is_socket_initialising(&self, id: SocketId) -> bool {
        self.inner.registry.get(id).map(|s| s.state().is_initialising()).unwrap_or(false)
    }

    /// A by-id reference usable from application code, or `None` if `id` is not currently
    /// registered.
    pub fn handle(&self, id: SocketId) -> Option<SocketHandle> {
        self.inner.registry.get(id).map(|_| SocketHandle::new(&self.inner, id))
    }
}

impl Drop for Manager {
    /// Orderly shutdown (§4.5/§9): signal every worker with one synthetic `End` completion, join
    /// them all (no worker calls back into the manager after this point), then close every
    /// remaining socket - both currently registered and sitting in the reuse queue - before
    /// finally releasing the process-wide Winsock reference this manager took at construction.
    fn drop(&mut self) {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }

        for _ in 0..self.workers.len() {
            let buf = self.inner.buffer_pool.create(Operation::End);
            let raw = Buffer::into_raw(buf);
            // SAFETY: `raw` was just produced by `into_raw` and is posted exactly once.
            let overlapped = unsafe { (*raw).overlapped_mut() };
            if let Err(e) = self.inner.port.post(overlapped) {
                event!(Level::ERROR, error = %e, "failed to post shutdown signal to a worker");
            }
        }

        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }

        for socket in self.inner.registry.clear() {
            socket.set_state(SocketState::Closed);
        }
        for socket in self.inner.reuse_queue.drain_all() {
            socket.set_state(SocketState::Closed);
        }
        self.inner.listener.lock().take();
        self.inner.current_accept_socket.lock().take();

        winsock::wsa_cleanup();
    }
}
