//! The per-socket lifecycle state machine.

use parking_lot::Mutex;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Instant;
use uuid::Uuid;
use windows::Win32::Networking::WinSock::{closesocket, INVALID_SOCKET, SOCKET};

use crate::config::DEFAULT_MAX_PENDING_BYTE_SENT;

/// Opaque identifier for a socket, unique within a manager and stable across reuse (§3: "stable
/// across reuse") - a socket pulled from the reuse queue for a fresh connect keeps the same id it
/// was originally given; only a `RETRY_CONNECTION` transition hands an existing id to a
/// *different* underlying record (the replacement socket launched after an address-in-use retry).
pub type SocketId = Uuid;

/// Address family a manager was constructed for. Fixed at construction; the design is parametric
/// over family but IPv6 is out of scope for the current implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    Inet,
}

/// Socket lifecycle states.
///
/// Ordered so that **every state greater than `Connected` indicates the socket is tearing
/// down** - this corrects an inconsistency in the original implementation, where the ordinal
/// position of `Disconnected`/`RetryConnection`/`ConnectFailure` did not actually sit past
/// `Connected` despite being teardown states. The cleanup check
/// (`state > Connected && outstanding_recv == 0 && outstanding_send == 0`) only works correctly
/// under this corrected ordering; see `DESIGN.md` for the decision record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SocketState {
    Init,
    Associated,
    Bound,
    Listening,
    Accepting,
    Connected,
    Closing,
    Failure,
    ConnectFailure,
    Disconnecting,
    Disconnected,
    RetryConnection,
    Closed,
}

impl SocketState {
    /// True once the socket has passed the watershed and is on a teardown path.
    pub(crate) fn is_tearing_down(self) -> bool {
        self > SocketState::Connected
    }

    /// True for the "not yet usable, not yet failed" states named by `isSocketInitialising`.
    pub(crate) fn is_initialising(self) -> bool {
        matches!(
            self,
            SocketState::Init | SocketState::Associated | SocketState::Bound | SocketState::Accepting
        )
    }
}

/// A raw platform socket handle, tracking its own validity so callers never need to compare
/// against `INVALID_SOCKET` by hand.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RawSocket(SOCKET);

impl RawSocket {
    pub(crate) fn new(handle: SOCKET) -> Self {
        Self(handle)
    }

    pub(crate) fn invalid() -> Self {
        Self(INVALID_SOCKET)
    }

    pub(crate) fn is_valid(self) -> bool {
        self.0 != INVALID_SOCKET
    }

    pub(crate) fn raw(self) -> SOCKET {
        self.0
    }

    pub(crate) fn invalidate(&mut self) {
        self.0 = INVALID_SOCKET;
    }
}

/// Mutable state protected by the socket's own guard. Everything here is mutated exclusively
/// while holding `Socket::inner`'s lock, per the lock-order rule (socket guard before any
/// container guard, never two socket guards at once).
pub(crate) struct SocketInner {
    pub(crate) handle: RawSocket,
    pub(crate) state: SocketState,
    pub(crate) remote: Option<SocketAddrV4>,
    pub(crate) outstanding_recv: i64,
    pub(crate) outstanding_send: i64,
    pub(crate) time_wait_start: Option<Instant>,
    /// Bumped each time a `RETRY_CONNECTION` transition launches a fresh connect under the same
    /// id; diagnostic only.
    pub(crate) retry_generation: u32,
}

/// One TCP endpoint known to a manager.
///
/// Holds its own lock (`inner`) rather than relying on a manager-wide lock, so completions for
/// distinct sockets never contend with each other. `pending_bytes_sent` is additionally atomic,
/// per the spec's requirement that `SendData`'s admission check be answerable without taking the
/// socket guard.
pub struct Socket {
    pub(crate) id: SocketId,
    pub(crate) af: AddressFamily,
    pub(crate) inner: Mutex<SocketInner>,
    pending_bytes_sent: AtomicI64,
    max_pending_bytes_sent: AtomicI64,
    /// Latched the first time this socket crosses into `delete_or_disconnect`, so a second,
    /// racing completion on the same socket cannot initiate teardown twice.
    teardown_started: AtomicBool,
}

impl Socket {
    pub(crate) fn new(id: SocketId, af: AddressFamily, handle: RawSocket, state: SocketState) -> Self {
        Self {
            id,
            af,
            inner: Mutex::new(SocketInner {
                handle,
                state,
                remote: None,
                outstanding_recv: 0,
                outstanding_send: 0,
                time_wait_start: None,
                retry_generation: 0,
            }),
            pending_bytes_sent: AtomicI64::new(0),
            max_pending_bytes_sent: AtomicI64::new(DEFAULT_MAX_PENDING_BYTE_SENT),
            teardown_started: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> SocketId {
        self.id
    }

    pub(crate) fn state(&self) -> SocketState {
        self.inner.lock().state
    }

    pub(crate) fn set_state(&self, state: SocketState) {
        self.inner.lock().state = state;
    }

    pub(crate) fn raw_handle(&self) -> SOCKET {
        self.inner.lock().handle.raw()
    }

    pub(crate) fn set_handle(&self, handle: RawSocket) {
        self.inner.lock().handle = handle;
    }

    pub(crate) fn address_family(&self) -> AddressFamily {
        self.af
    }

    pub(crate) fn remote(&self) -> Option<SocketAddrV4> {
        self.inner.lock().remote
    }

    pub(crate) fn set_remote(&self, remote: SocketAddrV4) {
        self.inner.lock().remote = Some(remote);
    }

    pub(crate) fn pending_bytes_sent(&self) -> i64 {
        self.pending_bytes_sent.load(Ordering::Acquire)
    }

    pub(crate) fn max_pending_bytes_sent(&self) -> i64 {
        self.max_pending_bytes_sent.load(Ordering::Acquire)
    }

    pub(crate) fn set_max_pending_bytes_sent(&self, value: i64) {
        self.max_pending_bytes_sent.store(value, Ordering::Release);
    }

    /// Admits a send of `len` bytes against the backpressure threshold. Lock-free: reads two
    /// atomics only, matching the spec's requirement that admission not require the socket
    /// guard.
    pub(crate) fn admit_send(&self, len: i64) -> bool {
        self.pending_bytes_sent.load(Ordering::Acquire) + len <= self.max_pending_bytes_sent()
    }

    pub(crate) fn add_pending_bytes_sent(&self, delta: i64) {
        self.pending_bytes_sent.fetch_add(delta, Ordering::AcqRel);
    }

    pub(crate) fn sub_pending_bytes_sent(&self, delta: i64) {
        self.pending_bytes_sent.fetch_sub(delta, Ordering::AcqRel);
    }

    /// Invariant 1: outstanding counts never go negative.
    pub(crate) fn inc_outstanding_recv(&self) {
        self.inner.lock().outstanding_recv += 1;
    }

    pub(crate) fn dec_outstanding_recv(&self) {
        let mut inner = self.inner.lock();
        debug_assert!(inner.outstanding_recv > 0);
        inner.outstanding_recv -= 1;
    }

    pub(crate) fn inc_outstanding_send(&self) {
        self.inner.lock().outstanding_send += 1;
    }

    pub(crate) fn dec_outstanding_send(&self) {
        let mut inner = self.inner.lock();
        debug_assert!(inner.outstanding_send > 0);
        inner.outstanding_send -= 1;
    }

    pub(crate) fn outstanding_total(&self) -> i64 {
        let inner = self.inner.lock();
        inner.outstanding_recv + inner.outstanding_send
    }

    /// Whether this socket is past the watershed and has drained its outstanding operations -
    /// the point at which the dispatcher must perform the teardown decision.
    pub(crate) fn ready_for_teardown(&self) -> bool {
        let inner = self.inner.lock();
        inner.state.is_tearing_down() && inner.outstanding_recv == 0 && inner.outstanding_send == 0
    }

    /// Claims the right to initiate this socket's teardown decision. Returns `true` exactly
    /// once per socket; every later call (e.g. a second dispatcher thread observing the same
    /// drained-and-tearing-down state after the `Disconnected` completion lands) returns `false`
    /// and should do nothing further.
    pub(crate) fn begin_teardown(&self) -> bool {
        self.teardown_started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        let handle = self.inner.get_mut().handle;
        if handle.is_valid() {
            // SAFETY: no other reference to this socket can exist - we hold `&mut self`.
            unsafe {
                let _ = closesocket(handle.raw());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh(state: SocketState) -> Socket {
        Socket::new(Uuid::new_v4(), AddressFamily::Inet, RawSocket::invalid(), state)
    }

    #[test]
    fn teardown_watershed_matches_connected_ordinal() {
        for state in [
            SocketState::Init,
            SocketState::Associated,
            SocketState::Bound,
            SocketState::Listening,
            SocketState::Accepting,
            SocketState::Connected,
        ] {
            assert!(!state.is_tearing_down(), "{state:?} should not be tearing down");
        }

        for state in [
            SocketState::Closing,
            SocketState::Failure,
            SocketState::ConnectFailure,
            SocketState::Disconnecting,
            SocketState::Disconnected,
            SocketState::RetryConnection,
            SocketState::Closed,
        ] {
            assert!(state.is_tearing_down(), "{state:?} should be tearing down");
        }
    }

    #[test]
    fn initialising_set_matches_spec() {
        for state in [
            SocketState::Init,
            SocketState::Associated,
            SocketState::Bound,
            SocketState::Accepting,
        ] {
            assert!(state.is_initialising());
        }

        for state in [SocketState::Listening, SocketState::Connected, SocketState::Closed] {
            assert!(!state.is_initialising());
        }
    }

    #[test]
    fn admit_send_respects_threshold_boundary() {
        let s = fresh(SocketState::Connected);
        s.set_max_pending_bytes_sent(100);
        assert!(s.admit_send(100));
        assert!(!s.admit_send(101));

        s.add_pending_bytes_sent(50);
        assert!(s.admit_send(50));
        assert!(!s.admit_send(51));

        s.sub_pending_bytes_sent(50);
        assert!(s.admit_send(100));
    }

    #[test]
    fn outstanding_counts_never_go_negative_across_matched_inc_dec() {
        let s = fresh(SocketState::Connected);
        s.inc_outstanding_recv();
        s.inc_outstanding_send();
        assert_eq!(s.outstanding_total(), 2);

        s.dec_outstanding_recv();
        s.dec_outstanding_send();
        assert_eq!(s.outstanding_total(), 0);
        assert!(!s.ready_for_teardown(), "Connected is not past the watershed");
    }

    #[test]
    fn ready_for_teardown_requires_both_watershed_and_drained_counts() {
        let s = fresh(SocketState::Closing);
        s.inc_outstanding_recv();
        assert!(!s.ready_for_teardown(), "still has an outstanding recv");

        s.dec_outstanding_recv();
        assert!(s.ready_for_teardown());
    }

    #[test]
    fn begin_teardown_is_claimed_exactly_once() {
        let s = fresh(SocketState::Closing);
        assert!(s.begin_teardown());
        assert!(!s.begin_teardown());
        assert!(!s.begin_teardown());
    }

    #[test]
    fn ids_are_unique_per_socket() {
        let a = fresh(SocketState::Init);
        let b = fresh(SocketState::Init);
        assert_ne!(a.id(), b.id());
    }
}
