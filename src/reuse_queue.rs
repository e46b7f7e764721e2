//! FIFO of disconnected sockets eligible for recycling once `TimeWaitValue` has elapsed.

use crate::socket::Socket;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub(crate) struct ReuseQueue {
    queue: Mutex<VecDeque<Arc<Socket>>>,
    cap: usize,
}

impl ReuseQueue {
    pub(crate) fn new(cap: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            cap,
        }
    }

    /// Whether the queue has room for one more disconnected socket. Consulted by the `CLOSING`
    /// teardown decision to choose reuse-disconnect over a hard close.
    pub(crate) fn has_capacity(&self) -> bool {
        self.queue.lock().len() < self.cap
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Enqueues a socket that just completed a graceful disconnect. Caller is responsible for
    /// having stamped `time_wait_start` first.
    pub(crate) fn enqueue(&self, socket: Arc<Socket>) {
        let mut queue = self.queue.lock();
        debug_assert!(queue.len() < self.cap, "invariant 7: reuse queue over capacity");
        queue.push_back(socket);
    }

    /// Pops the oldest queued socket if it has cooled past `time_wait_value`. Returns `None`
    /// (leaving the queue untouched) if the queue is empty or the oldest entry has not yet
    /// cooled - the original implementation only ever inspects the front of the queue, which is
    /// correct because entries are enqueued in increasing `time_wait_start` order.
    pub(crate) fn try_reuse(&self, time_wait_value: Duration) -> Option<Arc<Socket>> {
        let mut queue = self.queue.lock();
        let front = queue.front()?;
        let start = front
            .inner
            .lock()
            .time_wait_start
            .expect("queued socket must have a time_wait_start");
        if start.elapsed() >= time_wait_value {
            queue.pop_front()
        } else {
            None
        }
    }

    /// Drains every queued socket unconditionally, ignoring cooldown. Used only when a manager
    /// is shutting down and every remaining socket must be closed regardless of `TimeWaitValue`.
    pub(crate) fn drain_all(&self) -> Vec<Arc<Socket>> {
        self.queue.lock().drain(..).collect()
    }

    #[cfg(test)]
    pub(crate) fn front_time_wait_start(&self) -> Option<Instant> {
        self.queue.lock().front().and_then(|s| s.inner.lock().time_wait_start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::{AddressFamily, RawSocket, SocketState};
    use uuid::Uuid;

    fn disconnected_socket(time_wait_start: Instant) -> Arc<Socket> {
        let s = Socket::new(
            Uuid::new_v4(),
            AddressFamily::Inet,
            RawSocket::invalid(),
            SocketState::Disconnected,
        );
        s.inner.lock().time_wait_start = Some(time_wait_start);
        Arc::new(s)
    }

    #[test]
    fn has_capacity_respects_cap() {
        let q = ReuseQueue::new(1);
        assert!(q.has_capacity());
        q.enqueue(disconnected_socket(Instant::now()));
        assert!(!q.has_capacity());
    }

    #[test]
    fn try_reuse_waits_for_time_wait_to_elapse() {
        let q = ReuseQueue::new(10);
        q.enqueue(disconnected_socket(Instant::now()));
        assert!(q.try_reuse(Duration::from_secs(60)).is_none());
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn try_reuse_pops_once_cooled() {
        let q = ReuseQueue::new(10);
        let old_start = Instant::now() - Duration::from_millis(50);
        q.enqueue(disconnected_socket(old_start));
        let reused = q.try_reuse(Duration::from_millis(10));
        assert!(reused.is_some());
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn try_reuse_on_empty_queue_is_none() {
        let q = ReuseQueue::new(10);
        assert!(q.try_reuse(Duration::from_millis(0)).is_none());
    }
}
