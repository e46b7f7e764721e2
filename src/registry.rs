//! Owns every live [`Socket`] and provides the only id→socket lookup external callers can reach.

use crate::socket::{Socket, SocketId, SocketState};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Two structures kept in lockstep: a list that owns every live socket, and a map that is the
/// sole channel by which an id resolves to a socket. They carry separate guards (per the
/// concurrency model's per-container lock policy); code that must update both always locks the
/// list first, then the map, to keep a single consistent lock order.
pub(crate) struct SocketRegistry {
    list: Mutex<Vec<Arc<Socket>>>,
    map: Mutex<HashMap<SocketId, Arc<Socket>>>,
}

impl SocketRegistry {
    pub(crate) fn new() -> Self {
        Self {
            list: Mutex::new(Vec::new()),
            map: Mutex::new(HashMap::new()),
        }
    }

    /// Adds a socket to the owning list. Does not make it reachable by id; call `register` too.
    pub(crate) fn insert(&self, socket: Arc<Socket>) {
        self.list.lock().push(socket);
    }

    /// Makes `socket` reachable as `id`, overwriting any existing entry under that id. Used both
    /// for first registration and for the `RETRY_CONNECTION` identity handoff, where a fresh
    /// socket adopts the id of the one that just failed to connect.
    pub(crate) fn register(&self, id: SocketId, socket: Arc<Socket>) {
        self.map.lock().insert(id, socket);
    }

    /// Returns the socket currently reachable under `id`, if any. Callers must treat the
    /// returned `Arc` as valid only for the duration of the operation that uses it - it may be
    /// deregistered concurrently by another worker.
    pub(crate) fn get(&self, id: SocketId) -> Option<Arc<Socket>> {
        self.map.lock().get(&id).cloned()
    }

    /// Removes the id→socket entry, but only if it still points at `socket` itself. Called when
    /// a socket enters a terminal state (`CLOSED`). Conditional on identity because a
    /// `RETRY_CONNECTION` handoff can register a replacement socket under this same id before the
    /// original socket's own teardown gets around to calling this - an unconditional
    /// `HashMap::remove` would then delete the replacement's entry out from under it, not the
    /// stale original's. Mirrors `remove_from_list`'s identity check on the list side.
    pub(crate) fn deregister(&self, id: SocketId, socket: &Arc<Socket>) {
        use std::collections::hash_map::Entry;

        if let Entry::Occupied(entry) = self.map.lock().entry(id) {
            if Arc::ptr_eq(entry.get(), socket) {
                entry.remove();
            }
        }
    }

    /// Removes a socket from the owning list, allowing it to be deallocated once the last `Arc`
    /// clone is dropped. Only valid once the socket has no outstanding operations.
    pub(crate) fn remove_from_list(&self, socket: &Arc<Socket>) {
        let mut list = self.list.lock();
        if let Some(pos) = list.iter().position(|s| Arc::ptr_eq(s, socket)) {
            list.swap_remove(pos);
        }
    }

    /// Every socket currently in `Connected` state, for `SendDataToAll`.
    pub(crate) fn connected(&self) -> Vec<Arc<Socket>> {
        self.list
            .lock()
            .iter()
            .filter(|s| s.state() == SocketState::Connected)
            .cloned()
            .collect()
    }

    /// Drains the owning list and clears the lookup map, for manager shutdown. Returns the
    /// drained sockets so the caller can close each one down.
    pub(crate) fn clear(&self) -> Vec<Arc<Socket>> {
        let drained = std::mem::take(&mut *self.list.lock());
        self.map.lock().clear();
        drained
    }

    #[cfg(test)]
    pub(crate) fn list_len(&self) -> usize {
        self.list.lock().len()
    }

    #[cfg(test)]
    pub(crate) fn map_len(&self) -> usize {
        self.map.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::{AddressFamily, RawSocket};
    use uuid::Uuid;

    fn fresh_socket(state: SocketState) -> Arc<Socket> {
        let s = Socket::new(Uuid::new_v4(), AddressFamily::Inet, RawSocket::invalid(), state);
        Arc::new(s)
    }

    #[test]
    fn get_returns_same_reference_until_deregistered() {
        let reg = SocketRegistry::new();
        let socket = fresh_socket(SocketState::Connected);
        let id = socket.id();
        reg.insert(socket.clone());
        reg.register(id, socket.clone());

        let got = reg.get(id).expect("should be registered");
        assert!(Arc::ptr_eq(&got, &socket));

        reg.deregister(id, &socket);
        assert!(reg.get(id).is_none());
    }

    #[test]
    fn retry_connection_handoff_overwrites_map_entry() {
        let reg = SocketRegistry::new();
        let original = fresh_socket(SocketState::RetryConnection);
        let id = original.id();
        reg.insert(original.clone());
        reg.register(id, original.clone());

        let replacement = fresh_socket(SocketState::Associated);
        reg.insert(replacement.clone());
        reg.register(id, replacement.clone());

        let got = reg.get(id).unwrap();
        assert!(Arc::ptr_eq(&got, &replacement));
        // The original is still owned by the list until it drains and is explicitly removed.
        assert_eq!(reg.list_len(), 2);
    }

    #[test]
    fn deregister_is_a_no_op_if_the_entry_was_already_handed_to_a_replacement() {
        // Mirrors the RETRY_CONNECTION handoff: a replacement socket is registered under the
        // original's id before the original's own (now stale) deregister call runs.
        let reg = SocketRegistry::new();
        let original = fresh_socket(SocketState::RetryConnection);
        let id = original.id();
        reg.insert(original.clone());
        reg.register(id, original.clone());

        let replacement = fresh_socket(SocketState::Associated);
        reg.insert(replacement.clone());
        reg.register(id, replacement.clone());

        reg.deregister(id, &original);

        let got = reg.get(id).expect("replacement's entry must survive the original's deregister");
        assert!(Arc::ptr_eq(&got, &replacement));
    }

    #[test]
    fn connected_filters_by_state() {
        let reg = SocketRegistry::new();
        let connected = fresh_socket(SocketState::Connected);
        let closing = fresh_socket(SocketState::Closing);
        reg.insert(connected.clone());
        reg.insert(closing);

        let all = reg.connected();
        assert_eq!(all.len(), 1);
        assert!(Arc::ptr_eq(&all[0], &connected));
    }

    #[test]
    fn clear_empties_both_structures() {
        let reg = SocketRegistry::new();
        let socket = fresh_socket(SocketState::Connected);
        reg.insert(socket.clone());
        reg.register(socket.id(), socket);

        let drained = reg.clear();
        assert_eq!(drained.len(), 1);
        assert_eq!(reg.list_len(), 0);
        assert_eq!(reg.map_len(), 0);
    }
}
