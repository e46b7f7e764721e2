//! A short-lived, by-id reference to a socket, handed to [`crate::ConnectionHandler`] and
//! returned from the public lookup queries.

use crate::manager::ManagerInner;
use crate::socket::{SocketId, SocketState};
use std::sync::{Arc, Weak};

/// A borrow of one socket, keyed by id. Per the design notes, this never holds an owning
/// reference to the `Socket` itself - every method re-resolves through the manager's registry,
/// so a handle outliving its socket's teardown simply finds nothing rather than keeping stale
/// state alive.
#[derive(Clone)]
pub struct SocketHandle {
    pub(crate) manager: Weak<ManagerInner>,
    pub(crate) id: SocketId,
}

impl SocketHandle {
    pub(crate) fn new(manager: &Arc<ManagerInner>, id: SocketId) -> Self {
        Self {
            manager: Arc::downgrade(manager),
            id,
        }
    }

    pub fn id(&self) -> SocketId {
        self.id
    }

    /// Requests that this socket begin a graceful close, as if the peer had half-closed the
    /// connection. This is the only externally reachable `ChangeSocketState` transition - the
    /// manager façade does not let handler code jump straight to any other state.
    pub fn close(&self) {
        if let Some(manager) = self.manager.upgrade() {
            manager.request_close(self.id);
        }
    }

    /// Sends `data` on this socket. Equivalent to calling `Manager::send_data` with this
    /// handle's id.
    pub fn send(&self, data: &[u8]) -> bool {
        match self.manager.upgrade() {
            Some(manager) => manager.send_data(self.id, data),
            None => false,
        }
    }

    /// Current lifecycle state, or `None` if the socket is no longer registered (it has already
    /// torn down, or the manager itself has shut down).
    pub fn state(&self) -> Option<SocketState> {
        let manager = self.manager.upgrade()?;
        manager.registry.get(self.id).map(|s| s.state())
    }
}
