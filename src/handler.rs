//! The application-level receive extension point.

use crate::handle::SocketHandle;

/// Supplied by embedding code at manager construction time. Called once per successful `Read`
/// completion.
///
/// Implementations must assume concurrent invocation across different sockets (reentrant,
/// thread-hostile only with respect to shared state the implementation itself introduces) and
/// must never block on manager-internal state - the dispatcher calls this with no lock held, but
/// a slow or panicking handler still stalls the worker thread that called it.
pub trait ConnectionHandler: Send + Sync {
    /// `data` is exactly the bytes delivered by one `Read` completion, in arrival order for a
    /// given socket (the manager never posts a second `Read` before the first completes, so
    /// ordering is preserved as long as a single call does not itself race a later one - which it
    /// cannot, since only one `Read` is ever outstanding per socket).
    fn on_receive(&self, data: &[u8], socket: SocketHandle) -> i32;
}

/// A [`ConnectionHandler`] that ignores all data. Useful for CLIENT-mode managers that only
/// send, or as a test fixture.
pub struct NullHandler;

impl ConnectionHandler for NullHandler {
    fn on_receive(&self, _data: &[u8], _socket: SocketHandle) -> i32 {
        0
    }
}
