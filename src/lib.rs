//! A completion-port based TCP connection manager.
//!
//! A [`Manager`] multiplexes an arbitrary number of TCP connections over a fixed pool of worker
//! threads, driven by a Windows I/O completion port. A process may host multiple managers, each
//! either a [`ManagerKind::Client`] (initiates connections via `connect`) or a
//! [`ManagerKind::Server`] (accepts connections on one listening port via `listen`).
//!
//! The crate does not reassemble message boundaries - bytes arrive at [`ConnectionHandler`] in
//! the order they were read from the socket, as an opaque stream. Framing, TLS and cross-manager
//! coordination are all out of scope; see `DESIGN.md` for the full list of non-goals.

mod buffer;
mod completion_port;
mod config;
mod dispatcher;
mod error;
mod handle;
mod handler;
mod manager;
mod ops;
mod registry;
mod reuse_queue;
mod socket;
mod time_wait;
mod winsock;

pub use error::{Error, Result};
pub use handle::SocketHandle;
pub use handler::{ConnectionHandler, NullHandler};
pub use manager::{Manager, ManagerKind};
pub use socket::{AddressFamily, SocketId, SocketState};
pub use time_wait::{FixedTimeWaitSource, RegistryTimeWaitSource, TimeWaitSource};

pub use config::{
    DEFAULT_BUFFER_POOL_CAP, DEFAULT_BUFFER_SIZE, DEFAULT_ISB_FACTOR,
    DEFAULT_MAX_PENDING_BYTE_SENT, DEFAULT_TIME_WAIT_VALUE_MS, MAX_TIME_WAIT_VALUE_MS,
    MAX_UNUSED_SOCKET, MIN_TIME_WAIT_VALUE_MS, THREADS_PER_PROC,
};
