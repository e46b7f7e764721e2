//! Tunables carried over from the original implementation. Kept as plain constants rather than
//! a config struct because none of them are meant to vary at runtime except `TimeWaitValue`,
//! which has its own dedicated type (see [`crate::time_wait`]).

/// Size of every I/O buffer's inline payload. Buffers are recycled, never resized.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Number of worker threads spawned per logical CPU.
pub const THREADS_PER_PROC: usize = 1;

/// Maximum number of disconnected-but-reusable sockets held in the reuse queue.
pub const MAX_UNUSED_SOCKET: usize = 30;

/// Number of recently-released buffers retained by the buffer pool before fresh allocation.
pub const DEFAULT_BUFFER_POOL_CAP: usize = 250;

/// `TimeWaitValue` used when the host parameter is absent from the registry.
pub const DEFAULT_TIME_WAIT_VALUE_MS: u32 = 120_000;

/// Lower clamp for `TimeWaitValue`.
pub const MIN_TIME_WAIT_VALUE_MS: u32 = 30_000;

/// Upper clamp for `TimeWaitValue`, and the value used as a fail-safe on unexpected registry
/// errors (better to wait too long than to risk an address-in-use storm).
pub const MAX_TIME_WAIT_VALUE_MS: u32 = 300_000;

/// Fallback `max-pending-bytes-sent` used when an ISB query fails.
pub const DEFAULT_MAX_PENDING_BYTE_SENT: i64 = 8192;

/// Multiplier applied to the ideal-send-backlog value to derive `max-pending-bytes-sent`. `0`
/// disables ISB tracking entirely (no notify is armed, and the backpressure threshold stays
/// fixed at [`DEFAULT_MAX_PENDING_BYTE_SENT`]).
pub const DEFAULT_ISB_FACTOR: i64 = 4;

/// Backlog passed to `listen()` for a listener that expects only a handful of peers.
pub const SMALL_BACKLOG: i32 = 5;
