//! The shared I/O completion port every worker thread dequeues from.
//!
//! Unlike `folo`'s per-worker-thread port (deliberately `!Send`/`!Sync` there, because each
//! async worker owns exactly one), this manager's concurrency model puts a *single* port behind
//! a fixed pool of OS threads, all calling `GetQueuedCompletionStatus` concurrently - that is the
//! whole point of IOCP, and the handle itself is safe to share and call from multiple threads.

use crate::error::{Error, Result};
use windows::Win32::Foundation::{CloseHandle, HANDLE, INVALID_HANDLE_VALUE};
use windows::Win32::Storage::FileSystem::SetFileCompletionNotificationModes;
use windows::Win32::System::WindowsProgramming::FILE_SKIP_SET_EVENT_ON_HANDLE;
use windows::Win32::System::IO::{CreateIoCompletionPort, GetQueuedCompletionStatus, OVERLAPPED, PostQueuedCompletionStatus};

pub(crate) struct CompletionPort {
    handle: HANDLE,
}

/// One dequeued completion packet.
pub(crate) struct Completion {
    pub(crate) bytes_transferred: u32,
    pub(crate) completion_key: usize,
    pub(crate) overlapped: *mut OVERLAPPED,
    /// `Some` only when `GetQueuedCompletionStatus` itself reported failure; the error path
    /// (§7) handles this distinctly from a successful completion carrying application-level
    /// failure information.
    pub(crate) dequeue_error: Option<windows::core::Error>,
}

// SAFETY: `HANDLE` here names a completion port, which the Win32 API explicitly documents as
// safe to use concurrently from multiple threads - that is IOCP's entire purpose.
unsafe impl Send for CompletionPort {}
unsafe impl Sync for CompletionPort {}

impl CompletionPort {
    /// Creates a fresh completion port with no handles bound yet.
    pub(crate) fn new() -> Result<Self> {
        // SAFETY: passing INVALID_HANDLE_VALUE/None/0 creates a standalone port, per the Win32
        // contract for `CreateIoCompletionPort`.
        let handle = unsafe { CreateIoCompletionPort(INVALID_HANDLE_VALUE, None, 0, 0) }
            .map_err(|e| Error::winsock("CreateIoCompletionPort", e))?;
        Ok(Self { handle })
    }

    /// Associates `target` with this port, tagging every completion it produces with
    /// `completion_key` (we pass the socket's address so the dispatcher can recover the owning
    /// `Socket` without a side lookup table).
    pub(crate) fn bind(&self, target: HANDLE, completion_key: usize) -> Result<()> {
        // SAFETY: `target` must be a valid, overlapped-capable handle; callers uphold this.
        unsafe { CreateIoCompletionPort(target, Some(self.handle), completion_key, 0) }
            .map_err(|e| Error::winsock("CreateIoCompletionPort(bind)", e))?;

        // Skip posting a completion packet when an operation on this handle completes
        // synchronously - we still observe the result inline in that case. See
        // https://devblogs.microsoft.com/oldnewthing/20200221-00/?p=103466/
        // SAFETY: `target` is the same valid handle just bound above.
        unsafe { SetFileCompletionNotificationModes(target, FILE_SKIP_SET_EVENT_ON_HANDLE as u8) }
            .map_err(|e| Error::winsock("SetFileCompletionNotificationModes", e))?;

        Ok(())
    }

    /// Blocks until a completion (or a dequeue failure) is available.
    pub(crate) fn dequeue(&self) -> Completion {
        let mut bytes_transferred: u32 = 0;
        let mut completion_key: usize = 0;
        let mut overlapped: *mut OVERLAPPED = std::ptr::null_mut();

        // SAFETY: all output pointers are valid locals; INFINITE timeout is intentional - the
        // only suspension point in the whole worker loop, per the concurrency model.
        let ok = unsafe {
            GetQueuedCompletionStatus(
                self.handle,
                &mut bytes_transferred,
                &mut completion_key,
                &mut overlapped,
                windows::Win32::System::Threading::INFINITE,
            )
        };

        let dequeue_error = if ok.is_err() {
            Some(windows::core::Error::from_win32())
        } else {
            None
        };

        Completion {
            bytes_transferred,
            completion_key,
            overlapped,
            dequeue_error,
        }
    }

    /// Posts a synthetic completion with a null overlapped pointer is not distinguishable from a
    /// real one downstream, so shutdown instead posts a completion whose `Buffer::operation` is
    /// `End` - see `Manager::shutdown`. This helper wraps the underlying syscall.
    pub(crate) fn post(&self, overlapped: *mut OVERLAPPED) -> Result<()> {
        // SAFETY: `overlapped` must point at a live `Buffer`'s overlapped field; callers uphold
        // this (it is always an `End`-tagged buffer freshly taken from the pool).
        unsafe { PostQueuedCompletionStatus(self.handle, 0, 0, Some(overlapped)) }
            .map_err(|e| Error::winsock("PostQueuedCompletionStatus", e))?;
        Ok(())
    }
}

impl Drop for CompletionPort {
    fn drop(&mut self) {
        // SAFETY: `handle` is owned exclusively by this `CompletionPort` and not used again.
        unsafe {
            let _ = CloseHandle(self.handle);
        }
    }
}
