//! Recyclable fixed-size I/O buffers, one per in-flight overlapped operation.

use crate::config::{DEFAULT_BUFFER_POOL_CAP, DEFAULT_BUFFER_SIZE};
use parking_lot::Mutex;
use std::pin::Pin;
use windows::Win32::System::IO::OVERLAPPED;

/// Tags the asynchronous operation a [`Buffer`] is currently posted for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Operation {
    Read,
    Write,
    Connect,
    Accept,
    Disconnect,
    IsbChange,
    End,
}

/// One in-flight (or pool-idle) asynchronous I/O operation.
///
/// `overlapped` must remain the first field: the completion port gives us back a raw
/// `*mut OVERLAPPED` and we recover the owning `Buffer` by reinterpreting that pointer, which is
/// only sound because of `repr(C)` field order. This is the same technique used throughout the
/// Windows IOCP ecosystem (e.g. `miow`/`mio`) to avoid a separate lookup table for in-flight
/// operations.
#[repr(C)]
pub(crate) struct Buffer {
    overlapped: OVERLAPPED,
    payload: [u8; DEFAULT_BUFFER_SIZE],
    payload_len: u32,
    operation: Operation,
}

impl Buffer {
    pub(crate) const SIZE: usize = DEFAULT_BUFFER_SIZE;

    fn new(operation: Operation) -> Self {
        Self {
            overlapped: OVERLAPPED::default(),
            payload: [0; DEFAULT_BUFFER_SIZE],
            payload_len: 0,
            operation,
        }
    }

    pub(crate) fn operation(&self) -> Operation {
        self.operation
    }

    pub(crate) fn set_operation(&mut self, op: Operation) {
        self.operation = op;
    }

    pub(crate) fn payload_mut(&mut self) -> &mut [u8; DEFAULT_BUFFER_SIZE] {
        &mut self.payload
    }

    pub(crate) fn payload(&self) -> &[u8] {
        &self.payload[..self.payload_len as usize]
    }

    pub(crate) fn payload_len(&self) -> u32 {
        self.payload_len
    }

    pub(crate) fn set_payload_len(&mut self, len: u32) {
        debug_assert!((len as usize) <= DEFAULT_BUFFER_SIZE);
        self.payload_len = len;
    }

    /// Copies `data` into the payload, truncating to [`Buffer::SIZE`]. Returns the number of
    /// bytes actually copied so the caller can track how much of the original input remains.
    pub(crate) fn fill(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(DEFAULT_BUFFER_SIZE);
        self.payload[..n].copy_from_slice(&data[..n]);
        self.payload_len = n as u32;
        n
    }

    pub(crate) fn overlapped_mut(&mut self) -> *mut OVERLAPPED {
        &mut self.overlapped as *mut OVERLAPPED
    }

    pub(crate) fn reset_overlapped(&mut self) {
        self.overlapped = OVERLAPPED::default();
    }

    /// Reclaims a `Buffer` from the raw overlapped pointer handed back by the completion port.
    ///
    /// # Safety
    /// `overlapped` must be the address of the `overlapped` field of a `Buffer` that was
    /// previously handed to the OS via [`Buffer::into_raw`] and has not already been reclaimed.
    pub(crate) unsafe fn from_overlapped(overlapped: *mut OVERLAPPED) -> Pin<Box<Buffer>> {
        Pin::new_unchecked(Box::from_raw(overlapped as *mut Buffer))
    }

    /// Leaks a pinned `Buffer` into a raw pointer suitable for passing to a Win32 overlapped
    /// I/O call. Must be paired with exactly one later call to `from_overlapped` (or
    /// `BufferPool::delete` after re-wrapping), enforced by the dispatcher's single-owner
    /// discipline rather than by the type system.
    pub(crate) fn into_raw(buf: Pin<Box<Buffer>>) -> *mut Buffer {
        // SAFETY: we never move out of the box again, we only hand its address to the OS and
        // later reconstruct the same Box<Buffer> from that same address.
        unsafe { Box::into_raw(Pin::into_inner_unchecked(buf)) }
    }
}

/// A pool of recyclable [`Buffer`]s. Holds up to `cap` recently-released buffers and serves them
/// back out LIFO (most-recently-released first) to maximize cache locality on a hot I/O path.
pub(crate) struct BufferPool {
    recycled: Mutex<Vec<Pin<Box<Buffer>>>>,
    cap: usize,
}

impl BufferPool {
    pub(crate) fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_POOL_CAP)
    }

    pub(crate) fn with_capacity(cap: usize) -> Self {
        Self {
            recycled: Mutex::new(Vec::with_capacity(cap)),
            cap,
        }
    }

    /// Returns a `Buffer` ready to be posted for `operation`, reusing a recycled one if any is
    /// available, else allocating fresh.
    pub(crate) fn create(&self, operation: Operation) -> Pin<Box<Buffer>> {
        let recycled = {
            let mut guard = self.recycled.lock();
            guard.pop()
        };

        match recycled {
            Some(mut buf) => {
                // SAFETY: `Buffer` has no self-referential pointers into itself beyond the
                // `overlapped` struct, which we are about to overwrite anyway. Resetting these
                // plain fields does not move the buffer's address.
                let b = unsafe { buf.as_mut().get_unchecked_mut() };
                b.reset_overlapped();
                b.payload_len = 0;
                b.operation = operation;
                buf
            }
            None => Box::pin(Buffer::new(operation)),
        }
    }

    /// Returns a `Buffer` to the pool for later reuse, dropping it if the pool is already at
    /// capacity.
    pub(crate) fn delete(&self, buf: Pin<Box<Buffer>>) {
        let mut guard = self.recycled.lock();
        if guard.len() < self.cap {
            guard.push(buf);
        }
    }

    #[cfg(test)]
    pub(crate) fn recycled_len(&self) -> usize {
        self.recycled.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_delete_is_recycled() {
        let pool = BufferPool::with_capacity(4);
        let buf = pool.create(Operation::Read);
        assert_eq!(pool.recycled_len(), 0);
        pool.delete(buf);
        assert_eq!(pool.recycled_len(), 1);
    }

    #[test]
    fn recycling_respects_cap() {
        let pool = BufferPool::with_capacity(1);
        let a = pool.create(Operation::Read);
        let b = pool.create(Operation::Write);
        pool.delete(a);
        pool.delete(b);
        assert_eq!(pool.recycled_len(), 1);
    }

    #[test]
    fn reused_buffer_has_operation_and_state_reset() {
        let pool = BufferPool::with_capacity(4);
        let mut buf = pool.create(Operation::Read);
        unsafe {
            buf.as_mut().get_unchecked_mut().fill(b"hello");
        }
        pool.delete(buf);

        let reused = pool.create(Operation::Write);
        assert_eq!(reused.operation(), Operation::Write);
        assert_eq!(reused.payload_len(), 0);
    }

    #[test]
    fn raw_roundtrip_recovers_buffer() {
        let pool = BufferPool::with_capacity(4);
        let buf = pool.create(Operation::Connect);
        let raw = Buffer::into_raw(buf);
        let overlapped_ptr = unsafe { (*raw).overlapped_mut() };
        let recovered = unsafe { Buffer::from_overlapped(overlapped_ptr) };
        assert_eq!(recovered.operation(), Operation::Connect);
    }
}
