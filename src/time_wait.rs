//! `TIME_WAIT` value selection and storage.
//!
//! The interval is read from a single host parameter
//! (`SYSTEM\CurrentControlSet\Services\Tcpip\Parameters\TcpTimedWaitDelay`) and is process-wide:
//! every [`crate::Manager`] in the process shares the same clamped value, and doubling it on a
//! retryable connect failure affects every manager. This mirrors the original implementation's
//! static `TimeWaitValue` field and is documented here rather than hidden, per the design notes.

use crate::config::{DEFAULT_TIME_WAIT_VALUE_MS, MAX_TIME_WAIT_VALUE_MS, MIN_TIME_WAIT_VALUE_MS};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{event, Level};

/// Abstraction over "read a named integer parameter; may report not-found", so the registry
/// dependency can be swapped out in tests without touching the real host configuration.
pub trait TimeWaitSource: Send + Sync {
    /// Returns the raw millisecond value from the host parameter store, or `Ok(None)` if the
    /// parameter is absent. Any other failure is reported as `Err`.
    fn read_raw(&self) -> crate::error::Result<Option<u32>>;
}

/// Reads `TcpTimedWaitDelay` from the real Windows registry.
#[derive(Debug, Default)]
pub struct RegistryTimeWaitSource;

const TIME_WAIT_REG_KEY: &str = "SYSTEM\\CurrentControlSet\\Services\\Tcpip\\Parameters";
const TIME_WAIT_REG_VALUE: &str = "TcpTimedWaitDelay";

impl TimeWaitSource for RegistryTimeWaitSource {
    fn read_raw(&self) -> crate::error::Result<Option<u32>> {
        use windows::core::{HSTRING, PCWSTR};
        use windows::Win32::Foundation::ERROR_FILE_NOT_FOUND;
        use windows::Win32::System::Registry::{
            RegGetValueW, HKEY_LOCAL_MACHINE, RRF_RT_REG_DWORD,
        };

        let subkey = HSTRING::from(TIME_WAIT_REG_KEY);
        let value = HSTRING::from(TIME_WAIT_REG_VALUE);
        let mut data: u32 = 0;
        let mut data_len: u32 = std::mem::size_of::<u32>() as u32;

        // SAFETY: `data` is large enough for a REG_DWORD value (enforced by `RRF_RT_REG_DWORD`)
        // and `data_len` is set to its exact size.
        let result = unsafe {
            RegGetValueW(
                HKEY_LOCAL_MACHINE,
                &subkey,
                PCWSTR(value.as_ptr()),
                RRF_RT_REG_DWORD,
                None,
                Some(&mut data as *mut u32 as *mut _),
                Some(&mut data_len),
            )
        };

        if result.is_ok() {
            Ok(Some(data))
        } else if result == ERROR_FILE_NOT_FOUND {
            Ok(None)
        } else {
            Err(crate::error::Error::Registry(result.to_hresult().into()))
        }
    }
}

/// A fixed, in-memory stand-in for the registry. Used by tests that need to exercise
/// expiry/retry logic without depending on real elapsed time or a real registry value.
#[derive(Debug, Clone, Copy)]
pub struct FixedTimeWaitSource(pub Option<u32>);

impl TimeWaitSource for FixedTimeWaitSource {
    fn read_raw(&self) -> crate::error::Result<Option<u32>> {
        Ok(self.0)
    }
}

/// The process-wide, clamped `TimeWaitValue`, in milliseconds.
///
/// Shared between every [`crate::Manager`] in the process, matching the original's static
/// field. `0` is used as a not-yet-selected sentinel.
static TIME_WAIT_VALUE_MS: AtomicU32 = AtomicU32::new(0);

/// Selects `TimeWaitValue` from `source` if it has not already been selected in this process,
/// then returns the current value. Safe to call from multiple managers; only the first call
/// actually touches `source`.
pub(crate) fn ensure_selected(source: &dyn TimeWaitSource) -> u32 {
    let current = TIME_WAIT_VALUE_MS.load(Ordering::Acquire);
    if current != 0 {
        return current;
    }

    let selected = match source.read_raw() {
        Ok(Some(raw)) => raw.clamp(MIN_TIME_WAIT_VALUE_MS, MAX_TIME_WAIT_VALUE_MS),
        Ok(None) => DEFAULT_TIME_WAIT_VALUE_MS,
        Err(e) => {
            event!(
                Level::ERROR,
                message = "failed to read TcpTimedWaitDelay, failing safe to the maximum",
                error = %e
            );
            MAX_TIME_WAIT_VALUE_MS
        }
    };

    // If another thread beat us to it, keep whichever value landed first - both are valid
    // clamped selections and the value must stay stable once observed.
    match TIME_WAIT_VALUE_MS.compare_exchange(
        0,
        selected,
        Ordering::AcqRel,
        Ordering::Acquire,
    ) {
        Ok(_) => selected,
        Err(existing) => existing,
    }
}

/// Returns the current `TimeWaitValue` without attempting selection. Panics if called before
/// any manager has selected one - callers within this crate always call `ensure_selected` first.
pub(crate) fn current() -> u32 {
    let v = TIME_WAIT_VALUE_MS.load(Ordering::Acquire);
    debug_assert_ne!(v, 0, "TimeWaitValue read before selection");
    v
}

/// Doubles `TimeWaitValue`, capped at [`MAX_TIME_WAIT_VALUE_MS`], and returns the new value.
/// Called on a connect retry triggered by an address-in-use error.
pub(crate) fn double() -> u32 {
    let mut observed = TIME_WAIT_VALUE_MS.load(Ordering::Acquire);
    loop {
        let doubled = observed.saturating_mul(2).min(MAX_TIME_WAIT_VALUE_MS);
        match TIME_WAIT_VALUE_MS.compare_exchange_weak(
            observed,
            doubled,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                event!(Level::DEBUG, message = "TimeWaitValue doubled", new_value_ms = doubled);
                return doubled;
            }
            Err(actual) => observed = actual,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn reset() {
        TIME_WAIT_VALUE_MS.store(0, Ordering::SeqCst);
    }

    #[test]
    #[serial]
    fn selects_default_when_absent() {
        reset();
        let v = ensure_selected(&FixedTimeWaitSource(None));
        assert_eq!(v, DEFAULT_TIME_WAIT_VALUE_MS);
    }

    #[test]
    #[serial]
    fn clamps_low_values() {
        reset();
        let v = ensure_selected(&FixedTimeWaitSource(Some(1)));
        assert_eq!(v, MIN_TIME_WAIT_VALUE_MS);
    }

    #[test]
    #[serial]
    fn clamps_high_values() {
        reset();
        let v = ensure_selected(&FixedTimeWaitSource(Some(u32::MAX)));
        assert_eq!(v, MAX_TIME_WAIT_VALUE_MS);
    }

    #[test]
    #[serial]
    fn double_caps_at_max() {
        reset();
        ensure_selected(&FixedTimeWaitSource(Some(200_000)));
        assert_eq!(double(), MAX_TIME_WAIT_VALUE_MS);
    }

    #[test]
    #[serial]
    fn selection_is_idempotent() {
        reset();
        let first = ensure_selected(&FixedTimeWaitSource(Some(50_000)));
        let second = ensure_selected(&FixedTimeWaitSource(Some(99_000)));
        assert_eq!(first, second);
    }
}
