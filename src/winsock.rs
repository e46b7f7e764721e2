//! Low-level Winsock plumbing shared by every manager in the process: library init/teardown and
//! the one-time discovery of the `ConnectEx`/`DisconnectEx` extension functions.
//!
//! `AcceptEx` is statically importable from `mswsock.lib` and so is used directly from
//! `windows::Win32::Networking::WinSock` wherever it is needed. `ConnectEx` and `DisconnectEx`
//! are not part of the stable, statically-linkable Winsock surface - discovering them requires
//! `WSAIoctl(SIO_GET_EXTENSION_FUNCTION_POINTER)` against a throwaway socket, exactly as the
//! original implementation's `InitAsyncSocketFunc` does.

use crate::error::{Error, Result};
use once_cell::sync::OnceCell;
use std::ffi::c_void;
use std::mem;
use std::net::Ipv4Addr;
use windows::core::BOOL;
use windows::Win32::Networking::WinSock::{
    closesocket, WSACleanup, WSAGetLastError, WSAIoctl, WSASocketW, WSAStartup, AF_INET, IN_ADDR,
    IPPROTO_TCP, SIO_GET_EXTENSION_FUNCTION_POINTER, SOCKADDR, SOCKET, SOCKET_ERROR, SOCK_STREAM,
    WSADATA, WSAID_CONNECTEX, WSAID_DISCONNECTEX, WSA_FLAG_OVERLAPPED,
};
use windows::Win32::System::IO::OVERLAPPED;

/// https://learn.microsoft.com/en-us/windows/win32/api/mswsock/nc-mswsock-lpfn_connectex
pub(crate) type ConnectExFn = unsafe extern "system" fn(
    s: SOCKET,
    name: *const SOCKADDR,
    namelen: i32,
    lpsendbuffer: *const c_void,
    dwsenddatalength: u32,
    lpdwbytessent: *mut u32,
    lpoverlapped: *mut OVERLAPPED,
) -> BOOL;

/// https://learn.microsoft.com/en-us/windows/win32/api/mswsock/nc-mswsock-lpfn_disconnectex
pub(crate) type DisconnectExFn =
    unsafe extern "system" fn(s: SOCKET, lpoverlapped: *mut OVERLAPPED, dwflags: u32, reserved: u32) -> BOOL;

pub(crate) struct ExtensionFunctions {
    pub(crate) connect_ex: ConnectExFn,
    pub(crate) disconnect_ex: DisconnectExFn,
}

static EXTENSION_FUNCTIONS: OnceCell<ExtensionFunctions> = OnceCell::new();

/// Initializes the Winsock library for the calling process. Pairs with one [`wsa_cleanup`] call;
/// the OS reference-counts `WSAStartup`/`WSACleanup` pairs itself, so every [`crate::Manager`]
/// simply calls one of each across its own lifetime.
pub(crate) fn wsa_startup() -> Result<()> {
    let mut data = WSADATA::default();
    // SAFETY: `data` is valid to write into for the duration of the call.
    let code = unsafe { WSAStartup(0x0202, &mut data) };
    if code != 0 {
        return Err(Error::winsock(
            "WSAStartup",
            windows::core::Error::from_hresult(windows::core::HRESULT::from_win32(code as u32)),
        ));
    }
    Ok(())
}

pub(crate) fn wsa_cleanup() {
    // SAFETY: no preconditions beyond having called `wsa_startup` first, which every caller has.
    if unsafe { WSACleanup() } == SOCKET_ERROR {
        tracing::event!(
            tracing::Level::ERROR,
            message = "WSACleanup failed",
            error = %last_error()
        );
    }
}

/// Returns the last Winsock error as a `windows::core::Error`, for wrapping into [`Error`].
pub(crate) fn last_error() -> windows::core::Error {
    // SAFETY: no preconditions.
    let code = unsafe { WSAGetLastError() };
    windows::core::Error::from_hresult(windows::core::HRESULT::from_win32(code.0 as u32))
}

/// Wraps a Winsock call that returns `SOCKET_ERROR` on failure, converting to our `Error` type
/// and labeling it with `call` for logging.
pub(crate) fn to_result(call: &'static str, rc: i32) -> Result<()> {
    if rc == SOCKET_ERROR {
        Err(Error::winsock(call, last_error()))
    } else {
        Ok(())
    }
}

/// Discovers and caches `ConnectEx`/`DisconnectEx` using a throwaway socket. Safe to call from
/// multiple managers concurrently; only the first call touches the network stack.
pub(crate) fn extension_functions() -> Result<&'static ExtensionFunctions> {
    if let Some(cached) = EXTENSION_FUNCTIONS.get() {
        return Ok(cached);
    }

    // SAFETY: we close the dummy socket unconditionally below, whatever the outcome.
    let dummy = unsafe { WSASocketW(AF_INET.0 as i32, SOCK_STREAM.0, IPPROTO_TCP.0, None, 0, WSA_FLAG_OVERLAPPED) }
        .map_err(|e| Error::winsock("WSASocketW", e))?;

    let resolved = (|| -> Result<ExtensionFunctions> {
        Ok(ExtensionFunctions {
            connect_ex: unsafe { resolve::<ConnectExFn>(dummy, WSAID_CONNECTEX)? },
            disconnect_ex: unsafe { resolve::<DisconnectExFn>(dummy, WSAID_DISCONNECTEX)? },
        })
    })();

    // SAFETY: `dummy` is a valid handle we created above and no longer need.
    unsafe {
        closesocket(dummy);
    }

    let functions = resolved?;
    Ok(EXTENSION_FUNCTIONS.get_or_init(|| functions))
}

/// # Safety
/// `sock` must be a valid, open socket. `F` must match the ABI the OS returns for `guid`.
unsafe fn resolve<F: Copy>(sock: SOCKET, guid: windows::core::GUID) -> Result<F> {
    let mut result: *mut c_void = std::ptr::null_mut();
    let mut bytes_returned: u32 = 0;

    let rc = WSAIoctl(
        sock,
        SIO_GET_EXTENSION_FUNCTION_POINTER,
        Some(&guid as *const _ as *const _),
        mem::size_of_val(&guid) as u32,
        Some(&mut result as *mut *mut c_void as *mut _),
        mem::size_of_val(&result) as u32,
        &mut bytes_returned,
        None,
        None,
    );

    to_result("WSAIoctl(SIO_GET_EXTENSION_FUNCTION_POINTER)", rc)?;

    // SAFETY: caller guarantees `F` matches the ABI the OS handed back for this GUID.
    Ok(mem::transmute_copy::<*mut c_void, F>(&result))
}

/// Converts a dotted-quad `Ipv4Addr` into the network-byte-order `IN_ADDR` Winsock structures
/// expect, used when building `SOCKADDR_IN` values for bind/connect.
pub(crate) fn ipv4_to_in_addr(addr: Ipv4Addr) -> IN_ADDR {
    IN_ADDR {
        S_un: windows::Win32::Networking::WinSock::IN_ADDR_0 {
            S_addr: u32::from_ne_bytes(addr.octets()),
        },
    }
}
