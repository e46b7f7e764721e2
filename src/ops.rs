//! Socket creation/bind/listen helpers and the `Post*` functions that start (or repost) one
//! overlapped operation against a [`Socket`].
//!
//! `CompletionPort::bind` arms `FILE_SKIP_SET_EVENT_ON_HANDLE` on every handle, which means a
//! `Post*` call that completes *synchronously* (the Win32 call returns success immediately,
//! rather than `ERROR_IO_PENDING`) will never produce a completion packet - unlike the original
//! implementation, which leaves the default notification mode and so observes even synchronous
//! completions via `GetQueuedCompletionStatus`. Every `Post*` function here therefore returns a
//! [`PostOutcome`] so the caller can drive the same handling code inline for an `Immediate`
//! result that it would otherwise run from the dispatcher's completion loop.

use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::socket::{RawSocket, Socket};
use crate::winsock;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::pin::Pin;
use windows::Win32::Foundation::HANDLE;
use windows::Win32::Networking::WinSock::{
    bind, listen, setsockopt, AcceptEx, WSAIoctl, WSARecv, WSASend, WSASocketW, AF_INET,
    IPPROTO_TCP, SIO_IDEAL_SEND_BACKLOG_CHANGE, SIO_IDEAL_SEND_BACKLOG_QUERY, SOCKADDR,
    SOCKADDR_IN, SOCKET, SOCKET_ERROR, SOCK_STREAM, SOL_SOCKET, SO_EXCLUSIVEADDRUSE,
    SO_REUSE_UNICASTPORT, SO_SNDBUF, SO_UPDATE_ACCEPT_CONTEXT, SO_UPDATE_CONNECT_CONTEXT,
    WSABUF, WSA_FLAG_OVERLAPPED, WSA_IO_PENDING,
};
use windows::Win32::System::IO::{GetOverlappedResult, OVERLAPPED};

/// Outcome of posting one overlapped operation.
pub(crate) enum PostOutcome {
    /// Queued with the OS; a completion packet will arrive later. The OS now owns the buffer.
    Pending,
    /// Completed before the call returned (no completion packet will ever arrive, because
    /// `FILE_SKIP_SET_EVENT_ON_HANDLE` is set on every bound handle). Carries the byte count a
    /// real completion would have, and hands the buffer straight back to the caller.
    Immediate { bytes: u32, buf: Pin<Box<Buffer>> },
}

/// Creates a fresh overlapped-capable TCP/IPv4 socket. Not yet bound to anything.
pub(crate) fn create_socket() -> Result<RawSocket> {
    // SAFETY: no preconditions beyond `wsa_startup` having run, which every manager ensures.
    let sock = unsafe {
        WSASocketW(
            AF_INET.0 as i32,
            SOCK_STREAM.0,
            IPPROTO_TCP.0,
            None,
            0,
            WSA_FLAG_OVERLAPPED,
        )
    }
    .map_err(|e| Error::winsock("WSASocketW", e))?;
    Ok(RawSocket::new(sock))
}

fn make_sockaddr(addr: Ipv4Addr, port: u16) -> SOCKADDR_IN {
    SOCKADDR_IN {
        sin_family: AF_INET,
        sin_port: port.to_be(),
        sin_addr: winsock::ipv4_to_in_addr(addr),
        sin_zero: [0; 8],
    }
}

fn set_bool_opt(sock: SOCKET, level: i32, option: i32, value: bool) -> Result<()> {
    let raw: i32 = value as i32;
    // SAFETY: `raw` lives for the duration of the call and matches a 4-byte boolean option.
    let rc = unsafe {
        setsockopt(
            sock,
            level,
            option,
            Some(std::slice::from_raw_parts(&raw as *const i32 as *const u8, 4)),
        )
    };
    winsock::to_result("setsockopt", rc)
}

/// Binds to an ephemeral local port with the two reuse-enabling options the façade's
/// `ConnectToNewSocket` path requires, so a fresh outbound connection does not collide with one
/// still cooling in `TIME_WAIT`.
pub(crate) fn bind_ephemeral(sock: SOCKET) -> Result<()> {
    set_bool_opt(sock, SOL_SOCKET.0 as i32, SO_REUSE_UNICASTPORT as i32, true)?;
    set_bool_opt(sock, SOL_SOCKET.0 as i32, SO_EXCLUSIVEADDRUSE as i32, true)?;

    let addr = make_sockaddr(Ipv4Addr::UNSPECIFIED, 0);
    // SAFETY: `addr` is a valid, fully-initialized `SOCKADDR_IN` for the duration of the call.
    let rc = unsafe {
        bind(
            sock,
            &addr as *const SOCKADDR_IN as *const SOCKADDR,
            std::mem::size_of::<SOCKADDR_IN>() as i32,
        )
    };
    winsock::to_result("bind", rc)
}

/// Binds on all interfaces at `port` and starts listening with the given backlog.
pub(crate) fn bind_and_listen(sock: SOCKET, port: u16, backlog: i32) -> Result<()> {
    let addr = make_sockaddr(Ipv4Addr::UNSPECIFIED, port);
    // SAFETY: `addr` is a valid, fully-initialized `SOCKADDR_IN` for the duration of the call.
    let rc = unsafe {
        bind(
            sock,
            &addr as *const SOCKADDR_IN as *const SOCKADDR,
            std::mem::size_of::<SOCKADDR_IN>() as i32,
        )
    };
    winsock::to_result("bind", rc)?;

    // SAFETY: no preconditions beyond `sock` being a valid, bound socket.
    let rc = unsafe { listen(sock, backlog) };
    winsock::to_result("listen", rc)
}

/// Fetches the byte count for an operation that completed synchronously. Only valid to call
/// immediately after the originating call reported immediate success.
fn immediate_bytes(sock: SOCKET, overlapped: *mut OVERLAPPED) -> Result<u32> {
    let mut bytes: u32 = 0;
    // SAFETY: `overlapped` is the same block just used for the completed call; `sock`'s handle
    // is still open. `bWait = false` is correct since the operation has already finished.
    unsafe {
        GetOverlappedResult(HANDLE(sock.0 as _), overlapped, &mut bytes, false)
            .map_err(|e| Error::winsock("GetOverlappedResult", e))?;
    }
    Ok(bytes)
}

type PostResult = std::result::Result<PostOutcome, (Error, Pin<Box<Buffer>>)>;

/// Classifies the return code of a `WSARecv`/`WSASend`-shaped call (`0` on immediate success,
/// `SOCKET_ERROR` otherwise, with `WSA_IO_PENDING` meaning "queued"), consuming `buf` into
/// whichever outcome applies: leaked to the OS on `Pending`, handed back otherwise.
fn classify_io_rc(call: &'static str, rc: i32, sock: SOCKET, overlapped: *mut OVERLAPPED, buf: Pin<Box<Buffer>>) -> PostResult {
    if rc == 0 {
        match immediate_bytes(sock, overlapped) {
            Ok(bytes) => Ok(PostOutcome::Immediate { bytes, buf }),
            Err(e) => Err((e, buf)),
        }
    } else if rc == SOCKET_ERROR {
        let err = winsock::last_error();
        if err.code().0 as u32 == WSA_IO_PENDING.0 as u32 {
            let _ = Buffer::into_raw(buf);
            Ok(PostOutcome::Pending)
        } else {
            Err((Error::winsock(call, err), buf))
        }
    } else {
        Err((Error::winsock(call, winsock::last_error()), buf))
    }
}

/// Classifies the `BOOL` return of an extension-function-shaped call (`AcceptEx`, `ConnectEx`,
/// `DisconnectEx`), with the same buffer-ownership handoff as [`classify_io_rc`].
fn classify_bool_call(call: &'static str, ok: bool, sock: SOCKET, overlapped: *mut OVERLAPPED, buf: Pin<Box<Buffer>>) -> PostResult {
    if ok {
        match immediate_bytes(sock, overlapped) {
            Ok(bytes) => Ok(PostOutcome::Immediate { bytes, buf }),
            Err(e) => Err((e, buf)),
        }
    } else {
        let err = winsock::last_error();
        if err.code().0 as u32 == WSA_IO_PENDING.0 as u32 {
            let _ = Buffer::into_raw(buf);
            Ok(PostOutcome::Pending)
        } else {
            Err((Error::winsock(call, err), buf))
        }
    }
}

/// Posts a receive. On success the OS (or, for an `Immediate` outcome, the caller) owns `buf`
/// until its completion is handled; on failure `buf` is handed back for recycling.
pub(crate) fn post_recv(socket: &Socket, mut buf: Pin<Box<Buffer>>) -> PostResult {
    let sock = socket.raw_handle();
    let overlapped = unsafe { buf.as_mut().get_unchecked_mut() }.overlapped_mut();
    let wsabuf = {
        let b = unsafe { buf.as_mut().get_unchecked_mut() };
        WSABUF {
            len: Buffer::SIZE as u32,
            buf: windows::core::PSTR(b.payload_mut().as_mut_ptr()),
        }
    };
    let mut flags: u32 = 0;

    // SAFETY: `wsabuf` and `overlapped` both point into `buf`, which outlives this call (we only
    // release it to the OS/pool after the outcome is known).
    let rc = unsafe {
        WSARecv(
            sock,
            std::slice::from_ref(&wsabuf),
            None,
            &mut flags,
            Some(overlapped),
            None,
        )
    };

    classify_io_rc("WSARecv", rc, sock, overlapped, buf)
}

/// Posts a write of `buf`'s current payload (`payload_len` bytes).
pub(crate) fn post_send(socket: &Socket, mut buf: Pin<Box<Buffer>>) -> PostResult {
    let sock = socket.raw_handle();
    let overlapped = unsafe { buf.as_mut().get_unchecked_mut() }.overlapped_mut();
    let wsabuf = {
        let b = unsafe { buf.as_mut().get_unchecked_mut() };
        let len = b.payload_len();
        WSABUF {
            len,
            buf: windows::core::PSTR(b.payload_mut().as_mut_ptr()),
        }
    };

    // SAFETY: see `post_recv`.
    let rc = unsafe {
        WSASend(
            sock,
            std::slice::from_ref(&wsabuf),
            None,
            0,
            Some(overlapped),
            None,
        )
    };

    classify_io_rc("WSASend", rc, sock, overlapped, buf)
}

/// Posts a connect via the discovered `ConnectEx` extension function. `sock` must already be
/// bound (`bind_ephemeral`) before calling this.
pub(crate) fn post_connect(socket: &Socket, target: SocketAddrV4, mut buf: Pin<Box<Buffer>>) -> PostResult {
    let connect_ex = match winsock::extension_functions() {
        Ok(f) => f.connect_ex,
        Err(e) => return Err((e, buf)),
    };
    let sock = socket.raw_handle();
    let overlapped = unsafe { buf.as_mut().get_unchecked_mut() }.overlapped_mut();
    let addr = make_sockaddr(*target.ip(), target.port());

    // SAFETY: `addr` is valid for the duration of the call; `overlapped` points into `buf`,
    // which we only release after the outcome is known.
    let ok = unsafe {
        connect_ex(
            sock,
            &addr as *const SOCKADDR_IN as *const SOCKADDR,
            std::mem::size_of::<SOCKADDR_IN>() as i32,
            std::ptr::null(),
            0,
            std::ptr::null_mut(),
            overlapped,
        )
    };

    classify_bool_call("ConnectEx", ok.as_bool(), sock, overlapped, buf)
}

/// Posts an accept on `listen_sock` into the freshly created `accept_sock`. The buffer's payload
/// doubles as `AcceptEx`'s output buffer (local+remote address storage); `dwReceiveDataLength` is
/// zero, matching the original - accept completes as soon as a connection arrives, without
/// waiting for data.
pub(crate) fn post_accept(listen_sock: SOCKET, accept_sock: SOCKET, mut buf: Pin<Box<Buffer>>) -> PostResult {
    let overlapped = unsafe { buf.as_mut().get_unchecked_mut() }.overlapped_mut();
    let addr_len = (std::mem::size_of::<SOCKADDR_IN>() + 16) as u32;
    let output_buffer = unsafe { buf.as_mut().get_unchecked_mut() }.payload_mut().as_mut_ptr();
    let mut bytes_received: u32 = 0;

    // SAFETY: `output_buffer` has room for two address-length blocks (`Buffer::SIZE` = 4096 is
    // vastly larger than `2 * addr_len`); `overlapped` points into `buf`.
    let ok = unsafe {
        AcceptEx(
            listen_sock,
            accept_sock,
            output_buffer as *mut _,
            0,
            addr_len,
            addr_len,
            &mut bytes_received,
            overlapped,
        )
    };

    classify_bool_call("AcceptEx", ok.as_bool(), listen_sock, overlapped, buf)
}

/// Posts a reuse-capable graceful disconnect via the discovered `DisconnectEx` extension
/// function, preserving the handle (`TF_REUSE_SOCKET`) for a later `ConnectEx`/`AcceptEx`.
pub(crate) fn post_disconnect(socket: &Socket, mut buf: Pin<Box<Buffer>>) -> PostResult {
    const TF_REUSE_SOCKET: u32 = 0x02;

    let disconnect_ex = match winsock::extension_functions() {
        Ok(f) => f.disconnect_ex,
        Err(e) => return Err((e, buf)),
    };
    let sock = socket.raw_handle();
    let overlapped = unsafe { buf.as_mut().get_unchecked_mut() }.overlapped_mut();

    // SAFETY: `overlapped` points into `buf`, released only after the outcome is known.
    let ok = unsafe { disconnect_ex(sock, overlapped, TF_REUSE_SOCKET, 0) };

    classify_bool_call("DisconnectEx", ok.as_bool(), sock, overlapped, buf)
}

/// Arms the next ideal-send-backlog-change notification (`SIO_IDEAL_SEND_BACKLOG_CHANGE`),
/// mirroring the original's `idealsendbacklognotify`.
pub(crate) fn post_isb_notify(socket: &Socket, mut buf: Pin<Box<Buffer>>) -> PostResult {
    let sock = socket.raw_handle();
    let overlapped = unsafe { buf.as_mut().get_unchecked_mut() }.overlapped_mut();
    let mut bytes_returned: u32 = 0;

    // SAFETY: no input/output buffers beyond `overlapped`, which points into `buf`.
    let rc = unsafe {
        WSAIoctl(
            sock,
            SIO_IDEAL_SEND_BACKLOG_CHANGE,
            None,
            0,
            None,
            0,
            &mut bytes_returned,
            Some(overlapped),
            None,
        )
    };

    classify_io_rc("WSAIoctl(SIO_IDEAL_SEND_BACKLOG_CHANGE)", rc, sock, overlapped, buf)
}

/// Synchronously queries the current ideal-send-backlog value, mirroring the original's
/// `idealsendbacklogquery`. Used by the `ISBChange` completion handler, not posted as an
/// overlapped operation itself.
pub(crate) fn query_isb(sock: SOCKET) -> Result<u32> {
    let mut value: u32 = 0;
    let mut bytes_returned: u32 = 0;

    // SAFETY: `value` is a valid local output buffer of the exact size the ioctl writes.
    let rc = unsafe {
        WSAIoctl(
            sock,
            SIO_IDEAL_SEND_BACKLOG_QUERY,
            None,
            0,
            Some(&mut value as *mut u32 as *mut _),
            std::mem::size_of::<u32>() as u32,
            &mut bytes_returned,
            None,
            None,
        )
    };
    winsock::to_result("WSAIoctl(SIO_IDEAL_SEND_BACKLOG_QUERY)", rc)?;
    Ok(value)
}

/// Sets `SO_SNDBUF` to `value`, as the `ISBChange` handler does after every query.
pub(crate) fn set_send_buffer_size(sock: SOCKET, value: u32) -> Result<()> {
    // SAFETY: `value` lives for the duration of the call.
    let rc = unsafe {
        setsockopt(
            sock,
            SOL_SOCKET.0 as i32,
            SO_SNDBUF as i32,
            Some(std::slice::from_raw_parts(&value as *const u32 as *const u8, 4)),
        )
    };
    winsock::to_result("setsockopt(SO_SNDBUF)", rc)
}

/// Applies `SO_UPDATE_CONNECT_CONTEXT` after a successful `ConnectEx` completion, enabling
/// `getpeername`/`getsockname`/`shutdown` on the now-connected socket.
pub(crate) fn update_connect_context(sock: SOCKET) -> Result<()> {
    // SAFETY: no associated data is required for this option.
    let rc = unsafe { setsockopt(sock, SOL_SOCKET.0 as i32, SO_UPDATE_CONNECT_CONTEXT as i32, None) };
    winsock::to_result("setsockopt(SO_UPDATE_CONNECT_CONTEXT)", rc)
}

/// Applies `SO_UPDATE_ACCEPT_CONTEXT` after a successful `AcceptEx` completion, inheriting the
/// listening socket's properties onto the newly accepted one.
pub(crate) fn update_accept_context(accepted: SOCKET, listener: SOCKET) -> Result<()> {
    let listener_bytes = listener.0.to_ne_bytes();
    // SAFETY: `listener_bytes` lives for the duration of the call and is exactly
    // `sizeof(SOCKET)` long, as the option expects.
    let rc = unsafe {
        setsockopt(
            accepted,
            SOL_SOCKET.0 as i32,
            SO_UPDATE_ACCEPT_CONTEXT as i32,
            Some(&listener_bytes),
        )
    };
    winsock::to_result("setsockopt(SO_UPDATE_ACCEPT_CONTEXT)", rc)
}
