//! Listening socket setup. Plain blocking syscalls, used once at startup.

use std::io;
use std::net::TcpListener;
use std::os::fd::{FromRawFd, OwnedFd};

use crate::error::ResourceError;

/// Bind a non-blocking IPv4 listener on `0.0.0.0:port` with `backlog`.
pub fn bind_listener(port: u16, backlog: u32) -> Result<TcpListener, ResourceError> {
    let fd = unsafe {
        libc::socket(
            libc::AF_INET,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd < 0 {
        return Err(ResourceError::Socket(io::Error::last_os_error()));
    }
    // Safety: socket() returned a fresh descriptor; OwnedFd closes it on
    // every early return below.
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
    let raw = std::os::fd::AsRawFd::as_raw_fd(&fd);

    let opt: libc::c_int = 1;
    let ret = unsafe {
        libc::setsockopt(
            raw,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &opt as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(ResourceError::Socket(io::Error::last_os_error()));
    }

    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_addr.s_addr = libc::INADDR_ANY.to_be();
    addr.sin_port = port.to_be();

    let ret = unsafe {
        libc::bind(
            raw,
            &addr as *const libc::sockaddr_in as *const libc::sockaddr,
            std::mem::size_of_val(&addr) as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(ResourceError::Bind { port, source: io::Error::last_os_error() });
    }

    let backlog = backlog.min(libc::c_int::MAX as u32) as libc::c_int;
    if unsafe { libc::listen(raw, backlog) } < 0 {
        return Err(ResourceError::Listen(io::Error::last_os_error()));
    }

    Ok(TcpListener::from(fd))
}
