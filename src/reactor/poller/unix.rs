//! Thin wrappers over the socket syscalls the reactor relies on.
//!
//! Every descriptor handed out here is non-blocking; callers treat
//! `WouldBlock` as "retry on the next readiness event".

use libc::{
    accept, bind, c_int, close, connect, fcntl, getsockname, getsockopt, listen, read, recvfrom,
    sendto, setsockopt, shutdown, sockaddr, sockaddr_in, sockaddr_in6, sockaddr_storage, socket,
    socklen_t, write, AF_INET, AF_INET6, F_GETFL, F_SETFL, O_NONBLOCK, SHUT_RD, SHUT_RDWR,
    SHUT_WR, SOCK_DGRAM, SOCK_STREAM, SOL_SOCKET, SO_ERROR, SO_REUSEADDR,
};
use std::net::{Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::RawFd;
use std::{io, mem};

fn cvt(rc: c_int) -> io::Result<()> {
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn cvt_len(rc: isize) -> io::Result<usize> {
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc as usize)
    }
}

/// Reads from a non-blocking descriptor. `Ok(0)` is end of stream.
pub(crate) fn sys_read(fd: RawFd, buffer: &mut [u8]) -> io::Result<usize> {
    cvt_len(unsafe { read(fd, buffer.as_mut_ptr() as *mut _, buffer.len()) })
}

/// Writes to a non-blocking descriptor.
pub(crate) fn sys_write(fd: RawFd, buffer: &[u8]) -> io::Result<usize> {
    cvt_len(unsafe { write(fd, buffer.as_ptr() as *const _, buffer.len()) })
}

pub(crate) fn sys_close(fd: RawFd) {
    unsafe { close(fd) };
}

/// Sets a descriptor to non-blocking mode.
pub(crate) fn sys_set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { fcntl(fd, F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    cvt(unsafe { fcntl(fd, F_SETFL, flags | O_NONBLOCK) })
}

/// Creates a non-blocking TCP socket for the address family of `addr`.
pub(crate) fn sys_stream_socket(addr: &SocketAddr) -> io::Result<RawFd> {
    sys_socket(addr, SOCK_STREAM)
}

/// Creates a non-blocking UDP socket for the address family of `addr`.
pub(crate) fn sys_dgram_socket(addr: &SocketAddr) -> io::Result<RawFd> {
    sys_socket(addr, SOCK_DGRAM)
}

fn sys_socket(addr: &SocketAddr, kind: c_int) -> io::Result<RawFd> {
    let domain = match addr {
        SocketAddr::V4(_) => AF_INET,
        SocketAddr::V6(_) => AF_INET6,
    };

    let fd = unsafe { socket(domain, kind, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    if let Err(e) = sys_set_nonblocking(fd) {
        sys_close(fd);
        return Err(e);
    }

    Ok(fd)
}

pub(crate) fn sys_bind(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
    let (storage, len) = socketaddr_to_storage(addr);
    cvt(unsafe { bind(fd, &storage as *const _ as *const sockaddr, len) })
}

pub(crate) fn sys_listen(fd: RawFd, backlog: i32) -> io::Result<()> {
    cvt(unsafe { listen(fd, backlog) })
}

/// Accepts one pending connection; the client socket comes back
/// non-blocking.
pub(crate) fn sys_accept(fd: RawFd) -> io::Result<(RawFd, SocketAddr)> {
    let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<sockaddr_storage>() as socklen_t;

    let client = unsafe { accept(fd, &mut storage as *mut _ as *mut sockaddr, &mut len) };
    if client < 0 {
        return Err(io::Error::last_os_error());
    }

    if let Err(e) = sys_set_nonblocking(client) {
        sys_close(client);
        return Err(e);
    }

    let addr = sockaddr_storage_to_socketaddr(&storage)?;
    Ok((client, addr))
}

/// The local address a socket is bound to.
pub(crate) fn sys_sockname(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<sockaddr_storage>() as socklen_t;

    cvt(unsafe { getsockname(fd, &mut storage as *mut _ as *mut sockaddr, &mut len) })?;
    sockaddr_storage_to_socketaddr(&storage)
}

/// Initiates a non-blocking connect. Returns `Ok(true)` when the
/// connection completed immediately, `Ok(false)` when it is in progress
/// and write readiness will signal the outcome.
pub(crate) fn sys_connect(fd: RawFd, addr: &SocketAddr) -> io::Result<bool> {
    let (storage, len) = socketaddr_to_storage(addr);

    let rc = unsafe { connect(fd, &storage as *const _ as *const sockaddr, len) };
    if rc == 0 {
        return Ok(true);
    }

    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EINPROGRESS) => Ok(false),
        _ => Err(err),
    }
}

/// Fetches and clears the pending `SO_ERROR` of a socket, reporting the
/// outcome of an in-progress connect.
pub(crate) fn sys_take_socket_error(fd: RawFd) -> io::Result<()> {
    let mut error: c_int = 0;
    let mut len = mem::size_of::<c_int>() as socklen_t;

    cvt(unsafe {
        getsockopt(
            fd,
            SOL_SOCKET,
            SO_ERROR,
            &mut error as *mut _ as *mut _,
            &mut len,
        )
    })?;

    if error == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(error))
    }
}

pub(crate) fn sys_shutdown(fd: RawFd, how: Shutdown) -> io::Result<()> {
    let how = match how {
        Shutdown::Read => SHUT_RD,
        Shutdown::Write => SHUT_WR,
        Shutdown::Both => SHUT_RDWR,
    };
    cvt(unsafe { shutdown(fd, how) })
}

pub(crate) fn sys_set_reuseaddr(fd: RawFd) -> io::Result<()> {
    let yes: c_int = 1;
    cvt(unsafe {
        setsockopt(
            fd,
            SOL_SOCKET,
            SO_REUSEADDR,
            &yes as *const _ as *const _,
            mem::size_of::<c_int>() as socklen_t,
        )
    })
}

/// Receives one datagram, returning its length and source address.
pub(crate) fn sys_recvfrom(fd: RawFd, buffer: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
    let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<sockaddr_storage>() as socklen_t;

    let n = cvt_len(unsafe {
        recvfrom(
            fd,
            buffer.as_mut_ptr() as *mut _,
            buffer.len(),
            0,
            &mut storage as *mut _ as *mut sockaddr,
            &mut len,
        )
    })?;

    let addr = sockaddr_storage_to_socketaddr(&storage)?;
    Ok((n, addr))
}

/// Sends one datagram to `addr`.
pub(crate) fn sys_sendto(fd: RawFd, buffer: &[u8], addr: &SocketAddr) -> io::Result<usize> {
    let (storage, len) = socketaddr_to_storage(addr);
    cvt_len(unsafe {
        sendto(
            fd,
            buffer.as_ptr() as *const _,
            buffer.len(),
            0,
            &storage as *const _ as *const sockaddr,
            len,
        )
    })
}

fn sockaddr_storage_to_socketaddr(storage: &sockaddr_storage) -> io::Result<SocketAddr> {
    match storage.ss_family as c_int {
        AF_INET => {
            let addr = unsafe { &*(storage as *const _ as *const sockaddr_in) };
            let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
            let port = u16::from_be(addr.sin_port);
            Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
        }

        AF_INET6 => {
            let addr = unsafe { &*(storage as *const _ as *const sockaddr_in6) };
            let ip = Ipv6Addr::from(addr.sin6_addr.s6_addr);
            let port = u16::from_be(addr.sin6_port);
            Ok(SocketAddr::V6(SocketAddrV6::new(
                ip,
                port,
                addr.sin6_flowinfo,
                addr.sin6_scope_id,
            )))
        }

        _ => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "unsupported address family",
        )),
    }
}

fn socketaddr_to_storage(addr: &SocketAddr) -> (sockaddr_storage, socklen_t) {
    let mut storage: sockaddr_storage = unsafe { mem::zeroed() };

    match addr {
        SocketAddr::V4(v4) => {
            let sa = unsafe { &mut *(&mut storage as *mut _ as *mut sockaddr_in) };
            sa.sin_family = AF_INET as _;
            sa.sin_port = v4.port().to_be();
            sa.sin_addr.s_addr = u32::from(*v4.ip()).to_be();
            (storage, mem::size_of::<sockaddr_in>() as socklen_t)
        }

        SocketAddr::V6(v6) => {
            let sa = unsafe { &mut *(&mut storage as *mut _ as *mut sockaddr_in6) };
            sa.sin6_family = AF_INET6 as _;
            sa.sin6_port = v6.port().to_be();
            sa.sin6_addr.s6_addr = v6.ip().octets();
            sa.sin6_flowinfo = v6.flowinfo();
            sa.sin6_scope_id = v6.scope_id();
            (storage, mem::size_of::<sockaddr_in6>() as socklen_t)
        }
    }
}
