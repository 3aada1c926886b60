// The MIT License (MIT)

// Copyright (c) 2021 Corio Developers

// Permission is hereby granted, free of charge, to any person obtaining a copy of
// this software and associated documentation files (the "Software"), to deal in
// the Software without restriction, including without limitation the rights to
// use, copy, modify, merge, publish, distribute, sublicense, and/or sell copies of
// the Software, and to permit persons to whom the Software is furnished to do so,
// subject to the following conditions:

// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.

// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY, FITNESS
// FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR
// COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER LIABILITY, WHETHER
// IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM, OUT OF OR IN
// CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE SOFTWARE.

//! Coroutine-aware sockets.
//!
//! Thin wrappers over the raw socket calls that assume the caller is
//! inside a coroutine and suspend through [`IoEvent`] instead of
//! blocking the thread. Sockets created here are non-blocking from
//! birth.
//!
//! Errors map POSIX conventions onto `io::Result`: `Err` carries the
//! kernel errno, a stream read of 0 means the peer closed, and a
//! timeout is `Err` with `ETIMEDOUT` (`ErrorKind::TimedOut`).
//! A negative `ms` means no deadline.

use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::RawFd;

use libc::{c_int, c_void, socklen_t};

use crate::config;
use crate::io_event::IoEvent;
use crate::poller::Dir;
use crate::scheduler::Scheduler;

/// Returns a new non-blocking, close-on-exec TCP socket.
pub fn tcp_socket(ipv6: bool) -> io::Result<RawFd> {
    socket(if ipv6 { libc::AF_INET6 } else { libc::AF_INET }, libc::SOCK_STREAM, 0)
}

/// Returns a new non-blocking, close-on-exec UDP socket.
pub fn udp_socket(ipv6: bool) -> io::Result<RawFd> {
    socket(if ipv6 { libc::AF_INET6 } else { libc::AF_INET }, libc::SOCK_DGRAM, 0)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn socket(domain: c_int, ty: c_int, proto: c_int) -> io::Result<RawFd> {
    let fd = unsafe { libc::socket(domain, ty | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC, proto) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn socket(domain: c_int, ty: c_int, proto: c_int) -> io::Result<RawFd> {
    let fd = unsafe { libc::socket(domain, ty, proto) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    set_nonblock(fd)?;
    set_cloexec(fd)?;
    Ok(fd)
}

pub fn bind(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
    let (storage, len) = to_sockaddr(addr);
    let r = unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) };
    if r != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn listen(fd: RawFd, backlog: c_int) -> io::Result<()> {
    let r = unsafe { libc::listen(fd, backlog) };
    if r != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Accept one connection, suspending until a peer arrives. The new
/// socket is non-blocking and close-on-exec.
pub fn accept(fd: RawFd) -> io::Result<(RawFd, SocketAddr)> {
    assert!(Scheduler::current().is_some(), "sock::accept must be called in a coroutine");
    let mut ev = IoEvent::new(fd, Dir::Read);

    loop {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
        let connfd = raw_accept(fd, &mut storage, &mut len);
        if connfd >= 0 {
            let peer = from_sockaddr(&storage)
                .unwrap_or_else(|| SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)));
            return Ok((connfd, peer));
        }

        let err = io::Error::last_os_error();
        match err.raw_os_error().unwrap_or(0) {
            e if e == libc::EWOULDBLOCK || e == libc::EAGAIN => ev.wait(-1)?,
            e if e == libc::EINTR => {}
            _ => return Err(err),
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn raw_accept(fd: RawFd, storage: &mut libc::sockaddr_storage, len: &mut socklen_t) -> RawFd {
    unsafe {
        libc::accept4(
            fd,
            storage as *mut _ as *mut libc::sockaddr,
            len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn raw_accept(fd: RawFd, storage: &mut libc::sockaddr_storage, len: &mut socklen_t) -> RawFd {
    let connfd = unsafe { libc::accept(fd, storage as *mut _ as *mut libc::sockaddr, len) };
    if connfd >= 0 {
        let _ = set_nonblock(connfd);
        let _ = set_cloexec(connfd);
    }
    connfd
}

/// Connect with an optional deadline. On timeout the error carries
/// `ETIMEDOUT`; on asynchronous failure the error carries `SO_ERROR`.
pub fn connect(fd: RawFd, addr: &SocketAddr, ms: i64) -> io::Result<()> {
    assert!(Scheduler::current().is_some(), "sock::connect must be called in a coroutine");
    let (storage, len) = to_sockaddr(addr);

    loop {
        let r = unsafe { libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len) };
        if r == 0 {
            return Ok(());
        }

        let err = io::Error::last_os_error();
        match err.raw_os_error().unwrap_or(0) {
            e if e == libc::EINPROGRESS => {
                let mut ev = IoEvent::new(fd, Dir::Write);
                ev.wait(ms)?;

                let mut so_err: c_int = 0;
                let mut so_len = mem::size_of::<c_int>() as socklen_t;
                let r = unsafe {
                    libc::getsockopt(
                        fd,
                        libc::SOL_SOCKET,
                        libc::SO_ERROR,
                        &mut so_err as *mut _ as *mut c_void,
                        &mut so_len,
                    )
                };
                if r != 0 {
                    return Err(io::Error::last_os_error());
                }
                if so_err == 0 {
                    return Ok(());
                }
                return Err(io::Error::from_raw_os_error(so_err));
            }
            e if e == libc::EINTR => {}
            _ => return Err(err),
        }
    }
}

/// Receive once. `Ok(0)` means the peer closed an orderly stream.
pub fn recv(fd: RawFd, buf: &mut [u8], ms: i64) -> io::Result<usize> {
    assert!(Scheduler::current().is_some(), "sock::recv must be called in a coroutine");
    let mut ev = IoEvent::new(fd, Dir::Read);

    loop {
        let r = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut c_void, buf.len(), 0) };
        if r >= 0 {
            return Ok(r as usize);
        }
        retry_or_wait(&mut ev, ms)?;
    }
}

fn recvn_chunk(fd: RawFd, buf: &mut [u8], ms: i64) -> io::Result<usize> {
    let n = buf.len();
    let mut pos = 0;
    let mut ev = IoEvent::new(fd, Dir::Read);

    loop {
        let r = unsafe {
            libc::recv(fd, buf[pos..].as_mut_ptr() as *mut c_void, n - pos, 0)
        };
        if r > 0 {
            pos += r as usize;
            if pos == n {
                return Ok(n);
            }
        } else if r == 0 {
            return Ok(0);
        } else {
            retry_or_wait(&mut ev, ms)?;
        }
    }
}

/// Receive exactly `buf.len()` bytes, or `Ok(0)` if the peer closed
/// first. Large requests are split into `tcp_max_recv_size` chunks to
/// bound the grain of each event wait.
pub fn recvn(fd: RawFd, buf: &mut [u8], ms: i64) -> io::Result<usize> {
    assert!(Scheduler::current().is_some(), "sock::recvn must be called in a coroutine");
    let max = config::get().tcp_max_recv_size;
    let n = buf.len();
    let mut pos = 0;

    while n - pos > max {
        let r = recvn_chunk(fd, &mut buf[pos..pos + max], ms)?;
        if r != max {
            return Ok(r);
        }
        pos += max;
    }
    let r = recvn_chunk(fd, &mut buf[pos..], ms)?;
    Ok(if r != n - pos { r } else { n })
}

pub fn recvfrom(fd: RawFd, buf: &mut [u8], ms: i64) -> io::Result<(usize, Option<SocketAddr>)> {
    assert!(Scheduler::current().is_some(), "sock::recvfrom must be called in a coroutine");
    let mut ev = IoEvent::new(fd, Dir::Read);

    loop {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
        let r = unsafe {
            libc::recvfrom(
                fd,
                buf.as_mut_ptr() as *mut c_void,
                buf.len(),
                0,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        };
        if r >= 0 {
            return Ok((r as usize, from_sockaddr(&storage)));
        }
        retry_or_wait(&mut ev, ms)?;
    }
}

fn send_chunk(fd: RawFd, buf: &[u8], ms: i64) -> io::Result<usize> {
    let n = buf.len();
    let mut pos = 0;
    let mut ev = IoEvent::new(fd, Dir::Write);

    loop {
        let r = unsafe { libc::send(fd, buf[pos..].as_ptr() as *const c_void, n - pos, 0) };
        if r >= 0 {
            pos += r as usize;
            if pos == n {
                return Ok(n);
            }
        } else {
            retry_or_wait(&mut ev, ms)?;
        }
    }
}

/// Send the whole buffer, split into `tcp_max_send_size` chunks.
pub fn send(fd: RawFd, buf: &[u8], ms: i64) -> io::Result<usize> {
    assert!(Scheduler::current().is_some(), "sock::send must be called in a coroutine");
    let max = config::get().tcp_max_send_size;
    let n = buf.len();
    let mut pos = 0;

    while n - pos > max {
        send_chunk(fd, &buf[pos..pos + max], ms)?;
        pos += max;
    }
    send_chunk(fd, &buf[pos..], ms)?;
    Ok(n)
}

pub fn sendto(fd: RawFd, buf: &[u8], addr: &SocketAddr, ms: i64) -> io::Result<usize> {
    assert!(Scheduler::current().is_some(), "sock::sendto must be called in a coroutine");
    let (storage, len) = to_sockaddr(addr);
    let mut ev = IoEvent::new(fd, Dir::Write);

    loop {
        let r = unsafe {
            libc::sendto(
                fd,
                buf.as_ptr() as *const c_void,
                buf.len(),
                0,
                &storage as *const _ as *const libc::sockaddr,
                len,
            )
        };
        if r >= 0 {
            return Ok(r as usize);
        }
        retry_or_wait(&mut ev, ms)?;
    }
}

/// Close a coroutine-managed socket. Any registered events and hook
/// state for the fd are dropped first; `ms > 0` lingers that long
/// before the real close.
pub fn close(fd: RawFd, ms: u32) -> io::Result<()> {
    let sched = Scheduler::current().expect("sock::close must be called in a coroutine");
    sched.del_event(fd);
    sched.erase_hook_info(fd);
    if ms > 0 {
        sched.sleep(ms);
    }
    loop {
        let r = unsafe { libc::close(fd) };
        if r == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(err);
        }
    }
}

/// Shut down one or both directions: `'r'`, `'w'` or `'b'`. Events for
/// the closed direction are dropped; a full shutdown also drops the
/// fd's hook state.
pub fn shutdown(fd: RawFd, how: char) -> io::Result<()> {
    let sched = Scheduler::current().expect("sock::shutdown must be called in a coroutine");
    let how = match how {
        'r' => {
            sched.del_event_dir(fd, Dir::Read);
            libc::SHUT_RD
        }
        'w' => {
            sched.del_event_dir(fd, Dir::Write);
            libc::SHUT_WR
        }
        _ => {
            sched.del_event(fd);
            sched.erase_hook_info(fd);
            libc::SHUT_RDWR
        }
    };
    let r = unsafe { libc::shutdown(fd, how) };
    if r != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn local_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
    let r = unsafe { libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) };
    if r != 0 {
        return Err(io::Error::last_os_error());
    }
    from_sockaddr(&storage)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "unsupported address family"))
}

pub fn set_reuseaddr(fd: RawFd) -> io::Result<()> {
    setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)
}

pub fn set_tcp_nodelay(fd: RawFd) -> io::Result<()> {
    setsockopt_int(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, 1)
}

pub fn set_tcp_keepalive(fd: RawFd) -> io::Result<()> {
    setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, 1)
}

/// Message for an errno value; timeouts print as "timedout".
pub fn strerror(err: i32) -> String {
    if err == libc::ETIMEDOUT {
        return "timedout".to_string();
    }
    io::Error::from_raw_os_error(err).to_string()
}

fn setsockopt_int(fd: RawFd, level: c_int, opt: c_int, val: c_int) -> io::Result<()> {
    let r = unsafe {
        libc::setsockopt(
            fd,
            level,
            opt,
            &val as *const _ as *const c_void,
            mem::size_of::<c_int>() as socklen_t,
        )
    };
    if r != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub(crate) fn set_nonblock(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let r = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if r != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub(crate) fn set_cloexec(fd: RawFd) -> io::Result<()> {
    let r = unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) };
    if r != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn retry_or_wait(ev: &mut IoEvent, ms: i64) -> io::Result<()> {
    let err = io::Error::last_os_error();
    match err.raw_os_error().unwrap_or(0) {
        e if e == libc::EWOULDBLOCK || e == libc::EAGAIN => ev.wait(ms),
        e if e == libc::EINTR => Ok(()),
        _ => Err(err),
    }
}

// ---- sockaddr conversion ----------------------------------------------

pub(crate) fn to_sockaddr(addr: &SocketAddr) -> (libc::sockaddr_storage, socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    match addr {
        SocketAddr::V4(a) => {
            let sin = &mut storage as *mut _ as *mut libc::sockaddr_in;
            unsafe {
                (*sin).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sin).sin_port = a.port().to_be();
                (*sin).sin_addr = libc::in_addr { s_addr: u32::from_ne_bytes(a.ip().octets()) };
            }
            (storage, mem::size_of::<libc::sockaddr_in>() as socklen_t)
        }
        SocketAddr::V6(a) => {
            let sin6 = &mut storage as *mut _ as *mut libc::sockaddr_in6;
            unsafe {
                (*sin6).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sin6).sin6_port = a.port().to_be();
                (*sin6).sin6_flowinfo = a.flowinfo();
                (*sin6).sin6_addr = libc::in6_addr { s6_addr: a.ip().octets() };
                (*sin6).sin6_scope_id = a.scope_id();
            }
            (storage, mem::size_of::<libc::sockaddr_in6>() as socklen_t)
        }
    }
}

pub(crate) fn from_sockaddr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Some(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

#[cfg(test)]
mod test {
    use super::{from_sockaddr, strerror, to_sockaddr};

    #[test]
    fn test_sockaddr_roundtrip_v4() {
        let addr = "127.0.0.1:8080".parse().unwrap();
        let (storage, _) = to_sockaddr(&addr);
        assert_eq!(from_sockaddr(&storage), Some(addr));
    }

    #[test]
    fn test_sockaddr_roundtrip_v6() {
        let addr = "[::1]:9090".parse().unwrap();
        let (storage, _) = to_sockaddr(&addr);
        assert_eq!(from_sockaddr(&storage), Some(addr));
    }

    #[test]
    fn test_strerror_timeout() {
        assert_eq!(strerror(libc::ETIMEDOUT), "timedout");
    }
}
