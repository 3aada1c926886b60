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

//! Coroutine-aware stand-ins for the blocking POSIX calls.
//!
//! Called outside a coroutine, every function here behaves exactly
//! like its libc counterpart. Called inside a coroutine on a hookable
//! fd, the blocking call is replaced by a non-blocking call plus a
//! scheduler-mediated suspension, with the fd's own
//! `SO_SNDTIMEO`/`SO_RCVTIMEO` driving the deadline.
//!
//! An fd becomes hookable the first time it is seen inside a
//! coroutine: it must not already be non-blocking, it must be a
//! socket, and the relevant timeout must be set (a zero timeout means
//! the caller really wants blocking semantics). Hookable fds are
//! switched to `O_NONBLOCK` and their timeouts cached per scheduler.

use std::io;
use std::mem;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::unix::io::RawFd;
use std::ptr;
use std::sync::OnceLock;
use std::time::Duration;

use libc::{c_int, c_void, socklen_t};

use crate::io_event::IoEvent;
use crate::poller::Dir;
use crate::scheduler::Scheduler;
use crate::sock;
use crate::sync::Mutex;
use crate::timer::now_ms;

/// Cached per-(scheduler, fd) hook state. A timeout of -1 means the
/// direction has no deadline: the coroutine suspends until ready,
/// which is what a blocking call looks like from the outside.
#[derive(Debug, Clone, Copy)]
pub(crate) struct HookInfo {
    hookable: bool,
    send_timeout: i64,
    recv_timeout: i64,
}

impl HookInfo {
    const NOT_HOOKABLE: HookInfo =
        HookInfo { hookable: false, send_timeout: -1, recv_timeout: -1 };

    pub(crate) fn hookable(&self) -> bool {
        self.hookable
    }

    fn timeout(&self, dir: Dir) -> i64 {
        match dir {
            Dir::Read => self.recv_timeout,
            Dir::Write => self.send_timeout,
        }
    }
}

/// `SO_RCVTIMEO`/`SO_SNDTIMEO` in ms; `None` when the fd is not a
/// socket (or not valid at all).
fn get_timeout(fd: RawFd, opt: c_int) -> Option<i64> {
    let mut tv: libc::timeval = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::timeval>() as socklen_t;
    let r = unsafe {
        libc::getsockopt(fd, libc::SOL_SOCKET, opt, &mut tv as *mut _ as *mut c_void, &mut len)
    };
    if r != 0 {
        return None;
    }
    Some(tv.tv_sec as i64 * 1000 + tv.tv_usec as i64 / 1000)
}

fn get_hook_info(sched: &Scheduler, fd: RawFd, dir: Dir) -> HookInfo {
    if let Some(hi) = sched.hook_tab_get(fd) {
        return hi;
    }

    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 || (flags & libc::O_NONBLOCK) != 0 {
        sched.hook_tab_set(fd, HookInfo::NOT_HOOKABLE);
        return HookInfo::NOT_HOOKABLE;
    }

    let recv_to = get_timeout(fd, libc::SO_RCVTIMEO);
    let send_to = get_timeout(fd, libc::SO_SNDTIMEO);
    let (recv_to, send_to) = match (recv_to, send_to) {
        (Some(r), Some(s)) => (r, s),
        _ => {
            // not a socket
            sched.hook_tab_set(fd, HookInfo::NOT_HOOKABLE);
            return HookInfo::NOT_HOOKABLE;
        }
    };

    let relevant = match dir {
        Dir::Read => recv_to,
        Dir::Write => send_to,
    };
    if relevant == 0 {
        sched.hook_tab_set(fd, HookInfo::NOT_HOOKABLE);
        return HookInfo::NOT_HOOKABLE;
    }

    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } != 0 {
        sched.hook_tab_set(fd, HookInfo::NOT_HOOKABLE);
        return HookInfo::NOT_HOOKABLE;
    }

    let hi = HookInfo {
        hookable: true,
        recv_timeout: if recv_to == 0 { -1 } else { recv_to },
        send_timeout: if send_to == 0 { -1 } else { send_to },
    };
    trace!("fd {} hooked, recv timeout {} ms, send timeout {} ms", fd, hi.recv_timeout, hi.send_timeout);
    sched.hook_tab_set(fd, hi);
    hi
}

/// Non-blocking call + suspension loop shared by the data-path hooks.
fn do_hook<F>(fd: RawFd, dir: Dir, ms: i64, mut f: F) -> io::Result<usize>
where
    F: FnMut() -> libc::ssize_t,
{
    let mut ev = IoEvent::new(fd, dir);
    loop {
        let r = f();
        if r >= 0 {
            return Ok(r as usize);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error().unwrap_or(0) {
            e if e == libc::EWOULDBLOCK || e == libc::EAGAIN => ev.wait(ms)?,
            e if e == libc::EINTR => {}
            _ => return Err(err),
        }
    }
}

fn ok_or_errno(r: libc::ssize_t) -> io::Result<usize> {
    if r >= 0 {
        Ok(r as usize)
    } else {
        Err(io::Error::last_os_error())
    }
}

pub fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let raw = |fd: RawFd, buf: &mut [u8]| unsafe {
        libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len())
    };
    match Scheduler::current() {
        None => ok_or_errno(raw(fd, buf)),
        Some(sched) => {
            let hi = get_hook_info(sched, fd, Dir::Read);
            if !hi.hookable {
                return ok_or_errno(raw(fd, buf));
            }
            let tmo = hi.timeout(Dir::Read);
            do_hook(fd, Dir::Read, tmo, || raw(fd, buf))
        }
    }
}

pub fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let raw = |fd: RawFd, buf: &[u8]| unsafe {
        libc::write(fd, buf.as_ptr() as *const c_void, buf.len())
    };
    match Scheduler::current() {
        None => ok_or_errno(raw(fd, buf)),
        Some(sched) => {
            let hi = get_hook_info(sched, fd, Dir::Write);
            if !hi.hookable {
                return ok_or_errno(raw(fd, buf));
            }
            let tmo = hi.timeout(Dir::Write);
            do_hook(fd, Dir::Write, tmo, || raw(fd, buf))
        }
    }
}

pub fn readv(fd: RawFd, bufs: &mut [io::IoSliceMut<'_>]) -> io::Result<usize> {
    // IoSliceMut is ABI-compatible with iovec
    let raw = |fd: RawFd, bufs: &mut [io::IoSliceMut<'_>]| unsafe {
        libc::readv(fd, bufs.as_mut_ptr() as *mut libc::iovec, bufs.len() as c_int)
    };
    match Scheduler::current() {
        None => ok_or_errno(raw(fd, bufs)),
        Some(sched) => {
            let hi = get_hook_info(sched, fd, Dir::Read);
            if !hi.hookable {
                return ok_or_errno(raw(fd, bufs));
            }
            let tmo = hi.timeout(Dir::Read);
            do_hook(fd, Dir::Read, tmo, || raw(fd, bufs))
        }
    }
}

pub fn writev(fd: RawFd, bufs: &[io::IoSlice<'_>]) -> io::Result<usize> {
    let raw = |fd: RawFd, bufs: &[io::IoSlice<'_>]| unsafe {
        libc::writev(fd, bufs.as_ptr() as *const libc::iovec, bufs.len() as c_int)
    };
    match Scheduler::current() {
        None => ok_or_errno(raw(fd, bufs)),
        Some(sched) => {
            let hi = get_hook_info(sched, fd, Dir::Write);
            if !hi.hookable {
                return ok_or_errno(raw(fd, bufs));
            }
            let tmo = hi.timeout(Dir::Write);
            do_hook(fd, Dir::Write, tmo, || raw(fd, bufs))
        }
    }
}

pub fn recv(fd: RawFd, buf: &mut [u8], flags: c_int) -> io::Result<usize> {
    let raw = |fd: RawFd, buf: &mut [u8]| unsafe {
        libc::recv(fd, buf.as_mut_ptr() as *mut c_void, buf.len(), flags)
    };
    match Scheduler::current() {
        None => ok_or_errno(raw(fd, buf)),
        Some(sched) => {
            let hi = get_hook_info(sched, fd, Dir::Read);
            if !hi.hookable {
                return ok_or_errno(raw(fd, buf));
            }
            let tmo = hi.timeout(Dir::Read);
            do_hook(fd, Dir::Read, tmo, || raw(fd, buf))
        }
    }
}

pub fn send(fd: RawFd, buf: &[u8], flags: c_int) -> io::Result<usize> {
    let raw = |fd: RawFd, buf: &[u8]| unsafe {
        libc::send(fd, buf.as_ptr() as *const c_void, buf.len(), flags)
    };
    match Scheduler::current() {
        None => ok_or_errno(raw(fd, buf)),
        Some(sched) => {
            let hi = get_hook_info(sched, fd, Dir::Write);
            if !hi.hookable {
                return ok_or_errno(raw(fd, buf));
            }
            let tmo = hi.timeout(Dir::Write);
            do_hook(fd, Dir::Write, tmo, || raw(fd, buf))
        }
    }
}

pub fn recvfrom(fd: RawFd, buf: &mut [u8], flags: c_int) -> io::Result<(usize, Option<SocketAddr>)> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let raw = |fd: RawFd, buf: &mut [u8], storage: &mut libc::sockaddr_storage| {
        let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
        unsafe {
            libc::recvfrom(
                fd,
                buf.as_mut_ptr() as *mut c_void,
                buf.len(),
                flags,
                storage as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        }
    };
    let n = match Scheduler::current() {
        None => ok_or_errno(raw(fd, buf, &mut storage))?,
        Some(sched) => {
            let hi = get_hook_info(sched, fd, Dir::Read);
            if !hi.hookable {
                ok_or_errno(raw(fd, buf, &mut storage))?
            } else {
                let tmo = hi.timeout(Dir::Read);
                do_hook(fd, Dir::Read, tmo, || raw(fd, buf, &mut storage))?
            }
        }
    };
    Ok((n, sock::from_sockaddr(&storage)))
}

pub fn sendto(fd: RawFd, buf: &[u8], flags: c_int, addr: &SocketAddr) -> io::Result<usize> {
    let (storage, len) = sock::to_sockaddr(addr);
    let raw = |fd: RawFd, buf: &[u8]| unsafe {
        libc::sendto(
            fd,
            buf.as_ptr() as *const c_void,
            buf.len(),
            flags,
            &storage as *const _ as *const libc::sockaddr,
            len,
        )
    };
    match Scheduler::current() {
        None => ok_or_errno(raw(fd, buf)),
        Some(sched) => {
            let hi = get_hook_info(sched, fd, Dir::Write);
            if !hi.hookable {
                return ok_or_errno(raw(fd, buf));
            }
            let tmo = hi.timeout(Dir::Write);
            do_hook(fd, Dir::Write, tmo, || raw(fd, buf))
        }
    }
}

/// Connect, honoring the fd's send timeout. When the deadline set via
/// `SO_SNDTIMEO` expires, the error reads `EINPROGRESS`, which is what
/// a real non-blocking connect would report at that point.
pub fn connect(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
    let sched = match Scheduler::current() {
        None => return raw_connect(fd, addr),
        Some(s) => s,
    };
    // connect is a fresh start for the fd either way: drop whatever
    // was cached so the data path derives its own timeouts
    let hi = get_hook_info(sched, fd, Dir::Write);
    if !hi.hookable {
        let r = raw_connect(fd, addr);
        sched.erase_hook_info(fd);
        return r;
    }

    let r = sock::connect(fd, addr, hi.timeout(Dir::Write));
    sched.erase_hook_info(fd);
    match r {
        Err(ref e) if e.raw_os_error() == Some(libc::ETIMEDOUT) => {
            Err(io::Error::from_raw_os_error(libc::EINPROGRESS))
        }
        other => other,
    }
}

fn raw_connect(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
    let (storage, len) = sock::to_sockaddr(addr);
    let r = unsafe { libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len) };
    if r != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Accept, suspending instead of blocking on a hookable fd.
pub fn accept(fd: RawFd) -> io::Result<(RawFd, Option<SocketAddr>)> {
    let sched = match Scheduler::current() {
        None => return raw_accept(fd),
        Some(s) => s,
    };
    let hi = get_hook_info(sched, fd, Dir::Read);
    if !hi.hookable {
        return raw_accept(fd);
    }

    let mut ev = IoEvent::new(fd, Dir::Read);
    loop {
        match raw_accept(fd) {
            Ok(r) => return Ok(r),
            Err(err) => match err.raw_os_error().unwrap_or(0) {
                e if e == libc::EWOULDBLOCK || e == libc::EAGAIN => ev.wait(-1)?,
                e if e == libc::EINTR => {}
                _ => return Err(err),
            },
        }
    }
}

fn raw_accept(fd: RawFd) -> io::Result<(RawFd, Option<SocketAddr>)> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
    let connfd =
        unsafe { libc::accept(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) };
    if connfd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((connfd, sock::from_sockaddr(&storage)))
}

/// Close, dropping any hook state the runtime kept for the fd.
pub fn close(fd: RawFd) -> io::Result<()> {
    match Scheduler::current() {
        None => raw_close(fd),
        Some(sched) => match sched.hook_tab_get(fd) {
            Some(hi) if hi.hookable() => sock::close(fd, 0),
            _ => {
                sched.erase_hook_info(fd);
                raw_close(fd)
            }
        },
    }
}

fn raw_close(fd: RawFd) -> io::Result<()> {
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

pub fn shutdown(fd: RawFd, how: char) -> io::Result<()> {
    match Scheduler::current() {
        Some(_) => sock::shutdown(fd, how),
        None => {
            let how = match how {
                'r' => libc::SHUT_RD,
                'w' => libc::SHUT_WR,
                _ => libc::SHUT_RDWR,
            };
            let r = unsafe { libc::shutdown(fd, how) };
            if r != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }
    }
}

/// Interval for re-polling when a multi-fd `poll`/`select` cannot be
/// mapped onto single event registrations.
const POLL_RETRY_MS: u32 = 16;

/// `poll`, suspending the coroutine instead of the thread.
///
/// A single fd waiting on exactly one direction turns into a direct
/// event registration with an optional timer. Anything else falls back
/// to re-polling with a zero timeout every 16 ms, which is correct if
/// not elegant.
pub fn poll(fds: &mut [libc::pollfd], ms: i64) -> io::Result<usize> {
    if Scheduler::current().is_none() || ms == 0 {
        return raw_poll(fds, if ms > c_int::MAX as i64 { c_int::MAX } else { ms as c_int });
    }

    if fds.len() == 1
        && fds[0].fd >= 0
        && (fds[0].events == libc::POLLIN || fds[0].events == libc::POLLOUT)
    {
        let dir = if fds[0].events == libc::POLLIN { Dir::Read } else { Dir::Write };
        let mut ev = IoEvent::new(fds[0].fd, dir);
        return match ev.wait(ms) {
            Ok(()) => {
                fds[0].revents = fds[0].events;
                Ok(1)
            }
            Err(ref e) if e.raw_os_error() == Some(libc::ETIMEDOUT) => Ok(0),
            Err(e) => Err(e),
        };
    }

    let deadline = if ms < 0 { None } else { Some(now_ms() + ms) };
    loop {
        match raw_poll(fds, 0) {
            Ok(0) => {}
            r => return r,
        }
        if let Some(d) = deadline {
            if now_ms() >= d {
                return Ok(0);
            }
        }
        crate::sleep(POLL_RETRY_MS);
    }
}

fn raw_poll(fds: &mut [libc::pollfd], ms: c_int) -> io::Result<usize> {
    loop {
        let r = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, ms) };
        if r >= 0 {
            return Ok(r as usize);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(err);
        }
    }
}

/// `select`, suspending the coroutine instead of the thread. A pure
/// timeout (`nfds == 0`) is a sleep; fd sets fall back to the 16 ms
/// re-poll loop.
pub fn select(
    nfds: c_int,
    mut readfds: Option<&mut libc::fd_set>,
    mut writefds: Option<&mut libc::fd_set>,
    mut errfds: Option<&mut libc::fd_set>,
    ms: i64,
) -> io::Result<usize> {
    if Scheduler::current().is_none() || ms == 0 {
        return raw_select(nfds, readfds.as_deref_mut(), writefds.as_deref_mut(), errfds.as_deref_mut(), ms);
    }

    if nfds == 0 && ms > 0 {
        crate::sleep(ms as u32);
        return Ok(0);
    }

    // select mutates its sets, so re-seed the working copies each try
    let saved_r = readfds.as_deref().copied();
    let saved_w = writefds.as_deref().copied();
    let saved_e = errfds.as_deref().copied();

    let deadline = if ms < 0 { None } else { Some(now_ms() + ms) };
    loop {
        if let (Some(dst), Some(src)) = (readfds.as_deref_mut(), saved_r.as_ref()) {
            *dst = *src;
        }
        if let (Some(dst), Some(src)) = (writefds.as_deref_mut(), saved_w.as_ref()) {
            *dst = *src;
        }
        if let (Some(dst), Some(src)) = (errfds.as_deref_mut(), saved_e.as_ref()) {
            *dst = *src;
        }

        match raw_select(nfds, readfds.as_deref_mut(), writefds.as_deref_mut(), errfds.as_deref_mut(), 0)? {
            0 => {}
            n => return Ok(n),
        }
        if let Some(d) = deadline {
            if now_ms() >= d {
                return Ok(0);
            }
        }
        crate::sleep(POLL_RETRY_MS);
    }
}

fn raw_select(
    nfds: c_int,
    readfds: Option<&mut libc::fd_set>,
    writefds: Option<&mut libc::fd_set>,
    errfds: Option<&mut libc::fd_set>,
    ms: i64,
) -> io::Result<usize> {
    let rp = readfds.map_or(ptr::null_mut(), |r| r as *mut libc::fd_set);
    let wp = writefds.map_or(ptr::null_mut(), |w| w as *mut libc::fd_set);
    let ep = errfds.map_or(ptr::null_mut(), |e| e as *mut libc::fd_set);

    let mut tv = libc::timeval {
        tv_sec: (ms.max(0) / 1000) as libc::time_t,
        tv_usec: ((ms.max(0) % 1000) * 1000) as libc::suseconds_t,
    };
    let tvp = if ms < 0 { ptr::null_mut() } else { &mut tv as *mut libc::timeval };

    let r = unsafe { libc::select(nfds, rp, wp, ep, tvp) };
    if r < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(r as usize)
}

pub fn sleep(secs: u32) {
    crate::sleep(secs.saturating_mul(1000));
}

pub fn usleep(us: u32) {
    crate::sleep(us / 1000);
}

pub fn nanosleep(d: Duration) {
    crate::sleep(d.as_millis() as u32);
}

/// Resolve a host name. The libc resolver is not coroutine-aware, so
/// inside a coroutine lookups are serialized under a coroutine mutex;
/// the thread still blocks for the duration of one lookup.
pub fn resolve(host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
    if Scheduler::current().is_some() {
        let _g = dns_lock().lock();
        (host, port).to_socket_addrs().map(|it| it.collect())
    } else {
        (host, port).to_socket_addrs().map(|it| it.collect())
    }
}

fn dns_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}
