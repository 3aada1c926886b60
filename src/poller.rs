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

//! Readiness polling for one scheduler.
//!
//! A thin wrapper over `mio::Poll` keeping, per fd, which directions
//! are armed and which coroutine waits on each. Registration is
//! edge-triggered (mio's default on epoll) and idempotent per
//! direction; at most one coroutine may wait on one (fd, direction)
//! pair at a time.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};

// usize::MAX itself is reserved by mio
const WAKER_TOKEN: Token = Token(usize::MAX - 1);
const MAX_EVENTS: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dir {
    Read,
    Write,
}

/// Replaces the classic "pack two coroutine ids into the epoll data
/// word" trick: each registered fd carries its waiters directly.
struct EventInfo {
    read_co: Option<u32>,
    write_co: Option<u32>,
}

impl EventInfo {
    fn interests(&self) -> Option<Interest> {
        match (self.read_co.is_some(), self.write_co.is_some()) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

/// One readiness event harvested from a poll, with the waker event
/// already filtered out.
pub struct Fired {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
}

/// Cross-thread wake-up for a scheduler blocked in `Poller::wait`.
///
/// The flag coalesces wake-ups: only one wake is issued until the
/// scheduler observes the waker event and resets it.
pub struct WakeHandle {
    waker: Waker,
    signaled: AtomicBool,
}

impl WakeHandle {
    pub fn signal(&self) {
        if !self.signaled.swap(true, Ordering::AcqRel) {
            if let Err(e) = self.waker.wake() {
                error!("waker wake error: {}", e);
            }
        }
    }

    fn handled(&self) {
        self.signaled.store(false, Ordering::Release);
    }
}

pub struct Poller {
    poll: Poll,
    events: Events,
    ev_map: HashMap<RawFd, EventInfo>,
}

impl Poller {
    /// Create the poller and its wake handle. Failure here is fatal at
    /// scheduler startup, so the caller `expect`s.
    pub fn new() -> io::Result<(Poller, WakeHandle)> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let poller = Poller {
            poll,
            events: Events::with_capacity(MAX_EVENTS),
            ev_map: HashMap::new(),
        };
        let wake = WakeHandle { waker, signaled: AtomicBool::new(false) };
        Ok((poller, wake))
    }

    /// Arm `dir` on `fd` for coroutine `co`. Idempotent per direction.
    pub fn add_event(&mut self, fd: RawFd, dir: Dir, co: u32) -> io::Result<()> {
        let info = self.ev_map.entry(fd).or_insert(EventInfo { read_co: None, write_co: None });
        let old = info.interests();
        match dir {
            Dir::Read => {
                debug_assert!(info.read_co.map_or(true, |c| c == co),
                              "fd {} already has a read waiter", fd);
                info.read_co = Some(co);
            }
            Dir::Write => {
                debug_assert!(info.write_co.map_or(true, |c| c == co),
                              "fd {} already has a write waiter", fd);
                info.write_co = Some(co);
            }
        }
        let new = info.interests().unwrap();
        let r = match old {
            Some(i) if i == new => Ok(()),
            Some(_) => self.poll.registry().reregister(&mut SourceFd(&fd), Token(fd as usize), new),
            None => self.poll.registry().register(&mut SourceFd(&fd), Token(fd as usize), new),
        };
        if let Err(ref e) = r {
            error!("poller add event error: {}, fd: {}", e, fd);
            self.del_event_dir(fd, dir);
        }
        r
    }

    /// Disarm one direction. Safe if the fd was never registered.
    pub fn del_event_dir(&mut self, fd: RawFd, dir: Dir) {
        let remaining = match self.ev_map.get_mut(&fd) {
            Some(info) => {
                match dir {
                    Dir::Read => info.read_co = None,
                    Dir::Write => info.write_co = None,
                }
                info.interests()
            }
            None => return,
        };
        let r = match remaining {
            Some(i) => self.poll.registry().reregister(&mut SourceFd(&fd), Token(fd as usize), i),
            None => {
                self.ev_map.remove(&fd);
                self.poll.registry().deregister(&mut SourceFd(&fd))
            }
        };
        if let Err(e) = r {
            debug!("poller del event error: {}, fd: {}", e, fd);
        }
    }

    /// Disarm both directions. Safe if the fd was never registered.
    pub fn del_event(&mut self, fd: RawFd) {
        if self.ev_map.remove(&fd).is_some() {
            if let Err(e) = self.poll.registry().deregister(&mut SourceFd(&fd)) {
                debug!("poller del event error: {}, fd: {}", e, fd);
            }
        }
    }

    pub fn waiter(&self, fd: RawFd, dir: Dir) -> Option<u32> {
        self.ev_map.get(&fd).and_then(|info| match dir {
            Dir::Read => info.read_co,
            Dir::Write => info.write_co,
        })
    }

    /// Block until an event fires or `ms` elapses (-1 = no timeout).
    /// A signal interrupt is not an error: it reports 0 events.
    pub fn wait(&mut self, ms: i64) -> io::Result<usize> {
        let timeout = if ms < 0 { None } else { Some(Duration::from_millis(ms as u64)) };
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => Ok(self.events.iter().count()),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// Copy the fired events out of the mio buffer, handling the waker
    /// event in place. Error/hangup conditions wake both directions so
    /// that the waiting coroutine retries its syscall and observes the
    /// real errno.
    pub fn harvest(&self, wake: &WakeHandle, out: &mut Vec<Fired>) {
        for ev in self.events.iter() {
            if ev.token() == WAKER_TOKEN {
                wake.handled();
                continue;
            }
            let err = ev.is_error();
            out.push(Fired {
                fd: ev.token().0 as RawFd,
                readable: ev.is_readable() || ev.is_read_closed() || err,
                writable: ev.is_writable() || ev.is_write_closed() || err,
            });
        }
    }
}

#[cfg(test)]
mod test {
    use super::{Dir, Poller};

    fn pipe() -> (i32, i32) {
        let mut fds = [0i32; 2];
        let r = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(r, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn test_add_del_bookkeeping() {
        let (rd, wr) = pipe();
        let (mut p, _wake) = Poller::new().unwrap();

        assert!(p.add_event(rd, Dir::Read, 1).is_ok());
        assert_eq!(p.waiter(rd, Dir::Read), Some(1));
        assert_eq!(p.waiter(rd, Dir::Write), None);

        // re-arming the same direction for the same coroutine is fine
        assert!(p.add_event(rd, Dir::Read, 1).is_ok());

        p.del_event_dir(rd, Dir::Read);
        assert_eq!(p.waiter(rd, Dir::Read), None);

        // deleting an unregistered fd is a no-op
        p.del_event(wr);

        unsafe {
            libc::close(rd);
            libc::close(wr);
        }
    }

    #[test]
    fn test_readiness_and_wake() {
        let (rd, wr) = pipe();
        let (mut p, wake) = Poller::new().unwrap();
        p.add_event(rd, Dir::Read, 9).unwrap();

        // nothing readable yet
        assert_eq!(p.wait(0).unwrap(), 0);

        let buf = [0x78u8; 1];
        let n = unsafe { libc::write(wr, buf.as_ptr() as *const libc::c_void, 1) };
        assert_eq!(n, 1);

        assert!(p.wait(1000).unwrap() >= 1);
        let mut fired = Vec::new();
        p.harvest(&wake, &mut fired);
        assert!(fired.iter().any(|f| f.fd == rd && f.readable));

        // the wake handle unblocks an idle wait
        wake.signal();
        assert!(p.wait(1000).unwrap() >= 1);
        let mut fired = Vec::new();
        p.harvest(&wake, &mut fired);
        assert!(fired.is_empty());

        unsafe {
            libc::close(rd);
            libc::close(wr);
        }
    }
}
