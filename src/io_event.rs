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

use std::io;
use std::os::unix::io::RawFd;

use crate::poller::Dir;
use crate::scheduler::Scheduler;
use crate::timer::TimerId;

/// One suspension on (fd, direction), with an optional deadline.
///
/// The registration and the timer are bound to this value: dropping it
/// removes both, so a coroutine can never leave a stale waiter or a
/// stale timer behind when it returns to user code.
///
/// The deadline spans the whole I/O operation: the timer is armed on
/// the first timed `wait` and kept across retries, so a slow peer
/// cannot extend the timeout by trickling single bytes.
pub struct IoEvent {
    fd: RawFd,
    dir: Dir,
    timer: Option<TimerId>,
    has_ev: bool,
}

impl IoEvent {
    pub fn new(fd: RawFd, dir: Dir) -> IoEvent {
        IoEvent { fd, dir, timer: None, has_ev: false }
    }

    /// Park the calling coroutine until the event fires or `ms`
    /// elapses (`ms < 0` waits forever). On timeout the error carries
    /// `ETIMEDOUT`; a poller registration failure is surfaced as-is.
    pub fn wait(&mut self, ms: i64) -> io::Result<()> {
        let sched = Scheduler::current().expect("IoEvent must be used in a coroutine");

        if !self.has_ev {
            sched.add_event(self.fd, self.dir)?;
            self.has_ev = true;
        }

        if ms < 0 {
            sched.yield_now();
            return Ok(());
        }

        if self.timer.is_none() {
            self.timer = Some(sched.add_timer(ms as u32));
        }
        sched.yield_now();

        if !sched.timeout() {
            return Ok(());
        }
        // the expired timer is already gone from the wheel
        self.timer = None;
        Err(io::Error::from_raw_os_error(libc::ETIMEDOUT))
    }
}

impl Drop for IoEvent {
    fn drop(&mut self) {
        if let Some(sched) = Scheduler::current() {
            if self.has_ev {
                sched.del_event_dir(self.fd, self.dir);
            }
            if let Some(id) = self.timer.take() {
                sched.del_timer(id);
            }
        }
    }
}
