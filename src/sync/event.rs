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

use std::collections::HashMap;
use std::mem;
use std::sync::atomic::Ordering;
use std::sync::Mutex;

use crate::coroutine::{Waiter, S_INIT, S_READY, S_WAIT};
use crate::scheduler::{sched_mgr, Scheduler};
use crate::timer::TimerId;

/// A wake-up broadcast for coroutines.
///
/// `signal()` may be called from any thread, including plain OS
/// threads outside the runtime. Delivery against a racing timeout is
/// decided by a CAS on each waiter's state, so a waiter observes
/// exactly one of the two.
pub struct Event {
    waiters: Mutex<HashMap<(u32, u32), (Waiter, Option<TimerId>)>>,
}

impl Event {
    pub fn new() -> Event {
        Event { waiters: Mutex::new(HashMap::new()) }
    }

    /// Park the calling coroutine until the event is signalled.
    pub fn wait(&self) {
        let sched = Scheduler::current().expect("co::Event::wait must be called in a coroutine");
        let w = sched.waiter();
        w.state.store(S_WAIT, Ordering::Release);
        {
            let mut map = self.waiters.lock().unwrap();
            map.insert((w.sched, w.co), (w.clone(), None));
        }

        sched.yield_now();
        w.state.store(S_INIT, Ordering::Release);
    }

    /// Park with a deadline. Returns `true` when signalled, `false`
    /// when the deadline fired first.
    pub fn wait_ms(&self, ms: u32) -> bool {
        let sched = Scheduler::current().expect("co::Event::wait must be called in a coroutine");
        let w = sched.waiter();
        w.state.store(S_WAIT, Ordering::Release);

        let timer = sched.add_timer(ms);
        {
            let mut map = self.waiters.lock().unwrap();
            map.insert((w.sched, w.co), (w.clone(), Some(timer)));
        }

        sched.yield_now();

        let timed_out = sched.timeout();
        if timed_out {
            let mut map = self.waiters.lock().unwrap();
            map.remove(&(w.sched, w.co));
        }
        w.state.store(S_INIT, Ordering::Release);
        !timed_out
    }

    /// Wake every waiter, each at most once. A waiter whose timeout
    /// won the race is skipped; its timer, if still pending, is
    /// disarmed by the owning scheduler on delivery.
    pub fn signal(&self) {
        let waiters = {
            let mut map = self.waiters.lock().unwrap();
            mem::take(&mut *map)
        };

        for (_, (w, timer)) in waiters {
            if w.state
                .compare_exchange(S_WAIT, S_READY, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                sched_mgr().scheduler(w.sched).add_ready_task(w.co, timer);
            }
        }
    }
}

impl Default for Event {
    fn default() -> Event {
        Event::new()
    }
}
