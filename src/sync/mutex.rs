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

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::Mutex as ThreadMutex;

use crate::coroutine::Waiter;
use crate::scheduler::{sched_mgr, Scheduler};

/// A coroutine mutex.
///
/// Contended locks park the calling coroutine in a FIFO queue; unlock
/// hands the lock directly to the queue head and re-schedules it on
/// its own scheduler. The internal state is guarded by a plain thread
/// mutex that is only ever held for a few instructions.
pub struct Mutex<T> {
    state: ThreadMutex<State>,
    data: UnsafeCell<T>,
}

struct State {
    locked: bool,
    waiters: VecDeque<Waiter>,
}

unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    pub fn new(inner: T) -> Mutex<T> {
        Mutex {
            state: ThreadMutex::new(State { locked: false, waiters: VecDeque::new() }),
            data: UnsafeCell::new(inner),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    /// Acquire the lock, suspending the calling coroutine while the
    /// lock is held elsewhere.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        {
            let mut st = self.state.lock().unwrap();
            if !st.locked {
                st.locked = true;
                return MutexGuard { mutex: self };
            }
            let sched =
                Scheduler::current().expect("co::Mutex::lock must be called in a coroutine");
            st.waiters.push_back(sched.waiter());
        }

        // woken by unlock(), which hands the lock over without
        // clearing the flag
        Scheduler::current().unwrap().yield_now();
        MutexGuard { mutex: self }
    }

    /// The non-suspending variant; works on any thread.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        let mut st = self.state.lock().unwrap();
        if st.locked {
            None
        } else {
            st.locked = true;
            Some(MutexGuard { mutex: self })
        }
    }

    fn unlock(&self) {
        let waiter = {
            let mut st = self.state.lock().unwrap();
            match st.waiters.pop_front() {
                Some(w) => w,
                None => {
                    st.locked = false;
                    return;
                }
            }
        };
        sched_mgr().scheduler(waiter.sched).add_ready_task(waiter.co, None);
    }
}

pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
}

impl<'a, T> Deref for MutexGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<'a, T> DerefMut for MutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<'a, T> Drop for MutexGuard<'a, T> {
    fn drop(&mut self) {
        self.mutex.unlock()
    }
}
