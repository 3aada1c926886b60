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

// A coroutine is nothing more than a saved context, a pooled stack and
// the user callback to run on first resume. Ids are per-scheduler and
// recycled through a free list.

use std::sync::atomic::AtomicU8;
use std::sync::Arc;

use context::stack::ProtectedFixedSizeStack;
use context::Context;

pub type Closure = Box<dyn FnOnce() + Send + 'static>;

/// Event state of a coroutine, raced over by `Event::signal()` on
/// foreign threads and `check_timeout()` on the owning scheduler.
pub const S_INIT: u8 = 0;
pub const S_WAIT: u8 = 1;
pub const S_READY: u8 = 2;

/// Sentinel id: no coroutine.
pub const NO_CO: u32 = u32::MAX;

pub struct Coroutine {
    pub id: u32,

    /// Shared with sync primitives; see `Waiter`.
    pub state: Arc<AtomicU8>,

    /// The suspended context. `None` before the first resume and while
    /// the coroutine is running.
    pub ctx: Option<Context>,

    /// Stack backing `ctx`, taken from the scheduler's pool on first
    /// resume and returned on termination.
    pub stack: Option<ProtectedFixedSizeStack>,

    /// The user function, consumed on first resume.
    pub cb: Option<Closure>,
}

impl Coroutine {
    fn new(id: u32, cb: Closure) -> Coroutine {
        Coroutine {
            id,
            state: Arc::new(AtomicU8::new(S_INIT)),
            ctx: None,
            stack: None,
            cb: Some(cb),
        }
    }
}

/// Handle to a parked coroutine, held by sync primitives while the
/// coroutine is suspended. `sched` + `co` identify the slot; `state` is
/// the atomic raced over by signal-vs-timeout.
///
/// A coroutine only terminates by returning from its callback, which
/// cannot happen while it is parked, so the slot ids stay valid for as
/// long as a waiter is held.
#[derive(Clone)]
pub struct Waiter {
    pub sched: u32,
    pub co: u32,
    pub state: Arc<AtomicU8>,
}

/// Per-scheduler coroutine pool with id recycling.
pub struct CoPool {
    slots: Vec<Box<Coroutine>>,
    free: Vec<u32>,
}

impl CoPool {
    pub fn new() -> CoPool {
        CoPool {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    pub fn alloc(&mut self, cb: Closure) -> u32 {
        match self.free.pop() {
            Some(id) => {
                let co = &mut self.slots[id as usize];
                debug_assert!(co.ctx.is_none() && co.cb.is_none());
                co.state = Arc::new(AtomicU8::new(S_INIT));
                co.cb = Some(cb);
                id
            }
            None => {
                let id = self.slots.len() as u32;
                self.slots.push(Box::new(Coroutine::new(id, cb)));
                id
            }
        }
    }

    pub fn get(&self, id: u32) -> &Coroutine {
        &self.slots[id as usize]
    }

    pub fn get_mut(&mut self, id: u32) -> &mut Coroutine {
        &mut self.slots[id as usize]
    }

    pub fn recycle(&mut self, id: u32) {
        let co = &mut self.slots[id as usize];
        debug_assert!(co.cb.is_none());
        co.ctx = None;
        self.free.push(id);
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod test {
    use super::CoPool;

    #[test]
    fn test_id_recycling() {
        let mut pool = CoPool::new();
        let a = pool.alloc(Box::new(|| {}));
        let b = pool.alloc(Box::new(|| {}));
        assert_eq!((a, b), (0, 1));

        pool.get_mut(a).cb = None;
        pool.recycle(a);
        let c = pool.alloc(Box::new(|| {}));
        assert_eq!(c, a);
        assert_eq!(pool.len(), 2);
    }
}
