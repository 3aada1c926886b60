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

//! Timed-wait bookkeeping for one scheduler.
//!
//! Timers are kept in an ordered map from `(expiry_ms, seq)` to the
//! waiting coroutine. The sequence number makes equal deadlines behave
//! like a multimap: ties expire in insertion order, and any timer can
//! be deleted by its id in O(log n).

use std::collections::BTreeMap;
use std::mem;
use std::sync::OnceLock;
use std::time::Instant;

/// Milliseconds on the monotonic clock, anchored at the first call.
pub fn now_ms() -> i64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_millis() as i64
}

/// Identifies one timer in the wheel. Copyable so RAII holders can
/// remember which entry to erase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId {
    ms: i64,
    seq: u64,
}

pub struct TimerWheel {
    timers: BTreeMap<TimerId, u32>,
    seq: u64,
}

impl TimerWheel {
    pub fn new() -> TimerWheel {
        TimerWheel {
            timers: BTreeMap::new(),
            seq: 0,
        }
    }

    /// Arm a timer for `co` expiring at the absolute time `expiry_ms`.
    pub fn add(&mut self, expiry_ms: i64, co: u32) -> TimerId {
        self.seq += 1;
        let id = TimerId { ms: expiry_ms, seq: self.seq };
        self.timers.insert(id, co);
        trace!("add timer {:?} for co {}", id, co);
        id
    }

    /// Disarm a timer. A timer that already expired is gone from the
    /// map, so this is a no-op for it.
    pub fn del(&mut self, id: TimerId) {
        if self.timers.remove(&id).is_some() {
            trace!("del timer {:?}", id);
        }
    }

    /// Remove every entry with expiry <= `now` and append the waiting
    /// coroutines, in expiry order (FIFO among equal deadlines).
    pub fn pop_expired(&mut self, now: i64, out: &mut Vec<u32>) {
        let cutoff = TimerId { ms: now + 1, seq: 0 };
        let pending = self.timers.split_off(&cutoff);
        let expired = mem::replace(&mut self.timers, pending);
        for (_, co) in expired {
            out.push(co);
        }
    }

    /// Milliseconds until the next expiry, or -1 when no timer is armed.
    pub fn next_timeout(&self, now: i64) -> i64 {
        match self.timers.keys().next() {
            Some(id) => {
                let d = id.ms - now;
                if d > 0 { d } else { 0 }
            }
            None => -1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::TimerWheel;

    #[test]
    fn test_expiry_order() {
        let mut w = TimerWheel::new();
        w.add(30, 3);
        w.add(10, 1);
        w.add(20, 2);

        let mut out = Vec::new();
        w.pop_expired(25, &mut out);
        assert_eq!(out, vec![1, 2]);
        assert_eq!(w.next_timeout(25), 5);

        out.clear();
        w.pop_expired(100, &mut out);
        assert_eq!(out, vec![3]);
        assert!(w.is_empty());
        assert_eq!(w.next_timeout(100), -1);
    }

    #[test]
    fn test_fifo_tie_break() {
        let mut w = TimerWheel::new();
        w.add(10, 7);
        w.add(10, 8);
        w.add(10, 9);

        let mut out = Vec::new();
        w.pop_expired(10, &mut out);
        assert_eq!(out, vec![7, 8, 9]);
    }

    #[test]
    fn test_del_by_id() {
        let mut w = TimerWheel::new();
        let a = w.add(10, 1);
        let b = w.add(10, 2);
        w.del(a);

        let mut out = Vec::new();
        w.pop_expired(10, &mut out);
        assert_eq!(out, vec![2]);

        // deleting an expired timer is harmless
        w.del(b);
    }
}
