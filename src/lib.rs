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

//! # Corio
//!
//! A stackful coroutine runtime: code is written as if it used plain
//! blocking calls, yet every potentially blocking operation suspends
//! only the calling coroutine while the OS thread keeps driving
//! thousands of others.
//!
//! One scheduler runs per CPU by default, each with its own event
//! poller, timer wheel and coroutine pool. New coroutines are spread
//! over the schedulers round-robin and stay on their scheduler for
//! life.
//!
//! ```no_run
//! use corio as co;
//!
//! let ev = std::sync::Arc::new(co::Event::new());
//! let ev2 = ev.clone();
//!
//! co::go(move || {
//!     co::sleep(50);
//!     ev2.signal();
//! });
//!
//! co::go(move || {
//!     ev.wait();
//!     println!("signalled");
//! });
//! ```

#![cfg(unix)]

#[macro_use]
extern crate log;

pub use crate::config::Config;
pub use crate::io_event::IoEvent;
pub use crate::poller::Dir;
pub use crate::scheduler::Scheduler;
pub use crate::sync::{Event, Mutex, MutexGuard, Pool};

pub mod config;
mod coroutine;
pub mod hook;
mod io_event;
mod poller;
pub mod rpc;
mod scheduler;
pub mod sock;
mod stack;
pub mod sync;
pub mod tasked;
mod timer;

#[cfg(test)]
mod tests;

use crate::coroutine::NO_CO;
use crate::scheduler::sched_mgr;

/// Spawn a coroutine on some scheduler. The runtime starts on first
/// use; the call itself never blocks.
pub fn go<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    sched_mgr().next().add_new_task(Box::new(f));
}

/// Sleep: suspends the coroutine when called inside one, otherwise
/// puts the OS thread to sleep.
pub fn sleep(ms: u32) {
    match Scheduler::current() {
        Some(sched) => sched.sleep(ms),
        None => std::thread::sleep(std::time::Duration::from_millis(ms as u64)),
    }
}

/// Re-schedule the calling coroutine at the back of its scheduler's
/// queue and let others run.
pub fn yield_now() {
    let sched = Scheduler::current().expect("yield_now() must be called in a coroutine");
    sched.add_ready_task(sched.running(), None);
    sched.yield_now();
}

/// Stop every scheduler and wait for their loops to exit. Must be
/// called from outside the runtime (e.g. the main thread).
pub fn stop() {
    sched_mgr().stop();
}

/// Id of the scheduler driving the current thread, or -1.
pub fn sched_id() -> i32 {
    match Scheduler::current() {
        Some(s) => s.id() as i32,
        None => -1,
    }
}

/// Id of the running coroutine on this thread, or -1. Ids are local to
/// one scheduler and recycled after a coroutine exits.
pub fn coroutine_id() -> i32 {
    match Scheduler::current() {
        Some(s) if s.running() != NO_CO => s.running() as i32,
        _ => -1,
    }
}
