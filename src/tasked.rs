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

//! A coarse task scheduler with second granularity.
//!
//! Runs delayed, periodic and at-a-time-of-day jobs on one dedicated
//! plain thread. For anything finer-grained, use coroutines and
//! `sleep` directly.

use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

type Job = Box<dyn FnMut() + Send + 'static>;

struct Task {
    fun: Job,
    /// Seconds between runs; 0 for one-shot tasks.
    period: i64,
    /// Seconds until the next run.
    count: i64,
}

struct Shared {
    new_tasks: Mutex<Vec<Task>>,
    cv: Condvar,
    stop: AtomicBool,
}

pub struct Tasked {
    shared: Arc<Shared>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Tasked {
    pub fn new() -> Tasked {
        let shared = Arc::new(Shared {
            new_tasks: Mutex::new(Vec::new()),
            cv: Condvar::new(),
            stop: AtomicBool::new(false),
        });
        let loop_shared = shared.clone();
        let handle = thread::Builder::new()
            .name("tasked".to_string())
            .spawn(move || Tasked::run(loop_shared))
            .expect("failed to spawn the tasked thread");
        Tasked { shared, handle: Some(handle) }
    }

    /// Run `f` once, `sec` seconds from now.
    pub fn run_in<F>(&self, f: F, sec: i64)
    where
        F: FnMut() + Send + 'static,
    {
        self.add(Task { fun: Box::new(f), period: 0, count: sec });
    }

    /// Run `f` every `sec` seconds, the first time `sec` seconds from
    /// now.
    pub fn run_every<F>(&self, f: F, sec: i64)
    where
        F: FnMut() + Send + 'static,
    {
        self.add(Task { fun: Box::new(f), period: sec, count: sec });
    }

    /// Run `f` at the next local `hour:minute:second`; when `daily`,
    /// keep running it every day at that time.
    pub fn run_at<F>(&self, f: F, hour: i64, minute: i64, second: i64, daily: bool)
    where
        F: FnMut() + Send + 'static,
    {
        assert!((0..=23).contains(&hour));
        assert!((0..=59).contains(&minute));
        assert!((0..=59).contains(&second));

        let now = local_seconds_of_day();
        let mut at = hour * 3600 + minute * 60 + second;
        if at < now {
            at += 86400;
        }
        self.add(Task {
            fun: Box::new(f),
            period: if daily { 86400 } else { 0 },
            count: at - now,
        });
    }

    pub fn stop(&mut self) {
        if !self.shared.stop.swap(true, Ordering::AcqRel) {
            self.shared.cv.notify_all();
            if let Some(h) = self.handle.take() {
                let _ = h.join();
            }
        }
    }

    fn add(&self, task: Task) {
        let due_now = task.count <= 0;
        {
            let mut q = self.shared.new_tasks.lock().unwrap();
            q.push(task);
        }
        if due_now {
            self.shared.cv.notify_all();
        }
    }

    fn run(shared: Arc<Shared>) {
        let mut tasks: Vec<Task> = Vec::new();
        let mut carry_ms: i64 = 0;

        while !shared.stop.load(Ordering::Acquire) {
            let tick = Instant::now();
            {
                let mut q = shared.new_tasks.lock().unwrap();
                if !q.is_empty() {
                    tasks.append(&mut mem::take(&mut *q));
                }
            }

            let sec = carry_ms / 1000;
            carry_ms -= sec * 1000;

            let mut i = 0;
            while i < tasks.len() {
                let t = &mut tasks[i];
                t.count -= sec;
                if t.count <= 0 {
                    (t.fun)();
                    if t.period > 0 {
                        t.count = t.period;
                        i += 1;
                    } else {
                        tasks.swap_remove(i);
                    }
                } else {
                    i += 1;
                }
            }

            let q = shared.new_tasks.lock().unwrap();
            let _ = shared.cv.wait_timeout(q, Duration::from_secs(1)).unwrap();
            carry_ms += tick.elapsed().as_millis() as i64;
        }
    }
}

impl Drop for Tasked {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Default for Tasked {
    fn default() -> Tasked {
        Tasked::new()
    }
}

fn local_seconds_of_day() -> i64 {
    let mut tm: libc::tm = unsafe { mem::zeroed() };
    let t = unsafe { libc::time(std::ptr::null_mut()) };
    unsafe { libc::localtime_r(&t, &mut tm) };
    tm.tm_hour as i64 * 3600 + tm.tm_min as i64 * 60 + tm.tm_sec as i64
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::Tasked;

    #[test]
    fn test_run_in_now() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();

        let mut tasked = Tasked::new();
        tasked.run_in(move || { h.fetch_add(1, Ordering::Relaxed); }, 0);

        std::thread::sleep(Duration::from_millis(300));
        tasked.stop();
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let mut tasked = Tasked::new();
        tasked.stop();
        tasked.stop();
    }
}
