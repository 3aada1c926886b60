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

//! The per-thread coroutine scheduler and the process-wide manager.
//!
//! One scheduler runs on one OS thread and owns everything its
//! coroutines touch: the poller, the timer wheel, the coroutine pool
//! and the stack pool. Within one scheduler execution is strictly
//! cooperative, so none of that state is locked. The only parts other
//! threads may touch are the task queue (mutex), the wake handle and
//! the stop flag.
//!
//! Each loop iteration resumes, in order: coroutines whose I/O became
//! ready, newly submitted tasks and externally re-queued coroutines,
//! and coroutines whose timers expired.

/*
 *  scheduler thread:
 *    resume(co) -> ctx.resume()
 *       ^             |
 *       |             v
 *    Transfer     coroutine_main / user callback: runs on the
 *    returned         coroutine's own pooled stack
 *       |             |
 *       <-- yield_now() resumes the main context
 */

use std::cell::{Cell, UnsafeCell};
use std::collections::HashMap;
use std::mem;
use std::os::unix::io::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Condvar, Mutex, Once, OnceLock};
use std::thread;

use context::{Context, Transfer};

use crate::config;
use crate::coroutine::{Closure, CoPool, Waiter, NO_CO, S_INIT, S_WAIT};
use crate::hook::HookInfo;
use crate::poller::{Dir, Fired, Poller, WakeHandle};
use crate::stack::StackPool;
use crate::timer::{now_ms, TimerId, TimerWheel};

thread_local!(static GSCHED: Cell<*const Scheduler> = Cell::new(ptr::null()));

/// Transfer word sent back to `resume()` when a coroutine returns from
/// its callback.
const CO_DONE: usize = 1;

struct TaskQueue {
    new_cb: Vec<Closure>,
    /// Coroutines to resume; a ready task enqueued by `Event::signal`
    /// carries the timer it raced against so the loop can disarm it.
    ready: Vec<(u32, Option<TimerId>)>,
}

/// Loop-local scheduler state. Only the owning thread touches this,
/// either from the main context or from a coroutine it resumed.
pub(crate) struct Inner {
    poller: Poller,
    timers: TimerWheel,
    co_pool: CoPool,
    stacks: StackPool,
    hook_tab: HashMap<RawFd, HookInfo>,
    main_ctx: Option<Context>,
    running: u32,
    timeout: bool,
    wait_ms: i64,
    cleanup: Vec<Box<dyn FnOnce()>>,
}

pub struct Scheduler {
    id: u32,
    stack_size: usize,
    tasks: Mutex<TaskQueue>,
    wake: WakeHandle,
    stopped: AtomicBool,
    done: SyncEvent,
    inner: UnsafeCell<Inner>,
}

// The UnsafeCell'd Inner is only dereferenced on the scheduler's own
// thread; everything reachable from another thread is Sync on its own.
unsafe impl Send for Scheduler {}
unsafe impl Sync for Scheduler {}

impl Scheduler {
    fn new(id: u32, stack_size: usize) -> Scheduler {
        let (poller, wake) = Poller::new().expect("failed to create the scheduler poller");
        Scheduler {
            id,
            stack_size,
            tasks: Mutex::new(TaskQueue { new_cb: Vec::new(), ready: Vec::new() }),
            wake,
            stopped: AtomicBool::new(false),
            done: SyncEvent::new(),
            inner: UnsafeCell::new(Inner {
                poller,
                timers: TimerWheel::new(),
                co_pool: CoPool::new(),
                stacks: StackPool::new(),
                hook_tab: HashMap::new(),
                main_ctx: None,
                running: NO_CO,
                timeout: false,
                wait_ms: -1,
                cleanup: Vec::new(),
            }),
        }
    }

    /// The scheduler driving the current thread, if any. Null on user
    /// threads that are not scheduler threads.
    pub fn current() -> Option<&'static Scheduler> {
        GSCHED.with(|c| {
            let p = c.get();
            if p.is_null() { None } else { Some(unsafe { &*p }) }
        })
    }

    /// Loop-local state. Must only be called from this scheduler's own
    /// thread; the borrow must not be held across a context switch.
    #[allow(clippy::mut_from_ref)]
    fn inner(&self) -> &mut Inner {
        debug_assert!(Scheduler::current().map_or(true, |s| ptr::eq(s, self)));
        unsafe { &mut *self.inner.get() }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Id of the coroutine currently running on this scheduler, or
    /// `NO_CO` from the main context.
    pub(crate) fn running(&self) -> u32 {
        self.inner().running
    }

    /// True while the scheduler is resuming coroutines whose timers
    /// expired; lets an awakened coroutine tell a timeout from real
    /// readiness.
    pub fn timeout(&self) -> bool {
        self.inner().timeout
    }

    // ---- callable from any thread ------------------------------------

    pub(crate) fn add_new_task(&self, cb: Closure) {
        {
            let mut q = self.tasks.lock().unwrap();
            q.new_cb.push(cb);
        }
        self.wake.signal();
    }

    pub(crate) fn add_ready_task(&self, co: u32, timer: Option<TimerId>) {
        {
            let mut q = self.tasks.lock().unwrap();
            q.ready.push((co, timer));
        }
        self.wake.signal();
    }

    /// Stop the loop and wait for it to exit. Must not be called from a
    /// coroutine running on this same scheduler.
    pub(crate) fn stop(&self) {
        assert!(
            Scheduler::current().map_or(true, |s| !ptr::eq(s, self)),
            "stop() called from a coroutine on the scheduler being stopped"
        );
        if !self.stopped.swap(true, Ordering::AcqRel) {
            self.wake.signal();
            self.done.wait();
        }
    }

    // ---- callable from a coroutine of this scheduler ------------------

    /// Suspend the running coroutine until something resumes it.
    pub(crate) fn yield_now(&self) {
        let main = self
            .inner()
            .main_ctx
            .take()
            .expect("yield_now() called outside a coroutine");
        let Transfer { context, .. } = unsafe { main.resume(0) };
        self.inner().main_ctx = Some(context);
    }

    pub(crate) fn sleep(&self, ms: u32) {
        let g = self.inner();
        debug_assert_ne!(g.running, NO_CO, "sleep() called outside a coroutine");
        trace!("co {} sleeps {} ms", g.running, ms);
        g.timers.add(now_ms() + ms as i64, g.running);
        self.yield_now();
    }

    /// Arm a timer for the running coroutine. The caller owns the id
    /// and must disarm it unless the timer fires.
    pub(crate) fn add_timer(&self, ms: u32) -> TimerId {
        let g = self.inner();
        debug_assert_ne!(g.running, NO_CO);
        g.timers.add(now_ms() + ms as i64, g.running)
    }

    pub(crate) fn del_timer(&self, id: TimerId) {
        self.inner().timers.del(id);
    }

    pub(crate) fn add_event(&self, fd: RawFd, dir: Dir) -> std::io::Result<()> {
        let g = self.inner();
        debug_assert_ne!(g.running, NO_CO);
        g.poller.add_event(fd, dir, g.running)
    }

    pub(crate) fn del_event_dir(&self, fd: RawFd, dir: Dir) {
        self.inner().poller.del_event_dir(fd, dir);
    }

    pub(crate) fn del_event(&self, fd: RawFd) {
        self.inner().poller.del_event(fd);
    }

    /// Park handle for the running coroutine, for sync primitives.
    pub(crate) fn waiter(&self) -> Waiter {
        let g = self.inner();
        debug_assert_ne!(g.running, NO_CO);
        let co = g.co_pool.get(g.running);
        Waiter { sched: self.id, co: co.id, state: co.state.clone() }
    }

    /// Register a callback to run on this scheduler's thread when the
    /// loop exits (used by `sync::Pool` to drop pooled objects where
    /// they were created).
    pub(crate) fn add_cleanup(&self, f: Box<dyn FnOnce()>) {
        self.inner().cleanup.push(f);
    }

    pub(crate) fn hook_tab_get(&self, fd: RawFd) -> Option<HookInfo> {
        self.inner().hook_tab.get(&fd).copied()
    }

    pub(crate) fn hook_tab_set(&self, fd: RawFd, hi: HookInfo) {
        self.inner().hook_tab.insert(fd, hi);
    }

    pub(crate) fn erase_hook_info(&self, fd: RawFd) {
        self.inner().hook_tab.remove(&fd);
    }

    // ---- the loop -----------------------------------------------------

    fn resume(&self, id: u32) {
        trace!("sched {}: resume co {}", self.id, id);
        let ctx = {
            let g = self.inner();
            g.running = id;
            if g.co_pool.get(id).ctx.is_none() && g.co_pool.get(id).stack.is_none() {
                let stack = g.stacks.take_stack(self.stack_size);
                g.co_pool.get_mut(id).stack = Some(stack);
            }
            let co = g.co_pool.get_mut(id);
            match co.ctx.take() {
                Some(ctx) => ctx,
                None => unsafe { Context::new(co.stack.as_ref().unwrap(), coroutine_main) },
            }
        };

        let Transfer { context, data } = unsafe { ctx.resume(0) };

        let g = self.inner();
        g.running = NO_CO;
        if data == CO_DONE {
            trace!("sched {}: co {} finished", self.id, id);
            debug_assert!(g.co_pool.get(id).cb.is_none());
            if let Some(stack) = g.co_pool.get_mut(id).stack.take() {
                g.stacks.give_stack(stack);
            }
            g.co_pool.recycle(id);
            drop(context); // the terminated coroutine's context
        } else {
            g.co_pool.get_mut(id).ctx = Some(context);
        }
    }

    fn check_timeout(&self, now: i64, out: &mut Vec<u32>) {
        let g = self.inner();
        if g.timers.is_empty() {
            return;
        }
        let mut expired = Vec::new();
        g.timers.pop_expired(now, &mut expired);
        for co in expired {
            // An event waiter may concurrently be signalled: whoever
            // swaps the state first delivers the wake-up.
            let state = &g.co_pool.get(co).state;
            if state.load(Ordering::Relaxed) == S_INIT
                || state.swap(S_INIT, Ordering::AcqRel) == S_WAIT
            {
                out.push(co);
            }
        }
    }

    fn run(&'static self) {
        GSCHED.with(|c| c.set(self as *const Scheduler));
        debug!("scheduler {} starts", self.id);

        let mut new_cb: Vec<Closure> = Vec::new();
        let mut ready: Vec<(u32, Option<TimerId>)> = Vec::new();
        let mut fired: Vec<Fired> = Vec::new();
        let mut timed_out: Vec<u32> = Vec::new();

        loop {
            let wait_ms = self.inner().wait_ms;
            let r = self.inner().poller.wait(wait_ms);
            if self.stopped.load(Ordering::Acquire) {
                break;
            }
            if let Err(e) = r {
                error!("scheduler {}: poller wait error: {}", self.id, e);
                continue;
            }

            // 1. I/O readiness, in the order the kernel reported it.
            self.inner().poller.harvest(&self.wake, &mut fired);
            for i in 0..fired.len() {
                let (fd, readable, writable) = {
                    let f = &fired[i];
                    (f.fd, f.readable, f.writable)
                };
                if readable {
                    if let Some(co) = self.inner().poller.waiter(fd, Dir::Read) {
                        self.resume(co);
                    }
                }
                if writable {
                    if let Some(co) = self.inner().poller.waiter(fd, Dir::Write) {
                        self.resume(co);
                    }
                }
            }
            fired.clear();

            // 2. New tasks and externally re-queued coroutines, FIFO.
            {
                let mut q = self.tasks.lock().unwrap();
                mem::swap(&mut q.new_cb, &mut new_cb);
                mem::swap(&mut q.ready, &mut ready);
            }
            for cb in new_cb.drain(..) {
                let id = self.inner().co_pool.alloc(cb);
                self.resume(id);
            }
            for (co, timer) in ready.drain(..) {
                if let Some(t) = timer {
                    self.inner().timers.del(t);
                }
                self.resume(co);
            }

            // 3. Expired timers, with the timeout flag raised so the
            //    awakened coroutines can tell.
            self.check_timeout(now_ms(), &mut timed_out);
            if !timed_out.is_empty() {
                self.inner().timeout = true;
                for co in timed_out.drain(..) {
                    self.resume(co);
                }
                self.inner().timeout = false;
            }

            // 4. Next deadline.
            let g = self.inner();
            g.wait_ms = g.timers.next_timeout(now_ms());
        }

        let cleanups = mem::take(&mut self.inner().cleanup);
        for f in cleanups {
            f();
        }
        debug!("scheduler {} stopped", self.id);
        self.done.signal();
    }
}

/// Entry trampoline for every coroutine: runs the callback on the
/// coroutine's own stack, then reports termination to `resume()`.
extern "C" fn coroutine_main(t: Transfer) -> ! {
    let Transfer { context, .. } = t;
    let sched = Scheduler::current().expect("coroutine entry without a scheduler");
    let cb = {
        let g = sched.inner();
        g.main_ctx = Some(context);
        let id = g.running;
        g.co_pool
            .get_mut(id)
            .cb
            .take()
            .expect("coroutine resumed without a callback")
    };

    if let Err(err) = panic::catch_unwind(AssertUnwindSafe(cb)) {
        let msg = match err.downcast_ref::<&'static str>() {
            Some(s) => *s,
            None => match err.downcast_ref::<String>() {
                Some(s) => &s[..],
                None => "Box<Any>",
            },
        };
        error!("coroutine {} panicked: {}", sched.running(), msg);
    }

    let main = sched
        .inner()
        .main_ctx
        .take()
        .expect("finished coroutine lost the main context");
    unsafe { main.resume(CO_DONE) };
    unreachable!();
}

/// A one-shot gate used to hand the "loop has exited" signal across
/// threads during shutdown.
struct SyncEvent {
    m: Mutex<bool>,
    cv: Condvar,
}

impl SyncEvent {
    fn new() -> SyncEvent {
        SyncEvent { m: Mutex::new(false), cv: Condvar::new() }
    }

    fn signal(&self) {
        let mut set = self.m.lock().unwrap();
        *set = true;
        self.cv.notify_all();
    }

    fn wait(&self) {
        let mut set = self.m.lock().unwrap();
        while !*set {
            set = self.cv.wait(set).unwrap();
        }
    }
}

/// Owns the schedulers and spreads new coroutines over them
/// round-robin. One per process, created lazily on first use.
pub(crate) struct SchedManager {
    scheds: Vec<Scheduler>,
    index: AtomicU32,
    /// `n - 1` when the scheduler count is a power of two.
    mask: Option<u32>,
    started: Once,
}

impl SchedManager {
    fn new() -> SchedManager {
        let cfg = config::get();
        let mut n = cfg.sched_num;
        if n == 0 {
            n = num_cpus::get() as u32;
        }
        if n > config::max_sched_num() as u32 {
            n = config::max_sched_num() as u32;
        }
        let stack_size = if cfg.stack_size == 0 { 1024 * 1024 } else { cfg.stack_size };

        info!("coroutine schedulers start, sched num: {}, stack size: {}k", n, stack_size >> 10);

        let scheds = (0..n).map(|i| Scheduler::new(i, stack_size)).collect();
        SchedManager {
            scheds,
            index: AtomicU32::new(0),
            mask: if n.is_power_of_two() { Some(n - 1) } else { None },
            started: Once::new(),
        }
    }

    pub fn next(&'static self) -> &'static Scheduler {
        let i = self.index.fetch_add(1, Ordering::Relaxed);
        match self.mask {
            Some(mask) => &self.scheds[(i & mask) as usize],
            None => &self.scheds[(i % self.scheds.len() as u32) as usize],
        }
    }

    pub fn scheduler(&self, id: u32) -> &Scheduler {
        &self.scheds[id as usize]
    }

    pub fn stop(&self) {
        for s in &self.scheds {
            s.stop();
        }
    }

    fn start(&'static self) {
        self.started.call_once(|| {
            for s in &self.scheds {
                thread::Builder::new()
                    .name(format!("sched-{}", s.id()))
                    .spawn(move || s.run())
                    .expect("failed to spawn a scheduler thread");
            }
        });
    }
}

pub(crate) fn sched_mgr() -> &'static SchedManager {
    static MGR: OnceLock<SchedManager> = OnceLock::new();
    let mgr = MGR.get_or_init(SchedManager::new);
    mgr.start();
    mgr
}
