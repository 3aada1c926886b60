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
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config;
use crate::scheduler::Scheduler;

/// A pool of reusable objects with one store per scheduler.
///
/// A store is only ever touched by coroutines of its own scheduler,
/// so pops and pushes are lock-free and items never migrate between
/// threads behind the user's back. Remaining items are dropped on the
/// owning scheduler's thread when that scheduler stops.
pub struct Pool<T> {
    inner: Arc<PoolInner<T>>,
}

struct PoolInner<T> {
    stores: Vec<Store<T>>,
    ccb: Option<Box<dyn Fn() -> T + Send + Sync>>,
    maxcap: usize,
}

struct Store<T> {
    cleanup_registered: AtomicBool,
    items: UnsafeCell<Vec<T>>,
}

// Each store is confined to its scheduler's thread; the Arc only
// shares the (immutable) layout across threads.
unsafe impl<T: Send> Send for PoolInner<T> {}
unsafe impl<T: Send> Sync for PoolInner<T> {}

impl<T> Clone for Pool<T> {
    fn clone(&self) -> Pool<T> {
        Pool { inner: self.inner.clone() }
    }
}

impl<T: Send + 'static> Pool<T> {
    /// An empty pool: `pop()` on an empty store yields `None`.
    pub fn new() -> Pool<T> {
        Pool::build(None, usize::MAX)
    }

    /// A pool that creates objects on demand and caps each
    /// scheduler's store at `cap` items; items pushed above the cap
    /// are dropped.
    pub fn with_creator<F>(ccb: F, cap: usize) -> Pool<T>
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Pool::build(Some(Box::new(ccb)), cap)
    }

    fn build(ccb: Option<Box<dyn Fn() -> T + Send + Sync>>, maxcap: usize) -> Pool<T> {
        let stores = (0..config::max_sched_num())
            .map(|_| Store {
                cleanup_registered: AtomicBool::new(false),
                items: UnsafeCell::new(Vec::new()),
            })
            .collect();
        Pool { inner: Arc::new(PoolInner { stores, ccb, maxcap }) }
    }

    /// Take an object from the calling scheduler's store, or create
    /// one if a creator was given.
    pub fn pop(&self) -> Option<T> {
        let sched = Scheduler::current().expect("co::Pool::pop must be called in a coroutine");
        let store = self.store(sched);
        let items = unsafe { &mut *store.items.get() };
        match items.pop() {
            Some(t) => Some(t),
            None => self.inner.ccb.as_ref().map(|f| f()),
        }
    }

    /// Return an object to the calling scheduler's store; above the
    /// cap the object is dropped instead.
    pub fn push(&self, t: T) {
        let sched = Scheduler::current().expect("co::Pool::push must be called in a coroutine");
        let store = self.store(sched);
        let items = unsafe { &mut *store.items.get() };
        if items.len() < self.inner.maxcap {
            items.push(t);
        }
    }

    /// Items currently cached for the calling scheduler.
    pub fn len(&self) -> usize {
        let sched = Scheduler::current().expect("co::Pool::len must be called in a coroutine");
        unsafe { &*self.store(sched).items.get() }.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn store(&self, sched: &Scheduler) -> &Store<T> {
        let id = sched.id() as usize;
        let store = &self.inner.stores[id];
        if !store.cleanup_registered.swap(true, Ordering::Relaxed) {
            // Dropping pooled objects is only safe on the thread that
            // owns them, so the scheduler does it when its loop exits.
            let inner = self.inner.clone();
            sched.add_cleanup(Box::new(move || {
                unsafe { &mut *inner.stores[id].items.get() }.clear();
            }));
        }
        store
    }
}

impl<T: Send + 'static> Default for Pool<T> {
    fn default() -> Pool<T> {
        Pool::new()
    }
}
