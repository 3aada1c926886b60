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

use std::env;
use std::sync::atomic::{AtomicUsize, Ordering};

use context::stack::ProtectedFixedSizeStack;

/// Per-scheduler cache of coroutine stacks.
///
/// Every coroutine on one scheduler uses the same stack size, so the
/// pool is a plain LIFO of equally-sized stacks.
pub struct StackPool {
    stacks: Vec<ProtectedFixedSizeStack>,
}

impl StackPool {
    pub fn new() -> StackPool {
        StackPool { stacks: Vec::new() }
    }

    pub fn take_stack(&mut self, size: usize) -> ProtectedFixedSizeStack {
        match self.stacks.pop() {
            Some(stack) => stack,
            None => ProtectedFixedSizeStack::new(size)
                .expect("failed to allocate a coroutine stack"),
        }
    }

    pub fn give_stack(&mut self, stack: ProtectedFixedSizeStack) {
        if self.stacks.len() <= max_cached_stacks() {
            self.stacks.push(stack)
        }
    }
}

fn max_cached_stacks() -> usize {
    static AMT: AtomicUsize = AtomicUsize::new(0);
    match AMT.load(Ordering::SeqCst) {
        0 => {}
        n => return n - 1,
    }
    let amt = env::var("RUST_MAX_CACHED_STACKS").ok().and_then(|s| s.parse().ok());
    // This default corresponds to 10M of cache per scheduler (at the
    // default size).
    let amt = amt.unwrap_or(10);
    // 0 is our sentinel value, so ensure that we'll never see 0 after
    // initialization has run
    AMT.store(amt + 1, Ordering::SeqCst);
    amt
}

#[cfg(test)]
mod test {
    use super::StackPool;

    #[test]
    fn stack_pool_caches() {
        let mut p = StackPool::new();
        let s = p.take_stack(64 * 1024);
        let len = s.len();
        p.give_stack(s);
        let s = p.take_stack(64 * 1024);
        assert_eq!(s.len(), len);
        p.give_stack(s);
    }
}
