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

//! Runtime configuration.
//!
//! Every knob can be set from the environment (`CO_SCHED_NUM`,
//! `CO_STACK_SIZE`, `TCP_MAX_RECV_SIZE`, `TCP_MAX_SEND_SIZE`) or
//! programmatically with [`Config::apply`] before the runtime starts.
//! The configuration is frozen the first time the runtime reads it.

use std::env;
use std::sync::OnceLock;

static CONFIG: OnceLock<Config> = OnceLock::new();

/// Process-level runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of scheduler threads. `0` means one per CPU. Values above
    /// the CPU count are clamped.
    pub sched_num: u32,

    /// Stack size of each coroutine, in bytes.
    pub stack_size: usize,

    /// Chunk size for `sock::recvn` loops.
    pub tcp_max_recv_size: usize,

    /// Chunk size for `sock::send` loops.
    pub tcp_max_send_size: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            sched_num: env_or("CO_SCHED_NUM", 0),
            stack_size: env_or("CO_STACK_SIZE", 1024 * 1024),
            tcp_max_recv_size: env_or("TCP_MAX_RECV_SIZE", 1024 * 1024),
            tcp_max_send_size: env_or("TCP_MAX_SEND_SIZE", 1024 * 1024),
        }
    }
}

impl Config {
    pub fn new() -> Config {
        Default::default()
    }

    pub fn sched_num(mut self, n: u32) -> Config {
        self.sched_num = n;
        self
    }

    pub fn stack_size(mut self, bytes: usize) -> Config {
        self.stack_size = bytes;
        self
    }

    pub fn tcp_max_recv_size(mut self, bytes: usize) -> Config {
        self.tcp_max_recv_size = bytes;
        self
    }

    pub fn tcp_max_send_size(mut self, bytes: usize) -> Config {
        self.tcp_max_send_size = bytes;
        self
    }

    /// Install this configuration. Returns `false` if the runtime has
    /// already been configured (or started), in which case nothing
    /// changes.
    pub fn apply(self) -> bool {
        CONFIG.set(self).is_ok()
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

pub(crate) fn get() -> &'static Config {
    CONFIG.get_or_init(Config::default)
}

/// Upper bound on the number of schedulers, fixed at first use.
///
/// Per-scheduler storage (see `sync::Pool`) is sized from this value.
pub(crate) fn max_sched_num() -> usize {
    static N: OnceLock<usize> = OnceLock::new();
    *N.get_or_init(num_cpus::get)
}

#[cfg(test)]
mod test {
    use super::Config;

    #[test]
    fn test_defaults() {
        let cfg = Config::new();
        assert_eq!(cfg.stack_size, 1024 * 1024);
        assert_eq!(cfg.tcp_max_recv_size, 1024 * 1024);
        assert_eq!(cfg.tcp_max_send_size, 1024 * 1024);
    }

    #[test]
    fn test_builder() {
        let cfg = Config::new().sched_num(2).stack_size(64 * 1024);
        assert_eq!(cfg.sched_num, 2);
        assert_eq!(cfg.stack_size, 64 * 1024);
    }
}
