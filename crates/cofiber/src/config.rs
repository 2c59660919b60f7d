// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Process-wide runtime configuration.
//!
//! Values are read from the environment on first access and can be
//! replaced at runtime with [`set`]. Readers always get a copy, so a
//! change only affects fibers, connects and reactor waits started after it.

use std::str::FromStr;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use tracing::{info, warn};

/// Default fiber stack size (128 KiB).
pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

/// Default timeout for hooked `connect`, in milliseconds.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;

/// Upper bound on a single reactor wait, in milliseconds.
pub const DEFAULT_MAX_WAIT_MS: u64 = 5000;

/// Events fetched per `epoll_wait` call.
pub const DEFAULT_MAX_EVENTS: usize = 256;

const ENV_STACK_SIZE: &str = "COFIBER_STACK_SIZE";
const ENV_CONNECT_TIMEOUT: &str = "COFIBER_CONNECT_TIMEOUT_MS";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Stack size used when a fiber is created with size 0.
    pub fiber_stack_size: usize,
    /// Timeout for hooked `connect` on sockets without a send timeout.
    /// `None` waits forever.
    pub tcp_connect_timeout_ms: Option<u64>,
    pub max_wait_ms: u64,
    pub max_events: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            fiber_stack_size: DEFAULT_STACK_SIZE,
            tcp_connect_timeout_ms: Some(DEFAULT_CONNECT_TIMEOUT_MS),
            max_wait_ms: DEFAULT_MAX_WAIT_MS,
            max_events: DEFAULT_MAX_EVENTS,
        }
    }
}

impl Config {
    /// Defaults, overridden by `COFIBER_STACK_SIZE` and
    /// `COFIBER_CONNECT_TIMEOUT_MS` when they are set and parse.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(size) = env_value::<usize>(ENV_STACK_SIZE) {
            if size > 0 {
                cfg.fiber_stack_size = size;
            }
        }
        if let Some(ms) = env_value::<i64>(ENV_CONNECT_TIMEOUT) {
            cfg.tcp_connect_timeout_ms = timeout_from_millis(ms);
        }
        cfg
    }
}

/// Non-positive values mean "no timeout".
pub(crate) fn timeout_from_millis(ms: i64) -> Option<u64> {
    if ms > 0 {
        Some(ms as u64)
    } else {
        None
    }
}

fn env_value<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparsable configuration value");
            None
        }
    }
}

static CONFIG: Lazy<RwLock<Config>> = Lazy::new(|| RwLock::new(Config::from_env()));

/// Snapshot of the current configuration.
pub fn get() -> Config {
    *CONFIG.read()
}

/// Replace the process-wide configuration.
pub fn set(cfg: Config) {
    info!(?cfg, "runtime configuration updated");
    *CONFIG.write() = cfg;
}
