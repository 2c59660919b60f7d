// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! N:M stackful coroutine runtime for Linux.
//!
//! Fibers are multiplexed over a pool of OS threads. Blocking socket calls
//! and sleeps made through [`hook`] park the calling fiber on an epoll
//! reactor instead of the thread, so sequential code gets asynchronous
//! behaviour.
//!
//! Components:
//! - fiber: stackful coroutines over `ucontext`
//! - timer: deadline-ordered one-shot, recurring and condition timers
//! - scheduler: thread pool with a shared FIFO task queue and thread affinity
//! - iomanager: epoll reactor, wakeup pipe and the `IoManager` handle
//! - hook: fiber-aware `read`/`connect`/`sleep`/...; exported as C symbols
//!   with the `interpose` feature
//! - fd: per-fd metadata consulted by the hooks
//!
//! ```no_run
//! use cofiber::IoManager;
//!
//! let iom = IoManager::new(2, false, "io").unwrap();
//! iom.schedule(|| {
//!     unsafe { cofiber::hook::sleep(1) };
//!     println!("woke up");
//! });
//! drop(iom); // waits for the sleeper
//! ```

pub mod config;
mod context;
pub mod error;
pub mod fd;
pub mod fiber;
pub mod hook;
pub mod iomanager;
pub mod scheduler;
pub mod sync;
pub mod sys;
pub mod thread;
pub mod timer;

pub use config::Config;
pub use error::{Error, Result};
pub use fd::{FdCtx, FdManager, TimeoutKind};
pub use fiber::{Fiber, State};
pub use iomanager::{Event, IoManager, Reactor};
pub use scheduler::{Scheduler, Task};
pub use timer::{Timer, TimerManager};
