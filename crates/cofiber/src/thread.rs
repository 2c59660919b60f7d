// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Named OS threads that know their kernel thread id.
//!
//! The scheduler pins tasks to kernel thread ids, so `spawn` does not
//! return until the new thread has published its id.

use std::cell::RefCell;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::debug;

use crate::error::{Error, Result};
use crate::sync::Semaphore;
use crate::sys::{self, Tid};

thread_local! {
    static THREAD_NAME: RefCell<String> = RefCell::new(String::from("UNKNOWN"));
}

/// Display name of the calling thread.
pub fn current_name() -> String {
    THREAD_NAME.with(|n| n.borrow().clone())
}

/// Rename the calling thread (bookkeeping only; the kernel name is set at spawn).
pub fn set_current_name(name: &str) {
    if name.is_empty() {
        return;
    }
    THREAD_NAME.with(|n| *n.borrow_mut() = name.to_string());
}

/// Joinable OS thread.
pub struct Thread {
    id: Tid,
    name: String,
    handle: Option<JoinHandle<()>>,
}

impl Thread {
    /// Start `f` on a new thread called `name`.
    pub fn spawn<F>(name: impl Into<String>, f: F) -> Result<Thread>
    where
        F: FnOnce() + Send + 'static,
    {
        let name = name.into();
        let ready = Arc::new(Semaphore::new(0));
        let tid = Arc::new(AtomicI32::new(0));

        let handle = {
            let ready = ready.clone();
            let tid = tid.clone();
            let thread_name = name.clone();
            std::thread::Builder::new()
                .name(name.clone())
                .spawn(move || {
                    tid.store(sys::gettid(), Ordering::Release);
                    set_current_name(&thread_name);
                    ready.notify();
                    f();
                })
                .map_err(|source| Error::Spawn {
                    name: name.clone(),
                    source,
                })?
        };

        ready.wait();
        let id = tid.load(Ordering::Acquire);
        debug!(thread = %name, tid = id, "thread started");
        Ok(Thread {
            id,
            name,
            handle: Some(handle),
        })
    }

    pub fn id(&self) -> Tid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the thread to finish. `Err` carries its panic payload.
    pub fn join(mut self) -> std::thread::Result<()> {
        match self.handle.take() {
            Some(handle) => handle.join(),
            None => Ok(()),
        }
    }
}
