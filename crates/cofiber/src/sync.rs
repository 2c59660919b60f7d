// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Blocking synchronization helpers for OS threads.
//!
//! Exclusive and reader/writer locks are the `parking_lot` types used
//! throughout the crate. This module adds the counting semaphore the
//! thread wrapper uses to hand its kernel id back to the spawner.

use parking_lot::{Condvar, Mutex};

/// Counting semaphore. Blocks the OS thread, not the fiber.
pub struct Semaphore {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(count: usize) -> Self {
        Self {
            count: Mutex::new(count),
            cond: Condvar::new(),
        }
    }

    /// Take one permit, blocking until one is available.
    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.cond.wait(&mut count);
        }
        *count -= 1;
    }

    /// Take a permit if one is available right now.
    pub fn try_wait(&self) -> bool {
        let mut count = self.count.lock();
        if *count == 0 {
            return false;
        }
        *count -= 1;
        true
    }

    /// Release one permit.
    pub fn notify(&self) {
        *self.count.lock() += 1;
        self.cond.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn permits_are_counted() {
        let sem = Semaphore::new(2);
        assert!(sem.try_wait());
        assert!(sem.try_wait());
        assert!(!sem.try_wait());
        sem.notify();
        assert!(sem.try_wait());
    }

    #[test]
    fn wait_blocks_until_notified() {
        let sem = Arc::new(Semaphore::new(0));
        let passed = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let sem = sem.clone();
                let passed = passed.clone();
                std::thread::spawn(move || {
                    sem.wait();
                    passed.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        for _ in 0..4 {
            sem.notify();
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(passed.load(Ordering::SeqCst), 4);
    }
}
