// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Deadline-ordered timers.
//!
//! The manager never runs callbacks itself: [`TimerManager::drain_expired`]
//! hands the due ones to the caller, which turns them into scheduler
//! tasks. Lock order is manager set first, then the individual timer.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use once_cell::sync::{Lazy, OnceCell};
use parking_lot::{Mutex, RwLock};
use tracing::{trace, warn};

/// Backward clock jump that invalidates every deadline.
const ROLLOVER_MS: u64 = 60 * 60 * 1000;

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

/// Milliseconds on the process-wide monotonic clock.
pub fn now_ms() -> u64 {
    static ORIGIN: Lazy<Instant> = Lazy::new(Instant::now);
    ORIGIN.elapsed().as_millis() as u64
}

/// Timer callback. Shared so recurring timers can hand it out repeatedly.
pub type Callback = Arc<dyn Fn() + Send + Sync + 'static>;

type Key = (u64, u64);

pub struct Timer {
    id: u64,
    inner: Mutex<TimerState>,
    manager: Weak<TimerShared>,
}

struct TimerState {
    ms: u64,
    next: u64,
    recurring: bool,
    /// `None` once cancelled or fired (one-shot).
    cb: Option<Callback>,
}

impl Timer {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Absolute deadline on the [`now_ms`] clock.
    pub fn next_deadline(&self) -> u64 {
        self.inner.lock().next
    }

    pub fn period(&self) -> u64 {
        self.inner.lock().ms
    }

    pub fn is_recurring(&self) -> bool {
        self.inner.lock().recurring
    }

    /// Stop the timer. Returns false if it already fired or was cancelled.
    pub fn cancel(&self) -> bool {
        let Some(mgr) = self.manager.upgrade() else {
            return false;
        };
        let mut set = mgr.set.write();
        let mut st = self.inner.lock();
        if st.cb.take().is_none() {
            return false;
        }
        set.timers.remove(&(st.next, self.id));
        true
    }

    /// Restart the current period from now.
    pub fn refresh(&self) -> bool {
        let Some(mgr) = self.manager.upgrade() else {
            return false;
        };
        let mut set = mgr.set.write();
        let mut st = self.inner.lock();
        if st.cb.is_none() {
            return false;
        }
        let Some(me) = set.timers.remove(&(st.next, self.id)) else {
            return false;
        };
        st.next = now_ms().saturating_add(st.ms);
        set.timers.insert((st.next, self.id), me);
        true
    }

    /// Change the period.
    ///
    /// With `from_now` the new deadline is `now + ms`; otherwise the
    /// phase already elapsed in the current period is kept and the
    /// deadline becomes `period_start + ms`.
    pub fn reset(&self, ms: u64, from_now: bool) -> bool {
        let Some(mgr) = self.manager.upgrade() else {
            return false;
        };
        let at_front = {
            let mut set = mgr.set.write();
            let mut st = self.inner.lock();
            if ms == st.ms && !from_now {
                return true;
            }
            if st.cb.is_none() {
                return false;
            }
            let Some(me) = set.timers.remove(&(st.next, self.id)) else {
                return false;
            };
            let start = if from_now {
                now_ms()
            } else {
                st.next.saturating_sub(st.ms)
            };
            st.ms = ms;
            st.next = start.saturating_add(ms);
            mgr.insert(&mut set, (st.next, self.id), me)
        };
        if at_front {
            mgr.notify_front();
        }
        true
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.inner.lock();
        f.debug_struct("Timer")
            .field("id", &self.id)
            .field("ms", &st.ms)
            .field("next", &st.next)
            .field("recurring", &st.recurring)
            .field("armed", &st.cb.is_some())
            .finish()
    }
}

struct TimerSet {
    timers: BTreeMap<Key, Arc<Timer>>,
    previous_ms: u64,
}

struct TimerShared {
    set: RwLock<TimerSet>,
    /// A front-insert notification is outstanding since the last deadline query.
    tickled: AtomicBool,
    on_front: OnceCell<Box<dyn Fn() + Send + Sync>>,
}

impl TimerShared {
    /// Insert under the write lock; true if the caller should notify.
    fn insert(&self, set: &mut TimerSet, key: Key, timer: Arc<Timer>) -> bool {
        set.timers.insert(key, timer);
        let is_front = set.timers.keys().next() == Some(&key);
        is_front && !self.tickled.swap(true, Ordering::AcqRel)
    }

    fn notify_front(&self) {
        if let Some(hook) = self.on_front.get() {
            hook();
        }
    }
}

/// Ordered set of timers.
pub struct TimerManager {
    shared: Arc<TimerShared>,
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerManager {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(TimerShared {
                set: RwLock::new(TimerSet {
                    timers: BTreeMap::new(),
                    previous_ms: now_ms(),
                }),
                tickled: AtomicBool::new(false),
                on_front: OnceCell::new(),
            }),
        }
    }

    /// Install the hook run when a timer becomes the earliest deadline.
    /// Only the first installation takes effect.
    pub(crate) fn set_front_hook<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        if self.shared.on_front.set(Box::new(hook)).is_err() {
            warn!("timer front hook already installed");
        }
    }

    /// Fire `cb` after `ms` milliseconds, and every `ms` after that if
    /// `recurring`.
    pub fn add_timer<F>(&self, ms: u64, cb: F, recurring: bool) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed);
        let next = now_ms().saturating_add(ms);
        let timer = Arc::new(Timer {
            id,
            inner: Mutex::new(TimerState {
                ms,
                next,
                recurring,
                cb: Some(Arc::new(cb)),
            }),
            manager: Arc::downgrade(&self.shared),
        });

        let at_front = {
            let mut set = self.shared.set.write();
            self.shared.insert(&mut set, (next, id), timer.clone())
        };
        if at_front {
            trace!(timer = id, ms, "timer inserted at front");
            self.shared.notify_front();
        }
        timer
    }

    /// Like [`add_timer`](Self::add_timer), but `cb` is skipped once
    /// `cond` can no longer be upgraded.
    pub fn add_condition_timer<F, T>(
        &self,
        ms: u64,
        cb: F,
        cond: Weak<T>,
        recurring: bool,
    ) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
        T: ?Sized + Send + Sync + 'static,
    {
        self.add_timer(
            ms,
            move || {
                if cond.upgrade().is_some() {
                    cb();
                }
            },
            recurring,
        )
    }

    /// Milliseconds until the earliest deadline; `Some(0)` if one is
    /// already due, `None` if there are no timers.
    pub fn time_until_next(&self) -> Option<u64> {
        self.shared.tickled.store(false, Ordering::Release);
        let set = self.shared.set.read();
        let &(next, _) = set.timers.keys().next()?;
        Some(next.saturating_sub(now_ms()))
    }

    /// Append the callbacks of every due timer to `out`, earliest first.
    pub fn drain_expired(&self, out: &mut Vec<Callback>) {
        self.drain_expired_at(now_ms(), out);
    }

    pub(crate) fn drain_expired_at(&self, now: u64, out: &mut Vec<Callback>) {
        {
            let set = self.shared.set.read();
            if set.timers.is_empty() {
                return;
            }
        }

        let mut set = self.shared.set.write();
        let rollover = now.saturating_add(ROLLOVER_MS) < set.previous_ms;
        set.previous_ms = now;
        if rollover {
            warn!(now, "clock moved backwards, firing every timer");
        }

        let mut expired = Vec::new();
        while let Some(entry) = set.timers.first_entry() {
            if !rollover && entry.key().0 > now {
                break;
            }
            expired.push(entry.remove());
        }

        for timer in expired {
            let mut st = timer.inner.lock();
            let Some(cb) = st.cb.clone() else {
                continue;
            };
            out.push(cb);
            if st.recurring {
                st.next = now.saturating_add(st.ms);
                set.timers.insert((st.next, timer.id), timer.clone());
            } else {
                st.cb = None;
            }
        }
    }

    pub fn has_timer(&self) -> bool {
        !self.shared.set.read().timers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.shared.set.read().timers.len()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_timer()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread::sleep;
    use std::time::Duration;

    fn recorder() -> (Arc<Mutex<Vec<u32>>>, impl Fn(u32) -> Box<dyn Fn() + Send + Sync>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = log.clone();
        let make = move |tag: u32| -> Box<dyn Fn() + Send + Sync> {
            let l = l.clone();
            Box::new(move || l.lock().push(tag))
        };
        (log, make)
    }

    fn run_all(cbs: Vec<Callback>) {
        for cb in cbs {
            cb();
        }
    }

    #[test]
    fn drains_due_timers_in_deadline_order() {
        let mgr = TimerManager::new();
        let (log, make) = recorder();
        let base = now_ms();
        for (tag, ms) in [(1u32, 30u64), (2, 10), (3, 20), (4, 500)] {
            let cb = make(tag);
            mgr.add_timer(ms, move || cb(), false);
        }

        let mut out = Vec::new();
        mgr.drain_expired_at(base + 25, &mut out);
        assert_eq!(out.len(), 2);
        run_all(out);
        assert_eq!(*log.lock(), vec![2, 3]);
        assert_eq!(mgr.len(), 2);
    }

    #[test]
    fn recurring_timer_is_rearmed_from_fire_time() {
        let mgr = TimerManager::new();
        let timer = mgr.add_timer(10, || {}, true);
        let fire_at = now_ms() + 50;

        let mut out = Vec::new();
        mgr.drain_expired_at(fire_at, &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(timer.next_deadline(), fire_at + 10);
        assert_eq!(mgr.len(), 1);
    }

    #[test]
    fn one_shot_timer_disarms_after_firing() {
        let mgr = TimerManager::new();
        let timer = mgr.add_timer(1, || {}, false);
        let mut out = Vec::new();
        mgr.drain_expired_at(now_ms() + 5, &mut out);
        assert_eq!(out.len(), 1);
        assert!(!mgr.has_timer());
        assert!(!timer.cancel());
        assert!(!timer.refresh());
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let mgr = TimerManager::new();
        let timer = mgr.add_timer(5, || panic!("cancelled timer fired"), false);
        assert!(timer.cancel());
        assert!(!timer.cancel());

        let mut out = Vec::new();
        mgr.drain_expired_at(now_ms() + 100, &mut out);
        assert!(out.is_empty());
        assert_eq!(mgr.time_until_next(), None);
    }

    #[test]
    fn time_until_next_reports_earliest() {
        let mgr = TimerManager::new();
        assert_eq!(mgr.time_until_next(), None);
        mgr.add_timer(1000, || {}, false);
        mgr.add_timer(200, || {}, false);
        let wait = mgr.time_until_next().unwrap();
        assert!(wait <= 200 && wait >= 150, "wait = {wait}");
    }

    #[test]
    fn condition_timer_skips_dead_condition() {
        let mgr = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let alive = Arc::new(());
        let h = hits.clone();
        mgr.add_condition_timer(1, move || { h.fetch_add(1, Ordering::SeqCst); }, Arc::downgrade(&alive), false);

        let dead = Arc::new(());
        let weak = Arc::downgrade(&dead);
        drop(dead);
        let h = hits.clone();
        mgr.add_condition_timer(1, move || { h.fetch_add(100, Ordering::SeqCst); }, weak, false);

        let mut out = Vec::new();
        mgr.drain_expired_at(now_ms() + 10, &mut out);
        assert_eq!(out.len(), 2);
        run_all(out);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn front_hook_fires_once_until_queried() {
        let mgr = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        mgr.set_front_hook(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });

        mgr.add_timer(1000, || {}, false);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        // Earlier again, but the previous notification is still pending.
        mgr.add_timer(500, || {}, false);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        // Not at the front.
        mgr.time_until_next();
        mgr.add_timer(5000, || {}, false);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        mgr.add_timer(10, || {}, false);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn clock_rollback_fires_everything() {
        let mgr = TimerManager::new();
        mgr.add_timer(10 * ROLLOVER_MS, || {}, false);
        mgr.add_timer(20 * ROLLOVER_MS, || {}, true);

        let mut out = Vec::new();
        let late = now_ms() + 2 * ROLLOVER_MS;
        mgr.drain_expired_at(late, &mut out);
        assert!(out.is_empty());

        mgr.drain_expired_at(late - ROLLOVER_MS - 1, &mut out);
        assert_eq!(out.len(), 2);
        // The recurring one is back in the set.
        assert_eq!(mgr.len(), 1);
    }

    #[test]
    fn huge_periods_saturate_the_deadline() {
        let mgr = TimerManager::new();
        let timer = mgr.add_timer(u64::MAX, || {}, true);
        assert_eq!(timer.next_deadline(), u64::MAX);
        assert!(mgr.time_until_next().unwrap() > u64::MAX / 2);

        assert!(timer.refresh());
        assert_eq!(timer.next_deadline(), u64::MAX);
        assert!(timer.reset(u64::MAX - 1, true));
        assert_eq!(timer.next_deadline(), u64::MAX);

        // Recurring re-arm after firing saturates as well.
        let mut out = Vec::new();
        mgr.drain_expired_at(u64::MAX, &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(timer.next_deadline(), u64::MAX);
        assert_eq!(mgr.len(), 1);
    }

    #[test]
    fn reset_from_now_restarts_the_period() {
        let mgr = TimerManager::new();
        let timer = mgr.add_timer(1000, || {}, false);
        sleep(Duration::from_millis(200));

        let reset_at = now_ms();
        assert!(timer.reset(500, true));
        let next = timer.next_deadline();
        assert!(next >= reset_at + 500 && next <= reset_at + 505, "next = {next}");
        assert_eq!(timer.period(), 500);
    }

    #[test]
    fn reset_keeping_phase_counts_from_period_start() {
        let mgr = TimerManager::new();
        let timer = mgr.add_timer(1000, || {}, false);
        let start = timer.next_deadline() - 1000;

        assert!(timer.reset(400, false));
        assert_eq!(timer.next_deadline(), start + 400);
        // Same period, not from now: nothing moves.
        assert!(timer.reset(400, false));
        assert_eq!(timer.next_deadline(), start + 400);
        assert_eq!(mgr.len(), 1);
    }

    #[test]
    fn refresh_pushes_deadline_out() {
        let mgr = TimerManager::new();
        let timer = mgr.add_timer(50, || {}, false);
        let first = timer.next_deadline();
        sleep(Duration::from_millis(20));
        assert!(timer.refresh());
        assert!(timer.next_deadline() >= first + 15);
        assert_eq!(mgr.len(), 1);
    }
}
