// SPDX-License-Identifier: (MIT OR Apache-2.0)

//! Scheduler behaviour seen from outside the crate: thread pools, the
//! caller thread, affinity and fiber hand-off between threads.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;

use cofiber::{fiber, sys, Fiber, Scheduler, State, Task};
use parking_lot::Mutex;

#[test]
fn stop_waits_for_both_callbacks() {
    let sched = Scheduler::new(2, false, "pair");
    sched.start().unwrap();
    let done = Arc::new(AtomicUsize::new(0));
    for _ in 0..2 {
        let d = done.clone();
        sched.schedule(move || {
            sleep(Duration::from_millis(50));
            d.fetch_add(1, Ordering::SeqCst);
        });
    }
    sched.stop();
    assert_eq!(done.load(Ordering::SeqCst), 2);
    assert_eq!(sched.active_threads(), 0);
    assert_eq!(sched.pending_tasks(), 0);
}

#[test]
fn workers_carry_scheduler_name() {
    let sched = Scheduler::new(2, false, "named");
    sched.start().unwrap();
    let names = Arc::new(Mutex::new(Vec::new()));
    for _ in 0..4 {
        let n = names.clone();
        sched.schedule(move || n.lock().push(cofiber::thread::current_name()));
    }
    sched.stop();
    for name in names.lock().iter() {
        assert!(name == "named_0" || name == "named_1", "unexpected name {name}");
    }
}

#[test]
fn caller_and_workers_share_the_queue() {
    let sched = Scheduler::new(3, true, "mixed");
    sched.start().unwrap();
    let me = sys::gettid();
    assert_eq!(sched.thread_ids().len(), 3);
    assert_eq!(sched.thread_ids()[0], me);

    let hits = Arc::new(AtomicUsize::new(0));
    for _ in 0..50 {
        let h = hits.clone();
        sched.schedule(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
    }
    // Pinned to the caller: only runs once stop folds it in.
    let ran_on = Arc::new(Mutex::new(None));
    let r = ran_on.clone();
    sched.schedule_on(
        Task::Call(Box::new(move || *r.lock() = Some(sys::gettid()))),
        Some(me),
    );
    sched.stop();
    assert_eq!(hits.load(Ordering::SeqCst), 50);
    assert_eq!(*ran_on.lock(), Some(me));
}

#[test]
fn fiber_hops_between_pinned_threads() {
    let sched = Scheduler::new(2, false, "hops");
    sched.start().unwrap();
    let ids = sched.thread_ids();
    let (first, second) = (ids[0], ids[1]);
    let seen = Arc::new(Mutex::new(Vec::new()));

    let s = seen.clone();
    let f = Fiber::new(
        move || {
            s.lock().push(sys::gettid());
            let me = fiber::current();
            Scheduler::current()
                .unwrap()
                .schedule_on(Task::Fiber(me), Some(second));
            fiber::yield_current();
            s.lock().push(sys::gettid());
        },
        0,
        true,
    );
    sched.schedule_on(Task::Fiber(f.clone()), Some(first));
    sched.stop();

    assert_eq!(*seen.lock(), vec![first, second]);
    assert_eq!(f.state(), State::Term);
}

#[test]
fn many_fibers_yield_and_finish() {
    let sched = Scheduler::new(4, false, "churn");
    sched.start().unwrap();
    let done = Arc::new(AtomicUsize::new(0));
    for _ in 0..200 {
        let d = done.clone();
        sched.schedule(move || {
            for _ in 0..3 {
                let me = fiber::current();
                Scheduler::current().unwrap().schedule_fiber(me);
                fiber::yield_current();
            }
            d.fetch_add(1, Ordering::SeqCst);
        });
    }
    sched.stop();
    assert_eq!(done.load(Ordering::SeqCst), 200);
}
