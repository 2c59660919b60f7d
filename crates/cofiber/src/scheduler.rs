// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! N:M fiber scheduler.
//!
//! A pool of OS threads, optionally including the thread that created the
//! scheduler, pull tasks from one FIFO queue and run them as fibers. What
//! a thread does when the queue is empty, and how other threads get woken,
//! depends on the [`Driver`]: the plain driver spins, the epoll driver
//! blocks in the reactor (see `iomanager`).

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::error::Result;
use crate::fiber::{self, panic_message, Fiber, State};
use crate::hook;
use crate::iomanager::Reactor;
use crate::sys::{self, Tid};
use crate::thread::{self, Thread};

/// Unit of work.
pub enum Task {
    /// Resume this fiber.
    Fiber(Arc<Fiber>),
    /// Run this closure on a scheduler-owned fiber.
    Call(Box<dyn FnOnce() + Send + 'static>),
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Task::Fiber(fiber) => f.debug_tuple("Fiber").field(&fiber.id()).finish(),
            Task::Call(_) => f.write_str("Call"),
        }
    }
}

struct ScheduleTask {
    task: Task,
    /// Kernel thread the task is pinned to.
    thread: Option<Tid>,
}

/// Idle/wakeup strategy of a scheduler.
pub(crate) enum Driver {
    /// Idle threads spin, yielding back into the loop until stop.
    Spin,
    /// Idle threads wait in epoll.
    Epoll(Reactor),
}

thread_local! {
    static CURRENT_SCHEDULER: RefCell<Option<Arc<Scheduler>>> = const { RefCell::new(None) };
}

#[inline(never)]
fn set_current(sched: Option<Arc<Scheduler>>) {
    let old = CURRENT_SCHEDULER.with(|s| std::mem::replace(&mut *s.borrow_mut(), sched));
    drop(old);
}

pub struct Scheduler {
    name: String,
    tasks: Mutex<VecDeque<ScheduleTask>>,
    workers: Mutex<Vec<Thread>>,
    thread_ids: Mutex<Vec<Tid>>,
    /// Threads to spawn; excludes the caller thread.
    thread_count: usize,
    active: AtomicUsize,
    idle: AtomicUsize,
    stopping: AtomicBool,
    use_caller: bool,
    /// Scheduling fiber of the caller thread when `use_caller` is set.
    root_fiber: Mutex<Option<Arc<Fiber>>>,
    root_thread: Option<Tid>,
    skipped_running: AtomicU64,
    driver: Driver,
}

impl Scheduler {
    /// Scheduler over `threads` execution contexts.
    ///
    /// With `use_caller` the calling thread counts as one of them: it only
    /// runs tasks while it is inside [`stop`](Self::stop).
    pub fn new(threads: usize, use_caller: bool, name: impl Into<String>) -> Arc<Scheduler> {
        Self::with_driver(threads, use_caller, name.into(), Driver::Spin)
    }

    pub(crate) fn with_driver(
        threads: usize,
        use_caller: bool,
        name: String,
        driver: Driver,
    ) -> Arc<Scheduler> {
        assert!(threads > 0, "a scheduler needs at least one thread");

        let sched = Arc::new(Scheduler {
            name,
            tasks: Mutex::new(VecDeque::new()),
            workers: Mutex::new(Vec::new()),
            thread_ids: Mutex::new(Vec::new()),
            thread_count: if use_caller { threads - 1 } else { threads },
            active: AtomicUsize::new(0),
            idle: AtomicUsize::new(0),
            stopping: AtomicBool::new(false),
            use_caller,
            root_fiber: Mutex::new(None),
            root_thread: use_caller.then(sys::gettid),
            skipped_running: AtomicU64::new(0),
            driver,
        });

        if use_caller {
            fiber::current();
            assert!(
                Scheduler::current().is_none(),
                "this thread already belongs to a scheduler"
            );
            set_current(Some(sched.clone()));

            let weak = Arc::downgrade(&sched);
            let root = Fiber::new(
                move || {
                    if let Some(sched) = weak.upgrade() {
                        sched.run();
                    }
                },
                0,
                false,
            );
            fiber::set_scheduling_fiber(Some(root.clone()));
            thread::set_current_name(&sched.name);
            *sched.root_fiber.lock() = Some(root);
            sched.thread_ids.lock().push(sys::gettid());
        }

        debug!(scheduler = %sched.name, threads, use_caller, "scheduler created");
        sched
    }

    /// Scheduler the calling thread works for.
    #[inline(never)]
    pub fn current() -> Option<Arc<Scheduler>> {
        CURRENT_SCHEDULER
            .try_with(|s| s.borrow().clone())
            .ok()
            .flatten()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kernel ids of every thread running the scheduling loop.
    pub fn thread_ids(&self) -> Vec<Tid> {
        self.thread_ids.lock().clone()
    }

    pub fn has_idle_threads(&self) -> bool {
        self.idle.load(Ordering::Acquire) > 0
    }

    pub(crate) fn idle_threads(&self) -> usize {
        self.idle.load(Ordering::Acquire)
    }

    /// Threads currently running a task.
    pub fn active_threads(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Tasks waiting in the queue.
    pub fn pending_tasks(&self) -> usize {
        self.tasks.lock().len()
    }

    /// How often a queued fiber was passed over because it had not
    /// finished switching out yet.
    pub fn skipped_running(&self) -> u64 {
        self.skipped_running.load(Ordering::Relaxed)
    }

    /// The reactor, if this scheduler is driven by epoll.
    pub fn reactor(&self) -> Option<&Reactor> {
        match &self.driver {
            Driver::Epoll(reactor) => Some(reactor),
            Driver::Spin => None,
        }
    }

    /// Queue a closure on any thread.
    pub fn schedule<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_on(Task::Call(Box::new(f)), None);
    }

    /// Queue a fiber to be resumed on any thread.
    pub fn schedule_fiber(&self, fiber: Arc<Fiber>) {
        self.schedule_on(Task::Fiber(fiber), None);
    }

    /// Queue a task, optionally pinned to one kernel thread.
    pub fn schedule_on(&self, task: Task, thread: Option<Tid>) {
        let need_tickle = {
            let mut tasks = self.tasks.lock();
            let was_empty = tasks.is_empty();
            tasks.push_back(ScheduleTask { task, thread });
            was_empty
        };
        if need_tickle {
            self.tickle();
        }
    }

    /// Spawn the worker threads.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut workers = self.workers.lock();
        if self.stopping.load(Ordering::Acquire) {
            warn!(scheduler = %self.name, "start called on a stopped scheduler");
            return Ok(());
        }
        if !workers.is_empty() {
            return Ok(());
        }
        for i in 0..self.thread_count {
            let sched = self.clone();
            let worker = Thread::spawn(format!("{}_{}", self.name, i), move || sched.run())?;
            self.thread_ids.lock().push(worker.id());
            workers.push(worker);
        }
        debug!(scheduler = %self.name, workers = self.thread_count, "scheduler started");
        Ok(())
    }

    /// Drain the queue, stop every scheduling loop and join the workers.
    ///
    /// With `use_caller`, call this from the creating thread: that thread
    /// runs its share of the remaining work here. Otherwise call it from a
    /// thread that does not belong to the scheduler. A second call is a no-op.
    pub fn stop(self: &Arc<Self>) {
        if self.is_stopping() {
            return;
        }

        let on_own_thread = Scheduler::current().map_or(false, |s| Arc::ptr_eq(&s, self));
        if self.use_caller {
            assert!(
                on_own_thread,
                "stop() must be called from the thread that created the scheduler"
            );
        } else {
            assert!(
                !on_own_thread,
                "stop() cannot be called from one of the scheduler's threads"
            );
        }
        self.stopping.store(true, Ordering::Release);
        debug!(scheduler = %self.name, "stopping");

        for _ in 0..self.thread_count {
            self.tickle();
        }

        let root = self.root_fiber.lock().clone();
        if let Some(root) = root {
            self.tickle();
            if root.state() == State::Ready {
                root.resume();
            }
        }

        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            let name = worker.name().to_string();
            if let Err(payload) = worker.join() {
                warn!(thread = %name, "worker thread panicked: {}", panic_message(&*payload));
            }
        }

        if self.use_caller {
            set_current(None);
            fiber::set_scheduling_fiber(None);
        }
        debug!(scheduler = %self.name, "stopped");
    }

    /// True once stop was requested and nothing is left to run.
    pub fn is_stopping(&self) -> bool {
        match &self.driver {
            Driver::Spin => self.base_stopping(),
            Driver::Epoll(reactor) => reactor.stopping(self),
        }
    }

    pub(crate) fn base_stopping(&self) -> bool {
        let tasks = self.tasks.lock();
        self.stopping.load(Ordering::Acquire)
            && tasks.is_empty()
            && self.active.load(Ordering::Acquire) == 0
    }

    /// Wake a thread parked in idle.
    pub(crate) fn tickle(&self) {
        match &self.driver {
            Driver::Spin => trace!(scheduler = %self.name, "tickle"),
            Driver::Epoll(reactor) => {
                if self.has_idle_threads() {
                    reactor.tickle();
                }
            }
        }
    }

    fn idle(&self) {
        match &self.driver {
            Driver::Spin => {
                while !self.is_stopping() {
                    fiber::yield_current();
                }
            }
            Driver::Epoll(reactor) => reactor.idle(self),
        }
    }

    /// The scheduling loop. Pool threads run it as their thread body; the
    /// caller thread runs it inside its root fiber.
    fn run(self: &Arc<Self>) {
        let tid = sys::gettid();
        debug!(scheduler = %self.name, tid, "scheduling loop entered");
        hook::set_hook_enable(true);
        set_current(Some(self.clone()));
        if Some(tid) != self.root_thread {
            fiber::set_scheduling_fiber(Some(fiber::current()));
        }

        let idle_fiber = {
            let sched = self.clone();
            Fiber::new(move || sched.idle(), 0, true)
        };
        let mut cb_fiber: Option<Arc<Fiber>> = None;

        loop {
            let mut tickle_me = false;
            let mut skipped = false;
            let mut picked = None;
            {
                let mut tasks = self.tasks.lock();
                let mut i = 0;
                while i < tasks.len() {
                    let entry = &tasks[i];
                    if entry.thread.map_or(false, |t| t != tid) {
                        tickle_me = true;
                        i += 1;
                        continue;
                    }
                    if let Task::Fiber(f) = &entry.task {
                        // Re-armed by another thread before it finished
                        // switching out; pick it up on a later pass.
                        if f.state() == State::Running {
                            self.skipped_running.fetch_add(1, Ordering::Relaxed);
                            trace!(fiber = f.id(), "skipping fiber still switching out");
                            skipped = true;
                            i += 1;
                            continue;
                        }
                    }
                    picked = tasks.remove(i);
                    self.active.fetch_add(1, Ordering::AcqRel);
                    break;
                }
                tickle_me |= i < tasks.len();
            }

            if tickle_me {
                self.tickle();
            }

            match picked.map(|entry| entry.task) {
                Some(Task::Fiber(f)) => {
                    self.resume_task(&f);
                    self.active.fetch_sub(1, Ordering::AcqRel);
                }
                Some(Task::Call(cb)) => {
                    let f = match cb_fiber.take() {
                        Some(f) if f.state() == State::Term => {
                            f.reset(cb);
                            f
                        }
                        _ => Fiber::new(cb, 0, true),
                    };
                    self.resume_task(&f);
                    self.active.fetch_sub(1, Ordering::AcqRel);
                    // A callback that yielded is owned by whoever will
                    // resume it; only finished ones are reused.
                    if f.state() == State::Term {
                        cb_fiber = Some(f);
                    }
                }
                None if skipped => std::thread::yield_now(),
                None => {
                    if idle_fiber.state() == State::Term {
                        break;
                    }
                    self.idle.fetch_add(1, Ordering::AcqRel);
                    self.resume_task(&idle_fiber);
                    self.idle.fetch_sub(1, Ordering::AcqRel);
                }
            }
        }

        hook::set_hook_enable(false);
        set_current(None);
        if Some(tid) != self.root_thread {
            fiber::clear_thread_fibers();
        }
        debug!(scheduler = %self.name, tid, "scheduling loop exited");
    }

    fn resume_task(&self, f: &Arc<Fiber>) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| f.resume())) {
            warn!(
                scheduler = %self.name,
                fiber = f.id(),
                "task panicked: {}",
                panic_message(&*payload)
            );
        }
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.name)
            .field("threads", &self.thread_count)
            .field("use_caller", &self.use_caller)
            .field("active", &self.active_threads())
            .field("idle", &self.idle_threads())
            .finish()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if !self.stopping.load(Ordering::Acquire) {
            warn!(scheduler = %self.name, "scheduler dropped without stop()");
        }
    }
}
