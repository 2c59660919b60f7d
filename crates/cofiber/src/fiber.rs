// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Stackful fibers.
//!
//! A fiber owns a stack, a saved context and an entry closure. It is
//! resumed by whichever fiber plays the "back" role on the current thread
//! and yields back to the same one:
//!
//! - fibers that run under a scheduler switch against the thread's
//!   scheduling fiber,
//! - every other fiber switches against the thread's main fiber.
//!
//! On pool threads those two are the same fiber. On a thread that was
//! folded into a scheduler they differ, which is what lets the scheduler
//! hand that thread back to its original code on stop.
//!
//! Fibers migrate between OS threads, so every thread-local access below
//! goes through an `#[inline(never)]` function and no thread-local address
//! is ever held across a context switch.

use std::any::Any;
use std::cell::{RefCell, UnsafeCell};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use tracing::{debug, error, trace};

use crate::config;
use crate::context::{self, Context, Stack};

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);
static LIVE_FIBERS: AtomicU64 = AtomicU64::new(0);

/// Fiber lifecycle.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Constructed or reset, or suspended by a yield.
    Ready = 0,
    /// Executing on some thread.
    Running = 1,
    /// Entry closure has returned.
    Term = 2,
}

impl State {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Ready,
            1 => Self::Running,
            _ => Self::Term,
        }
    }
}

type Entry = Box<dyn FnOnce() + Send + 'static>;

pub struct Fiber {
    id: u64,
    state: AtomicU8,
    ctx: UnsafeCell<Context>,
    /// `None` for a thread main fiber.
    stack: Option<Stack>,
    entry: UnsafeCell<Option<Entry>>,
    run_in_scheduler: bool,
    panic: UnsafeCell<Option<Box<dyn Any + Send>>>,
}

// The cells are only touched by the thread that is currently switching
// into or out of the fiber; the RUNNING state keeps everyone else out.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

thread_local! {
    static CURRENT: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
    static THREAD_MAIN: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
    static SCHEDULING: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
}

impl Fiber {
    /// New fiber in READY state.
    ///
    /// `stack_size == 0` picks the configured default. `run_in_scheduler`
    /// selects which fiber it switches against (see module docs).
    pub fn new<F>(entry: F, stack_size: usize, run_in_scheduler: bool) -> Arc<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        let size = if stack_size == 0 {
            config::get().fiber_stack_size
        } else {
            stack_size
        };
        let stack = Stack::new(size);
        let ctx = Context::with_stack(&stack, fiber_main);
        let id = NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed);
        LIVE_FIBERS.fetch_add(1, Ordering::Relaxed);
        debug!(fiber = id, stack_size = size, "fiber created");

        Arc::new(Fiber {
            id,
            state: AtomicU8::new(State::Ready as u8),
            ctx: UnsafeCell::new(ctx),
            stack: Some(stack),
            entry: UnsafeCell::new(Some(Box::new(entry))),
            run_in_scheduler,
            panic: UnsafeCell::new(None),
        })
    }

    /// The implicit fiber standing for a thread's original stack.
    fn new_main() -> Arc<Fiber> {
        let id = NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed);
        LIVE_FIBERS.fetch_add(1, Ordering::Relaxed);
        debug!(fiber = id, "thread main fiber created");

        Arc::new(Fiber {
            id,
            state: AtomicU8::new(State::Running as u8),
            ctx: UnsafeCell::new(Context::empty()),
            stack: None,
            entry: UnsafeCell::new(None),
            run_in_scheduler: false,
            panic: UnsafeCell::new(None),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn runs_in_scheduler(&self) -> bool {
        self.run_in_scheduler
    }

    /// Size of the owned stack; 0 for a thread main fiber.
    pub fn stack_size(&self) -> usize {
        self.stack.as_ref().map_or(0, Stack::size)
    }

    /// Switch into this fiber. Returns once it yields or finishes.
    ///
    /// Panics unless the fiber is READY. A panic raised by the entry
    /// closure is re-raised here, on the resuming thread.
    pub fn resume(self: &Arc<Self>) {
        let state = self.state();
        assert!(
            state == State::Ready,
            "cannot resume fiber {} in state {:?}",
            self.id,
            state
        );
        let back = self.back_fiber();
        set_current(Some(self.clone()));
        self.state.store(State::Running as u8, Ordering::Release);
        trace!(fiber = self.id, "resume");

        // SAFETY: `self` is READY, so its context is either freshly
        // prepared or fully saved, and nobody else can switch into it now
        // that it is RUNNING. `back` is the fiber executing this call.
        unsafe { context::swap(back.ctx.get(), self.ctx.get()) };

        // SAFETY: the fiber is suspended or finished and not yet
        // published as READY; its slot is ours.
        let payload = unsafe { (*self.panic.get()).take() };

        // The fiber's registers are saved by now; only from here on can
        // another thread safely pick it up again.
        let _ = self.state.compare_exchange(
            State::Running as u8,
            State::Ready as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );

        if let Some(payload) = payload {
            panic::resume_unwind(payload);
        }
    }

    /// Switch back to whichever fiber resumed this one.
    ///
    /// Must be called on the running fiber itself. Panics if the fiber is
    /// neither RUNNING nor TERM, or if it is a thread main fiber.
    pub fn yield_now(&self) {
        let state = self.state();
        assert!(
            matches!(state, State::Running | State::Term),
            "cannot yield fiber {} in state {:?}",
            self.id,
            state
        );
        assert!(
            self.stack.is_some(),
            "a thread main fiber has nothing to yield to"
        );

        let back = self.back_fiber();
        let to = back.ctx.get();
        set_current(Some(back));
        trace!(fiber = self.id, ?state, "yield");

        // SAFETY: `self` is the running fiber; `to` is kept alive by the
        // thread-local slots it was read from.
        unsafe { context::swap(self.ctx.get(), to) };
    }

    /// Reuse a finished fiber's stack for a new entry closure.
    pub fn reset<F>(&self, entry: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(stack) = self.stack.as_ref() else {
            panic!("cannot reset thread main fiber {}", self.id);
        };
        let state = self.state();
        assert!(
            state == State::Term,
            "cannot reset fiber {} in state {:?}",
            self.id,
            state
        );
        // SAFETY: a TERM fiber is not running anywhere and is never
        // switched into again until it is READY.
        unsafe {
            *self.entry.get() = Some(Box::new(entry));
            (*self.ctx.get()).prepare(stack, fiber_main);
        }
        self.state.store(State::Ready as u8, Ordering::Release);
    }

    fn back_fiber(&self) -> Arc<Fiber> {
        if self.run_in_scheduler {
            scheduling_fiber()
        } else {
            main_fiber()
        }
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("run_in_scheduler", &self.run_in_scheduler)
            .finish()
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        LIVE_FIBERS.fetch_sub(1, Ordering::Relaxed);
        debug!(fiber = self.id, state = ?self.state(), "fiber destroyed");
    }
}

/// First frame of every fiber stack.
extern "C" fn fiber_main() {
    let cur = current();
    // SAFETY: we are the running fiber; nobody else touches the slot.
    let entry = unsafe { (*cur.entry.get()).take() };
    if let Some(entry) = entry {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(entry)) {
            error!(fiber = cur.id, "fiber entry panicked: {}", panic_message(&*payload));
            unsafe { *cur.panic.get() = Some(payload) };
        }
    }
    cur.state.store(State::Term as u8, Ordering::Release);

    // Drop our reference before leaving for good: this frame never
    // unwinds. The resumer still holds the fiber alive.
    let raw = Arc::as_ptr(&cur);
    drop(cur);
    unsafe { (*raw).yield_now() };
    unreachable!("finished fiber was resumed");
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// The fiber running on this thread, creating the thread main fiber on
/// first use.
#[inline(never)]
pub fn current() -> Arc<Fiber> {
    if let Some(f) = CURRENT.with(|c| c.borrow().clone()) {
        return f;
    }
    let main = Fiber::new_main();
    THREAD_MAIN.with(|m| *m.borrow_mut() = Some(main.clone()));
    CURRENT.with(|c| *c.borrow_mut() = Some(main.clone()));
    main
}

/// Id of the running fiber, 0 if this thread has none yet.
#[inline(never)]
pub fn current_id() -> u64 {
    CURRENT
        .try_with(|c| c.borrow().as_ref().map_or(0, |f| f.id))
        .unwrap_or(0)
}

/// Number of fibers currently alive in the process.
pub fn total_fibers() -> u64 {
    LIVE_FIBERS.load(Ordering::Relaxed)
}

/// Yield the running fiber.
pub fn yield_current() {
    let cur = current();
    let raw = Arc::as_ptr(&cur);
    // Whoever re-schedules us holds their own reference.
    drop(cur);
    unsafe { (*raw).yield_now() };
}

#[inline(never)]
fn set_current(fiber: Option<Arc<Fiber>>) {
    let old = CURRENT.with(|c| std::mem::replace(&mut *c.borrow_mut(), fiber));
    drop(old);
}

#[inline(never)]
fn main_fiber() -> Arc<Fiber> {
    if let Some(f) = THREAD_MAIN.with(|m| m.borrow().clone()) {
        return f;
    }
    current();
    THREAD_MAIN.with(|m| m.borrow().clone()).unwrap_or_else(current)
}

#[inline(never)]
fn scheduling_fiber() -> Arc<Fiber> {
    SCHEDULING
        .with(|s| s.borrow().clone())
        .unwrap_or_else(main_fiber)
}

/// Install (or clear) the fiber that scheduled fibers yield back to.
#[inline(never)]
pub(crate) fn set_scheduling_fiber(fiber: Option<Arc<Fiber>>) {
    let old = SCHEDULING.with(|s| std::mem::replace(&mut *s.borrow_mut(), fiber));
    drop(old);
}

/// Forget this thread's fibers. Only valid on the thread main fiber.
#[inline(never)]
pub(crate) fn clear_thread_fibers() {
    set_scheduling_fiber(None);
    let main = THREAD_MAIN.with(|m| m.borrow_mut().take());
    set_current(None);
    drop(main);
}
