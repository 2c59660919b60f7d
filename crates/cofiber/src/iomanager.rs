// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Epoll reactor and the scheduler built on it.
//!
//! Edge-triggered epoll. Registrations are one-shot per direction: when a
//! direction fires (or is cancelled) its waiter is handed to the scheduler
//! and the interest is dropped, so waiters re-arm after every wakeup.
//! Idle scheduler threads block in `epoll_wait`; a self-pipe wakes them.

use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use bitflags::bitflags;
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use crate::config;
use crate::error::{Error, Result};
use crate::fiber::{self, Fiber, State};
use crate::scheduler::{Driver, Scheduler, Task};
use crate::sys::{self, Tid};
use crate::timer::{Timer, TimerManager};

const INITIAL_CONTEXTS: usize = 32;

bitflags! {
    /// I/O direction. Values match `EPOLLIN` / `EPOLLOUT`.
    pub struct Event: u32 {
        const READ = 0x1;
        const WRITE = 0x4;
    }
}

type Callback = Box<dyn FnOnce() + Send + 'static>;

/// What to wake when one direction of an fd fires.
#[derive(Default)]
struct EventContext {
    scheduler: Option<Weak<Scheduler>>,
    fiber: Option<Arc<Fiber>>,
    cb: Option<Callback>,
}

impl EventContext {
    fn is_empty(&self) -> bool {
        self.scheduler.is_none() && self.fiber.is_none() && self.cb.is_none()
    }

    /// Hand the waiter to its scheduler.
    fn fire(self) {
        let Some(sched) = self.scheduler.and_then(|w| w.upgrade()) else {
            warn!("event fired after its scheduler was dropped");
            return;
        };
        if let Some(cb) = self.cb {
            sched.schedule_on(Task::Call(cb), None);
        } else if let Some(fiber) = self.fiber {
            sched.schedule_fiber(fiber);
        }
    }
}

#[derive(Default)]
struct FdState {
    events: Event,
    read: EventContext,
    write: EventContext,
}

impl FdState {
    fn slot(&mut self, event: Event) -> &mut EventContext {
        if event == Event::READ {
            &mut self.read
        } else {
            &mut self.write
        }
    }

    fn take(&mut self, event: Event) -> EventContext {
        std::mem::take(self.slot(event))
    }
}

impl Default for Event {
    fn default() -> Self {
        Event::empty()
    }
}

struct FdContext {
    state: Mutex<FdState>,
}

fn op_name(op: libc::c_int) -> &'static str {
    match op {
        libc::EPOLL_CTL_ADD => "EPOLL_CTL_ADD",
        libc::EPOLL_CTL_MOD => "EPOLL_CTL_MOD",
        _ => "EPOLL_CTL_DEL",
    }
}

/// Epoll instance, wakeup pipe, per-fd waiters and timers.
pub struct Reactor {
    epfd: RawFd,
    tickle_fds: [RawFd; 2],
    contexts: RwLock<Vec<Arc<FdContext>>>,
    pending: AtomicUsize,
    timers: TimerManager,
    owner: OnceCell<Weak<Scheduler>>,
    max_events: usize,
    max_wait_ms: u64,
}

impl Reactor {
    pub(crate) fn new() -> Result<Reactor> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(Error::EpollCreate(io::Error::last_os_error()));
        }

        let mut fds = [0; 2];
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) } != 0 {
            let err = io::Error::last_os_error();
            sys::close_quietly(epfd);
            return Err(Error::Pipe(err));
        }

        let mut ev = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLET) as u32,
            u64: fds[0] as u64,
        };
        if unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, fds[0], &mut ev) } != 0 {
            let source = io::Error::last_os_error();
            for fd in [fds[0], fds[1], epfd] {
                sys::close_quietly(fd);
            }
            return Err(Error::EpollCtl {
                op: "EPOLL_CTL_ADD",
                fd: fds[0],
                source,
            });
        }

        let cfg = config::get();
        let reactor = Reactor {
            epfd,
            tickle_fds: fds,
            contexts: RwLock::new(Vec::new()),
            pending: AtomicUsize::new(0),
            timers: TimerManager::new(),
            owner: OnceCell::new(),
            max_events: cfg.max_events.max(1),
            max_wait_ms: cfg.max_wait_ms,
        };
        grow(&mut reactor.contexts.write(), INITIAL_CONTEXTS);
        debug!(epfd, "reactor created");
        Ok(reactor)
    }

    pub(crate) fn set_owner(&self, owner: Weak<Scheduler>) {
        let _ = self.owner.set(owner);
    }

    pub fn timers(&self) -> &TimerManager {
        &self.timers
    }

    /// Registered directions that have not fired yet.
    pub fn pending_events(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    fn fd_context(&self, fd: RawFd, create: bool) -> Option<Arc<FdContext>> {
        if fd < 0 {
            return None;
        }
        let idx = fd as usize;
        {
            let contexts = self.contexts.read();
            if let Some(ctx) = contexts.get(idx) {
                return Some(ctx.clone());
            }
            if !create {
                return None;
            }
        }
        let mut contexts = self.contexts.write();
        grow(&mut contexts, idx + idx / 2 + 1);
        Some(contexts[idx].clone())
    }

    /// Resume the running fiber once `fd` is ready for `event`.
    ///
    /// Panics if `event` is already registered on `fd`.
    pub fn add_event(&self, fd: RawFd, event: Event) -> Result<()> {
        self.arm(fd, event, None)
    }

    /// Schedule `cb` once `fd` is ready for `event`.
    pub fn add_event_callback<F>(&self, fd: RawFd, event: Event, cb: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.arm(fd, event, Some(Box::new(cb)))
    }

    fn arm(&self, fd: RawFd, event: Event, cb: Option<Callback>) -> Result<()> {
        assert!(
            event == Event::READ || event == Event::WRITE,
            "exactly one direction per registration, got {event:?}"
        );
        let Some(ctx) = self.fd_context(fd, true) else {
            return Err(Error::EpollCtl {
                op: "EPOLL_CTL_ADD",
                fd,
                source: io::Error::from_raw_os_error(libc::EBADF),
            });
        };

        let mut st = ctx.state.lock();
        assert!(
            !st.events.contains(event),
            "fd {fd} already has {event:?} registered"
        );
        let op = if st.events.is_empty() {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        let mut ev = libc::epoll_event {
            events: libc::EPOLLET as u32 | (st.events | event).bits(),
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) } != 0 {
            let source = io::Error::last_os_error();
            warn!(fd, op = op_name(op), %source, "epoll_ctl failed");
            return Err(Error::EpollCtl {
                op: op_name(op),
                fd,
                source,
            });
        }

        self.pending.fetch_add(1, Ordering::AcqRel);
        st.events |= event;
        let scheduler = Scheduler::current()
            .map(|s| Arc::downgrade(&s))
            .or_else(|| self.owner.get().cloned());
        let slot = st.slot(event);
        debug_assert!(slot.is_empty());
        slot.scheduler = scheduler;
        match cb {
            Some(cb) => slot.cb = Some(cb),
            None => {
                let fiber = fiber::current();
                assert_eq!(
                    fiber.state(),
                    State::Running,
                    "add_event without a callback must come from a running fiber"
                );
                slot.fiber = Some(fiber);
            }
        }
        trace!(fd, ?event, "event armed");
        Ok(())
    }

    /// Drop interest in `event` without waking its waiter.
    pub fn del_event(&self, fd: RawFd, event: Event) -> bool {
        let Some(ctx) = self.fd_context(fd, false) else {
            return false;
        };
        let mut st = ctx.state.lock();
        if !st.events.intersects(event) {
            return false;
        }
        let left = st.events - event;
        if !self.rearm(fd, left) {
            return false;
        }
        st.events = left;
        for dir in [Event::READ, Event::WRITE] {
            if event.contains(dir) {
                drop(st.take(dir));
                self.pending.fetch_sub(1, Ordering::AcqRel);
            }
        }
        true
    }

    /// Drop interest in `event` and wake its waiter once.
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        let Some(ctx) = self.fd_context(fd, false) else {
            return false;
        };
        let fired = {
            let mut st = ctx.state.lock();
            if !st.events.intersects(event) {
                return false;
            }
            let left = st.events - event;
            if !self.rearm(fd, left) {
                return false;
            }
            let hit = st.events & event;
            st.events = left;
            take_fired(&mut st, hit)
        };
        self.fire_all(fired);
        true
    }

    /// Drop every interest on `fd`, waking each armed waiter once.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        let Some(ctx) = self.fd_context(fd, false) else {
            return false;
        };
        let fired = {
            let mut st = ctx.state.lock();
            if st.events.is_empty() {
                return false;
            }
            if !self.rearm(fd, Event::empty()) {
                return false;
            }
            let hit = st.events;
            st.events = Event::empty();
            take_fired(&mut st, hit)
        };
        self.fire_all(fired);
        true
    }

    /// Point epoll at the remaining interest of `fd`.
    fn rearm(&self, fd: RawFd, left: Event) -> bool {
        let op = if left.is_empty() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        let mut ev = libc::epoll_event {
            events: libc::EPOLLET as u32 | left.bits(),
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) } != 0 {
            warn!(
                fd,
                op = op_name(op),
                error = %io::Error::last_os_error(),
                "epoll_ctl failed"
            );
            return false;
        }
        true
    }

    fn fire_all(&self, fired: Vec<EventContext>) {
        let n = fired.len();
        for ctx in fired {
            ctx.fire();
        }
        // Only after the waiters are queued, so stop never sees an empty
        // reactor with work in flight.
        self.pending.fetch_sub(n, Ordering::AcqRel);
    }

    /// Wake one thread blocked in `epoll_wait`.
    pub(crate) fn tickle(&self) {
        let saved = sys::errno();
        let rc = unsafe { (sys::originals().write)(self.tickle_fds[1], b"T".as_ptr().cast(), 1) };
        if rc != 1 {
            trace!(errno = sys::errno(), "tickle pipe not written");
        }
        sys::set_errno(saved);
    }

    fn drain_tickle(&self) {
        let mut buf = [0u8; 256];
        let read = sys::originals().read;
        while unsafe { read(self.tickle_fds[0], buf.as_mut_ptr().cast(), buf.len()) } > 0 {}
    }

    pub(crate) fn stopping(&self, sched: &Scheduler) -> bool {
        self.timers.time_until_next().is_none()
            && self.pending_events() == 0
            && sched.base_stopping()
    }

    /// Body of the idle fiber: wait for I/O and timers, queue whatever
    /// became runnable, then yield back to the scheduling loop.
    pub(crate) fn idle(&self, sched: &Scheduler) {
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; self.max_events];
        let mut expired = Vec::new();

        loop {
            let next_timer = self.timers.time_until_next();
            if next_timer.is_none() && self.pending_events() == 0 && sched.base_stopping() {
                // Pass the wakeup on; one pipe write may have woken only us.
                if sched.idle_threads() > 1 {
                    self.tickle();
                }
                debug!("reactor idle loop done");
                break;
            }

            let timeout = wait_timeout(next_timer, self.max_wait_ms);
            let n = loop {
                let rc = unsafe {
                    libc::epoll_wait(
                        self.epfd,
                        events.as_mut_ptr(),
                        events.len() as libc::c_int,
                        timeout,
                    )
                };
                if rc >= 0 {
                    break rc as usize;
                }
                let err = sys::errno();
                if err != libc::EINTR {
                    warn!(errno = err, "epoll_wait failed");
                    break 0;
                }
            };

            self.timers.drain_expired(&mut expired);
            for cb in expired.drain(..) {
                sched.schedule(move || cb());
            }

            for ev in &events[..n] {
                let fd = ev.u64 as RawFd;
                if fd == self.tickle_fds[0] {
                    self.drain_tickle();
                    continue;
                }
                self.dispatch(fd, ev.events);
            }

            fiber::yield_current();
        }
    }

    fn dispatch(&self, fd: RawFd, mut revents: u32) {
        let Some(ctx) = self.fd_context(fd, false) else {
            return;
        };
        let fired = {
            let mut st = ctx.state.lock();
            // Errors and hangups must reach whoever waits on the fd even
            // when the kernel did not also report IN/OUT.
            if revents & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                revents |= (libc::EPOLLIN | libc::EPOLLOUT) as u32 & st.events.bits();
            }
            let hit = Event::from_bits_truncate(revents) & st.events;
            if hit.is_empty() {
                return;
            }
            let left = st.events - hit;
            if !self.rearm(fd, left) {
                return;
            }
            st.events = left;
            take_fired(&mut st, hit)
        };
        trace!(fd, count = fired.len(), "fd ready");
        self.fire_all(fired);
    }
}

/// epoll_wait timeout: the next timer deadline, capped by `max_wait_ms`
/// and by what a `c_int` can carry.
fn wait_timeout(next_timer: Option<u64>, max_wait_ms: u64) -> libc::c_int {
    let ms = next_timer.map_or(max_wait_ms, |ms| ms.min(max_wait_ms));
    ms.min(libc::c_int::MAX as u64) as libc::c_int
}

fn take_fired(st: &mut FdState, hit: Event) -> Vec<EventContext> {
    let mut fired = Vec::with_capacity(2);
    for dir in [Event::READ, Event::WRITE] {
        if hit.contains(dir) {
            fired.push(st.take(dir));
        }
    }
    fired
}

fn grow(contexts: &mut Vec<Arc<FdContext>>, size: usize) {
    while contexts.len() < size {
        contexts.push(Arc::new(FdContext {
            state: Mutex::new(FdState::default()),
        }));
    }
}

impl fmt::Debug for Reactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reactor")
            .field("epfd", &self.epfd)
            .field("pending", &self.pending_events())
            .field("timers", &self.timers.len())
            .finish()
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        for fd in [self.epfd, self.tickle_fds[0], self.tickle_fds[1]] {
            sys::close_quietly(fd);
        }
        debug!(epfd = self.epfd, "reactor closed");
    }
}

/// Owning handle of an epoll-driven scheduler.
///
/// Dropping it stops the scheduler: with `use_caller` the dropping thread
/// runs its share of the remaining work first.
pub struct IoManager {
    sched: Arc<Scheduler>,
}

impl IoManager {
    /// Create the reactor and scheduler and start the worker threads.
    pub fn new(threads: usize, use_caller: bool, name: impl Into<String>) -> Result<IoManager> {
        let reactor = Reactor::new()?;
        let sched = Scheduler::with_driver(threads, use_caller, name.into(), Driver::Epoll(reactor));

        let iom = IoManager { sched };
        let reactor = iom.reactor();
        reactor.set_owner(Arc::downgrade(&iom.sched));
        let weak = Arc::downgrade(&iom.sched);
        reactor.timers().set_front_hook(move || {
            if let Some(sched) = weak.upgrade() {
                sched.tickle();
            }
        });

        iom.sched.start()?;
        Ok(iom)
    }

    /// The epoll-driven scheduler the calling thread works for, if any.
    pub fn current() -> Option<Arc<Scheduler>> {
        Scheduler::current().filter(|s| s.reactor().is_some())
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.sched
    }

    pub fn reactor(&self) -> &Reactor {
        match self.sched.reactor() {
            Some(reactor) => reactor,
            None => unreachable!("IoManager always drives a reactor"),
        }
    }

    pub fn schedule<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.sched.schedule(f);
    }

    pub fn schedule_fiber(&self, fiber: Arc<Fiber>) {
        self.sched.schedule_fiber(fiber);
    }

    pub fn schedule_on(&self, task: Task, thread: Option<Tid>) {
        self.sched.schedule_on(task, thread);
    }

    pub fn add_event(&self, fd: RawFd, event: Event) -> Result<()> {
        self.reactor().add_event(fd, event)
    }

    pub fn add_event_callback<F>(&self, fd: RawFd, event: Event, cb: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.reactor().add_event_callback(fd, event, cb)
    }

    pub fn del_event(&self, fd: RawFd, event: Event) -> bool {
        self.reactor().del_event(fd, event)
    }

    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        self.reactor().cancel_event(fd, event)
    }

    pub fn cancel_all(&self, fd: RawFd) -> bool {
        self.reactor().cancel_all(fd)
    }

    pub fn add_timer<F>(&self, ms: u64, cb: F, recurring: bool) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.reactor().timers().add_timer(ms, cb, recurring)
    }

    pub fn add_condition_timer<F, T>(&self, ms: u64, cb: F, cond: Weak<T>, recurring: bool) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
        T: ?Sized + Send + Sync + 'static,
    {
        self.reactor().timers().add_condition_timer(ms, cb, cond, recurring)
    }

    pub fn pending_events(&self) -> usize {
        self.reactor().pending_events()
    }

    pub fn stop(&self) {
        self.sched.stop();
    }
}

impl fmt::Debug for IoManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoManager")
            .field("scheduler", &self.sched)
            .field("reactor", self.reactor())
            .finish()
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        self.sched.stop();
    }
}
