// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Fiber-aware versions of the blocking POSIX calls.
//!
//! Each function has the signature and `-1`/`errno` contract of its libc
//! namesake. On a thread with hooking enabled (every scheduling loop turns
//! it on) a call that would block registers interest with the current
//! reactor and yields the running fiber instead, so the OS thread goes on
//! running other fibers. Everywhere else the calls go straight to libc.
//!
//! Only sockets known to the [`FdManager`] are rewritten: the ones created
//! through [`socket`] or [`accept`], or registered explicitly with
//! `FdManager::global().get(fd, true)`.
//!
//! # Safety
//!
//! Every `unsafe fn` here has the same contract as the libc function of the
//! same name: pointers must be valid for the lengths passed alongside them.

#![allow(clippy::missing_safety_doc)]

#[cfg(feature = "interpose")]
mod interpose;

use std::cell::Cell;
use std::mem;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Weak};

use libc::{
    c_int, c_uint, c_ulong, c_void, iovec, msghdr, size_t, sockaddr, socklen_t, ssize_t,
    timespec, useconds_t,
};
use tracing::{trace, warn};

use crate::config;
use crate::fd::{FdCtx, FdManager, TimeoutKind};
use crate::fiber;
use crate::iomanager::{Event, IoManager};
use crate::scheduler::Scheduler;
use crate::sys::{errno, originals, set_errno};
use crate::timer::Timer;

thread_local! {
    static HOOK_ENABLED: Cell<bool> = const { Cell::new(false) };
}

/// Whether blocking calls on this thread are rewritten.
#[inline(never)]
pub fn is_hook_enable() -> bool {
    HOOK_ENABLED.try_with(Cell::get).unwrap_or(false)
}

#[inline(never)]
pub fn set_hook_enable(flag: bool) {
    let _ = HOOK_ENABLED.try_with(|h| h.set(flag));
}

fn tracked(fd: c_int) -> Option<Arc<FdCtx>> {
    FdManager::global().get(fd, false)
}

fn tracked_socket(fd: c_int) -> Option<Arc<FdCtx>> {
    tracked(fd).filter(|ctx| !ctx.is_closed() && ctx.is_socket())
}

/// Arm a one-shot timer that records `ETIMEDOUT` in `flag` and cancels the
/// `event` wait on `fd`, waking the fiber parked on it.
fn arm_timeout(
    iom: &Arc<Scheduler>,
    ms: u64,
    fd: c_int,
    event: Event,
    flag: &Arc<AtomicI32>,
) -> Option<Arc<Timer>> {
    let reactor = iom.reactor()?;
    let weak_flag = Arc::downgrade(flag);
    let weak_iom: Weak<Scheduler> = Arc::downgrade(iom);
    let timer = reactor.timers().add_condition_timer(
        ms,
        move || {
            let Some(flag) = weak_flag.upgrade() else {
                return;
            };
            if flag
                .compare_exchange(0, libc::ETIMEDOUT, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
            trace!(fd, ?event, "hooked call timed out");
            if let Some(reactor) = weak_iom.upgrade().as_ref().and_then(|s| s.reactor()) {
                reactor.cancel_event(fd, event);
            }
        },
        Arc::downgrade(flag),
        false,
    );
    Some(timer)
}

/// Park the running fiber until `fd` is ready for `event`, the optional
/// timeout fires, or the wait is cancelled. Returns `Err(errno)` when the
/// wait could not be set up or timed out.
fn wait_for(fd: c_int, event: Event, timeout: Option<u64>, name: &str) -> Result<(), c_int> {
    let flag = Arc::new(AtomicI32::new(0));
    let timer = {
        let Some(iom) = IoManager::current() else {
            return Err(libc::EAGAIN);
        };
        let Some(reactor) = iom.reactor() else {
            return Err(libc::EAGAIN);
        };
        let timer = timeout.and_then(|ms| arm_timeout(&iom, ms, fd, event, &flag));
        if let Err(err) = reactor.add_event(fd, event) {
            let code = err.raw_os_error().unwrap_or(libc::EINVAL);
            warn!(fd, call = name, %err, "failed to register interest");
            if let Some(timer) = timer {
                timer.cancel();
            }
            return Err(code);
        }
        timer
    };

    fiber::yield_current();

    if let Some(timer) = timer {
        timer.cancel();
    }
    match flag.load(Ordering::Acquire) {
        0 => Ok(()),
        code => Err(code),
    }
}

/// Run `call` until it succeeds or fails with something other than
/// `EINTR`/`EAGAIN`, parking the fiber on `EAGAIN`.
unsafe fn do_io<F>(fd: c_int, name: &str, event: Event, kind: TimeoutKind, mut call: F) -> ssize_t
where
    F: FnMut() -> ssize_t,
{
    if !is_hook_enable() {
        return call();
    }
    let Some(ctx) = tracked(fd) else {
        return call();
    };
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return call();
    }
    let timeout = ctx.timeout(kind);

    loop {
        let mut n = call();
        while n == -1 && errno() == libc::EINTR {
            n = call();
        }
        if n != -1 || errno() != libc::EAGAIN {
            return n;
        }
        trace!(fd, call = name, "would block, parking fiber");
        if let Err(code) = wait_for(fd, event, timeout, name) {
            set_errno(code);
            return -1;
        }
        // Woken by close().
        if ctx.is_closed() {
            set_errno(libc::EBADF);
            return -1;
        }
    }
}

/// Put the running fiber to sleep for `ms`. False if there is no reactor
/// to wake it up again.
fn park_for(ms: u64) -> bool {
    let Some(iom) = IoManager::current() else {
        return false;
    };
    let Some(reactor) = iom.reactor() else {
        return false;
    };
    let me = fiber::current();
    let weak = Arc::downgrade(&iom);
    reactor.timers().add_timer(
        ms,
        move || {
            if let Some(sched) = weak.upgrade() {
                sched.schedule_fiber(me.clone());
            }
        },
        false,
    );
    drop(iom);
    fiber::yield_current();
    true
}

pub unsafe fn sleep(seconds: c_uint) -> c_uint {
    if is_hook_enable() && park_for(u64::from(seconds) * 1000) {
        return 0;
    }
    (originals().sleep)(seconds)
}

pub unsafe fn usleep(usec: useconds_t) -> c_int {
    if is_hook_enable() && park_for(u64::from(usec) / 1000) {
        return 0;
    }
    (originals().usleep)(usec)
}

pub unsafe fn nanosleep(req: *const timespec, rem: *mut timespec) -> c_int {
    if is_hook_enable() && !req.is_null() {
        let ts = &*req;
        if ts.tv_sec >= 0 && (0..1_000_000_000).contains(&ts.tv_nsec) {
            let ms = (ts.tv_sec as u64)
                .saturating_mul(1000)
                .saturating_add(ts.tv_nsec as u64 / 1_000_000);
            if park_for(ms) {
                if !rem.is_null() {
                    *rem = mem::zeroed();
                }
                return 0;
            }
        }
    }
    (originals().nanosleep)(req, rem)
}

pub unsafe fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
    let fd = (originals().socket)(domain, ty, protocol);
    if fd != -1 && is_hook_enable() {
        FdManager::global().get(fd, true);
    }
    fd
}

/// `connect` that gives up with `ETIMEDOUT` after `timeout_ms`
/// (`None` waits as long as the kernel does).
pub unsafe fn connect_with_timeout(
    fd: c_int,
    addr: *const sockaddr,
    addrlen: socklen_t,
    timeout_ms: Option<u64>,
) -> c_int {
    let connect = originals().connect;
    if !is_hook_enable() {
        return connect(fd, addr, addrlen);
    }
    let Some(ctx) = tracked(fd) else {
        return connect(fd, addr, addrlen);
    };
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return connect(fd, addr, addrlen);
    }
    drop(ctx);

    let n = connect(fd, addr, addrlen);
    if n == 0 {
        return 0;
    }
    if n != -1 || errno() != libc::EINPROGRESS {
        return n;
    }

    if let Err(code) = wait_for(fd, Event::WRITE, timeout_ms, "connect") {
        set_errno(code);
        return -1;
    }

    let mut error: c_int = 0;
    let mut len = mem::size_of::<c_int>() as socklen_t;
    let rc = (originals().getsockopt)(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        (&mut error as *mut c_int).cast(),
        &mut len,
    );
    if rc == -1 {
        return -1;
    }
    if error != 0 {
        set_errno(error);
        return -1;
    }
    0
}

/// Uses the socket's send timeout if it has one, else the configured
/// connect timeout.
pub unsafe fn connect(fd: c_int, addr: *const sockaddr, addrlen: socklen_t) -> c_int {
    let timeout = tracked(fd)
        .and_then(|ctx| ctx.timeout(TimeoutKind::Send))
        .or(config::get().tcp_connect_timeout_ms);
    connect_with_timeout(fd, addr, addrlen, timeout)
}

pub unsafe fn accept(fd: c_int, addr: *mut sockaddr, addrlen: *mut socklen_t) -> c_int {
    let accept = originals().accept;
    let client = do_io(fd, "accept", Event::READ, TimeoutKind::Recv, || {
        accept(fd, addr, addrlen) as ssize_t
    }) as c_int;
    if client >= 0 && is_hook_enable() {
        FdManager::global().get(client, true);
    }
    client
}

pub unsafe fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    let read = originals().read;
    do_io(fd, "read", Event::READ, TimeoutKind::Recv, || read(fd, buf, count))
}

pub unsafe fn readv(fd: c_int, iov: *const iovec, iovcnt: c_int) -> ssize_t {
    let readv = originals().readv;
    do_io(fd, "readv", Event::READ, TimeoutKind::Recv, || readv(fd, iov, iovcnt))
}

pub unsafe fn recv(fd: c_int, buf: *mut c_void, len: size_t, flags: c_int) -> ssize_t {
    let recv = originals().recv;
    do_io(fd, "recv", Event::READ, TimeoutKind::Recv, || recv(fd, buf, len, flags))
}

pub unsafe fn recvfrom(
    fd: c_int,
    buf: *mut c_void,
    len: size_t,
    flags: c_int,
    src: *mut sockaddr,
    addrlen: *mut socklen_t,
) -> ssize_t {
    let recvfrom = originals().recvfrom;
    do_io(fd, "recvfrom", Event::READ, TimeoutKind::Recv, || {
        recvfrom(fd, buf, len, flags, src, addrlen)
    })
}

pub unsafe fn recvmsg(fd: c_int, msg: *mut msghdr, flags: c_int) -> ssize_t {
    let recvmsg = originals().recvmsg;
    do_io(fd, "recvmsg", Event::READ, TimeoutKind::Recv, || recvmsg(fd, msg, flags))
}

pub unsafe fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
    let write = originals().write;
    do_io(fd, "write", Event::WRITE, TimeoutKind::Send, || write(fd, buf, count))
}

pub unsafe fn writev(fd: c_int, iov: *const iovec, iovcnt: c_int) -> ssize_t {
    let writev = originals().writev;
    do_io(fd, "writev", Event::WRITE, TimeoutKind::Send, || writev(fd, iov, iovcnt))
}

pub unsafe fn send(fd: c_int, buf: *const c_void, len: size_t, flags: c_int) -> ssize_t {
    let send = originals().send;
    do_io(fd, "send", Event::WRITE, TimeoutKind::Send, || send(fd, buf, len, flags))
}

pub unsafe fn sendto(
    fd: c_int,
    buf: *const c_void,
    len: size_t,
    flags: c_int,
    dest: *const sockaddr,
    addrlen: socklen_t,
) -> ssize_t {
    let sendto = originals().sendto;
    do_io(fd, "sendto", Event::WRITE, TimeoutKind::Send, || {
        sendto(fd, buf, len, flags, dest, addrlen)
    })
}

pub unsafe fn sendmsg(fd: c_int, msg: *const msghdr, flags: c_int) -> ssize_t {
    let sendmsg = originals().sendmsg;
    do_io(fd, "sendmsg", Event::WRITE, TimeoutKind::Send, || sendmsg(fd, msg, flags))
}

/// Wakes every fiber waiting on `fd` before closing it.
pub unsafe fn close(fd: c_int) -> c_int {
    if is_hook_enable() {
        if let Some(ctx) = tracked(fd) {
            ctx.set_closed();
            if let Some(reactor) = IoManager::current().as_ref().and_then(|s| s.reactor()) {
                reactor.cancel_all(fd);
            }
            FdManager::global().del(fd);
        }
    }
    (originals().close)(fd)
}

/// `fcntl` with the variadic argument widened to a machine word.
///
/// `F_SETFL`/`F_GETFL` on tracked sockets keep `O_NONBLOCK` in the kernel
/// and report the mode the caller asked for.
pub unsafe fn fcntl(fd: c_int, cmd: c_int, arg: c_ulong) -> c_int {
    let fcntl = originals().fcntl;
    match cmd {
        libc::F_SETFL => {
            let mut flags = arg as c_int;
            if let Some(ctx) = tracked_socket(fd) {
                ctx.set_user_nonblock(flags & libc::O_NONBLOCK != 0);
                if ctx.sys_nonblock() {
                    flags |= libc::O_NONBLOCK;
                } else {
                    flags &= !libc::O_NONBLOCK;
                }
            }
            fcntl(fd, cmd, flags)
        }
        libc::F_GETFL => {
            let flags = fcntl(fd, cmd);
            if flags == -1 {
                return flags;
            }
            match tracked_socket(fd) {
                Some(ctx) if ctx.user_nonblock() => flags | libc::O_NONBLOCK,
                Some(_) => flags & !libc::O_NONBLOCK,
                None => flags,
            }
        }
        _ => fcntl(fd, cmd, arg),
    }
}

/// `ioctl` with one pointer argument. `FIONBIO` on a tracked socket only
/// records the requested mode; the kernel side stays non-blocking.
pub unsafe fn ioctl(fd: c_int, request: c_ulong, arg: *mut c_void) -> c_int {
    let ioctl = originals().ioctl;
    if request == libc::FIONBIO as c_ulong && !arg.is_null() {
        if let Some(ctx) = tracked_socket(fd) {
            let on = *(arg as *const c_int) != 0;
            ctx.set_user_nonblock(on);
            let mut kernel: c_int = c_int::from(on || ctx.sys_nonblock());
            return ioctl(fd, request, &mut kernel as *mut c_int);
        }
    }
    ioctl(fd, request, arg)
}

pub unsafe fn getsockopt(
    fd: c_int,
    level: c_int,
    optname: c_int,
    optval: *mut c_void,
    optlen: *mut socklen_t,
) -> c_int {
    (originals().getsockopt)(fd, level, optname, optval, optlen)
}

/// `SO_RCVTIMEO`/`SO_SNDTIMEO` also set the timeout the hooked calls
/// honour. A zero `timeval` means no timeout.
pub unsafe fn setsockopt(
    fd: c_int,
    level: c_int,
    optname: c_int,
    optval: *const c_void,
    optlen: socklen_t,
) -> c_int {
    if is_hook_enable() && level == libc::SOL_SOCKET {
        if let (Some(kind), Some(ctx)) = (TimeoutKind::from_optname(optname), tracked(fd)) {
            if !optval.is_null() && optlen as usize >= mem::size_of::<libc::timeval>() {
                let tv = &*(optval as *const libc::timeval);
                let ms = (tv.tv_sec as i64)
                    .saturating_mul(1000)
                    .saturating_add(tv.tv_usec as i64 / 1000);
                ctx.set_timeout(kind, config::timeout_from_millis(ms));
                trace!(fd, ?kind, ms, "socket timeout updated");
            }
        }
    }
    (originals().setsockopt)(fd, level, optname, optval, optlen)
}
