// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Per-fd metadata consulted by the hooks.
//!
//! Every socket the hooks see is switched to non-blocking in the kernel
//! ("system" non-blocking) while the mode the application asked for is
//! tracked separately ("user" non-blocking).

use std::mem;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use tracing::trace;

use crate::sys;

const NO_TIMEOUT: u64 = u64::MAX;
const INITIAL_SLOTS: usize = 64;

/// Which per-direction timeout a call honours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// `SO_RCVTIMEO`
    Recv,
    /// `SO_SNDTIMEO`
    Send,
}

impl TimeoutKind {
    pub fn from_optname(optname: libc::c_int) -> Option<Self> {
        match optname {
            libc::SO_RCVTIMEO => Some(Self::Recv),
            libc::SO_SNDTIMEO => Some(Self::Send),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct FdCtx {
    fd: RawFd,
    is_init: bool,
    is_socket: bool,
    sys_nonblock: AtomicBool,
    user_nonblock: AtomicBool,
    closed: AtomicBool,
    recv_timeout: AtomicU64,
    send_timeout: AtomicU64,
}

impl FdCtx {
    fn new(fd: RawFd) -> Self {
        // SAFETY: stat is plain data; fstat only writes into it.
        let mut st: libc::stat = unsafe { mem::zeroed() };
        let (is_init, is_socket) = if unsafe { libc::fstat(fd, &mut st) } == -1 {
            (false, false)
        } else {
            (true, st.st_mode & libc::S_IFMT == libc::S_IFSOCK)
        };

        let sys_nonblock = is_socket && force_nonblocking(fd);
        trace!(fd, is_init, is_socket, "fd context created");

        Self {
            fd,
            is_init,
            is_socket,
            sys_nonblock: AtomicBool::new(sys_nonblock),
            user_nonblock: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            recv_timeout: AtomicU64::new(NO_TIMEOUT),
            send_timeout: AtomicU64::new(NO_TIMEOUT),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// `fstat` succeeded when the context was created.
    pub fn is_init(&self) -> bool {
        self.is_init
    }

    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn set_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Acquire)
    }

    pub fn set_user_nonblock(&self, v: bool) {
        self.user_nonblock.store(v, Ordering::Release);
    }

    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock.load(Ordering::Acquire)
    }

    pub fn set_sys_nonblock(&self, v: bool) {
        self.sys_nonblock.store(v, Ordering::Release);
    }

    /// Timeout in milliseconds, `None` for "wait forever".
    pub fn timeout(&self, kind: TimeoutKind) -> Option<u64> {
        let v = self.slot(kind).load(Ordering::Acquire);
        (v != NO_TIMEOUT).then_some(v)
    }

    pub fn set_timeout(&self, kind: TimeoutKind, ms: Option<u64>) {
        self.slot(kind)
            .store(ms.unwrap_or(NO_TIMEOUT), Ordering::Release);
    }

    fn slot(&self, kind: TimeoutKind) -> &AtomicU64 {
        match kind {
            TimeoutKind::Recv => &self.recv_timeout,
            TimeoutKind::Send => &self.send_timeout,
        }
    }
}

fn force_nonblocking(fd: RawFd) -> bool {
    let fcntl = sys::originals().fcntl;
    let flags = unsafe { fcntl(fd, libc::F_GETFL, 0) };
    if flags == -1 {
        return false;
    }
    if flags & libc::O_NONBLOCK == 0 {
        unsafe { fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    }
    true
}

/// Fd-indexed table of [`FdCtx`].
pub struct FdManager {
    slots: RwLock<Vec<Option<Arc<FdCtx>>>>,
}

static FD_MANAGER: Lazy<FdManager> = Lazy::new(FdManager::new);

impl FdManager {
    fn new() -> Self {
        Self {
            slots: RwLock::new(vec![None; INITIAL_SLOTS]),
        }
    }

    /// Process-wide instance used by the hooks.
    pub fn global() -> &'static FdManager {
        &FD_MANAGER
    }

    /// Context for `fd`, created on a miss when `auto_create` is set.
    pub fn get(&self, fd: RawFd, auto_create: bool) -> Option<Arc<FdCtx>> {
        if fd < 0 {
            return None;
        }
        let idx = fd as usize;
        {
            let slots = self.slots.read();
            if let Some(Some(ctx)) = slots.get(idx) {
                return Some(ctx.clone());
            }
            if !auto_create {
                return None;
            }
        }

        let mut slots = self.slots.write();
        if idx >= slots.len() {
            slots.resize(idx + idx / 2 + 1, None);
        }
        if let Some(ctx) = &slots[idx] {
            return Some(ctx.clone());
        }
        let ctx = Arc::new(FdCtx::new(fd));
        slots[idx] = Some(ctx.clone());
        Some(ctx)
    }

    /// Forget `fd`.
    pub fn del(&self, fd: RawFd) {
        if fd < 0 {
            return;
        }
        let mut slots = self.slots.write();
        if let Some(slot) = slots.get_mut(fd as usize) {
            *slot = None;
        }
    }
}
