// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Raw OS access: the un-hooked libc entry points, errno and thread ids.
//!
//! With the `interpose` feature the crate exports its own `read`,
//! `connect`, ... symbols, so the real ones are looked up with
//! `dlsym(RTLD_NEXT, ..)`. Without it the `libc` bindings are used as-is.
//! Runtime internals call through [`originals`] either way so that the
//! reactor's own pipe and epoll traffic never loops back into the hooks.

use libc::{
    c_int, c_uint, c_ulong, c_void, iovec, msghdr, size_t, sockaddr, socklen_t, ssize_t,
    timespec, useconds_t,
};
use once_cell::sync::Lazy;

/// Kernel thread id.
pub type Tid = libc::pid_t;

pub type SleepFn = unsafe extern "C" fn(c_uint) -> c_uint;
pub type UsleepFn = unsafe extern "C" fn(useconds_t) -> c_int;
pub type NanosleepFn = unsafe extern "C" fn(*const timespec, *mut timespec) -> c_int;
pub type SocketFn = unsafe extern "C" fn(c_int, c_int, c_int) -> c_int;
pub type ConnectFn = unsafe extern "C" fn(c_int, *const sockaddr, socklen_t) -> c_int;
pub type AcceptFn = unsafe extern "C" fn(c_int, *mut sockaddr, *mut socklen_t) -> c_int;
pub type ReadFn = unsafe extern "C" fn(c_int, *mut c_void, size_t) -> ssize_t;
pub type ReadvFn = unsafe extern "C" fn(c_int, *const iovec, c_int) -> ssize_t;
pub type RecvFn = unsafe extern "C" fn(c_int, *mut c_void, size_t, c_int) -> ssize_t;
pub type RecvfromFn =
    unsafe extern "C" fn(c_int, *mut c_void, size_t, c_int, *mut sockaddr, *mut socklen_t) -> ssize_t;
pub type RecvmsgFn = unsafe extern "C" fn(c_int, *mut msghdr, c_int) -> ssize_t;
pub type WriteFn = unsafe extern "C" fn(c_int, *const c_void, size_t) -> ssize_t;
pub type WritevFn = unsafe extern "C" fn(c_int, *const iovec, c_int) -> ssize_t;
pub type SendFn = unsafe extern "C" fn(c_int, *const c_void, size_t, c_int) -> ssize_t;
pub type SendtoFn =
    unsafe extern "C" fn(c_int, *const c_void, size_t, c_int, *const sockaddr, socklen_t) -> ssize_t;
pub type SendmsgFn = unsafe extern "C" fn(c_int, *const msghdr, c_int) -> ssize_t;
pub type CloseFn = unsafe extern "C" fn(c_int) -> c_int;
pub type FcntlFn = unsafe extern "C" fn(c_int, c_int, ...) -> c_int;
pub type IoctlFn = unsafe extern "C" fn(c_int, c_ulong, ...) -> c_int;
pub type GetsockoptFn =
    unsafe extern "C" fn(c_int, c_int, c_int, *mut c_void, *mut socklen_t) -> c_int;
pub type SetsockoptFn =
    unsafe extern "C" fn(c_int, c_int, c_int, *const c_void, socklen_t) -> c_int;

/// The real implementations behind every hooked call.
pub struct Originals {
    pub sleep: SleepFn,
    pub usleep: UsleepFn,
    pub nanosleep: NanosleepFn,
    pub socket: SocketFn,
    pub connect: ConnectFn,
    pub accept: AcceptFn,
    pub read: ReadFn,
    pub readv: ReadvFn,
    pub recv: RecvFn,
    pub recvfrom: RecvfromFn,
    pub recvmsg: RecvmsgFn,
    pub write: WriteFn,
    pub writev: WritevFn,
    pub send: SendFn,
    pub sendto: SendtoFn,
    pub sendmsg: SendmsgFn,
    pub close: CloseFn,
    pub fcntl: FcntlFn,
    pub ioctl: IoctlFn,
    pub getsockopt: GetsockoptFn,
    pub setsockopt: SetsockoptFn,
}

#[cfg(feature = "interpose")]
macro_rules! resolve {
    ($name:ident, $ty:ty) => {{
        // SAFETY: the symbol name is NUL-terminated and the looked-up
        // function has the C signature named by `$ty`.
        let sym = unsafe {
            libc::dlsym(
                libc::RTLD_NEXT,
                concat!(stringify!($name), "\0").as_ptr().cast(),
            )
        };
        assert!(
            !sym.is_null(),
            concat!("unable to resolve libc `", stringify!($name), "`")
        );
        unsafe { std::mem::transmute::<*mut c_void, $ty>(sym) }
    }};
}

#[cfg(not(feature = "interpose"))]
macro_rules! resolve {
    ($name:ident, $ty:ty) => {
        libc::$name as $ty
    };
}

impl Originals {
    fn resolve() -> Self {
        Self {
            sleep: resolve!(sleep, SleepFn),
            usleep: resolve!(usleep, UsleepFn),
            nanosleep: resolve!(nanosleep, NanosleepFn),
            socket: resolve!(socket, SocketFn),
            connect: resolve!(connect, ConnectFn),
            accept: resolve!(accept, AcceptFn),
            read: resolve!(read, ReadFn),
            readv: resolve!(readv, ReadvFn),
            recv: resolve!(recv, RecvFn),
            recvfrom: resolve!(recvfrom, RecvfromFn),
            recvmsg: resolve!(recvmsg, RecvmsgFn),
            write: resolve!(write, WriteFn),
            writev: resolve!(writev, WritevFn),
            send: resolve!(send, SendFn),
            sendto: resolve!(sendto, SendtoFn),
            sendmsg: resolve!(sendmsg, SendmsgFn),
            close: resolve!(close, CloseFn),
            fcntl: resolve!(fcntl, FcntlFn),
            ioctl: resolve!(ioctl, IoctlFn),
            getsockopt: resolve!(getsockopt, GetsockoptFn),
            setsockopt: resolve!(setsockopt, SetsockoptFn),
        }
    }
}

static ORIGINALS: Lazy<Originals> = Lazy::new(Originals::resolve);

/// Table of un-hooked libc functions.
#[inline]
pub fn originals() -> &'static Originals {
    &ORIGINALS
}

#[inline]
pub fn errno() -> c_int {
    // SAFETY: __errno_location always returns the calling thread's errno slot.
    unsafe { *libc::__errno_location() }
}

#[inline]
pub fn set_errno(value: c_int) {
    unsafe { *libc::__errno_location() = value }
}

/// Kernel id of the calling thread.
pub fn gettid() -> Tid {
    unsafe { libc::syscall(libc::SYS_gettid) as Tid }
}

/// Close through the real `close`, ignoring the result.
pub(crate) fn close_quietly(fd: c_int) {
    if fd >= 0 {
        unsafe { (originals().close)(fd) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_round_trips_per_thread() {
        set_errno(libc::EAGAIN);
        assert_eq!(errno(), libc::EAGAIN);
        std::thread::spawn(|| {
            set_errno(libc::EINTR);
            assert_eq!(errno(), libc::EINTR);
        })
        .join()
        .unwrap();
        assert_eq!(errno(), libc::EAGAIN);
    }

    #[test]
    fn thread_ids_differ() {
        let me = gettid();
        let other = std::thread::spawn(gettid).join().unwrap();
        assert!(me > 0);
        assert_ne!(me, other);
    }

    #[test]
    fn originals_pass_through() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let n = unsafe { (originals().write)(fds[1], b"ok".as_ptr().cast(), 2) };
        assert_eq!(n, 2);
        let mut buf = [0u8; 2];
        let n = unsafe { (originals().read)(fds[0], buf.as_mut_ptr().cast(), 2) };
        assert_eq!(n, 2);
        assert_eq!(&buf, b"ok");
        close_quietly(fds[0]);
        close_quietly(fds[1]);
    }
}
