// SPDX-License-Identifier: (MIT OR Apache-2.0)

//! Hooked POSIX calls running inside fibers: sleeps that free the thread,
//! socket timeouts, close while waiting and a loopback echo.

use std::mem;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use cofiber::sys::errno;
use cofiber::{hook, FdManager, IoManager};
use libc::{c_int, sockaddr, sockaddr_in, socklen_t};
use parking_lot::Mutex;
use serial_test::serial;

fn socket_pair() -> [RawFd; 2] {
    let mut fds = [0; 2];
    let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
    assert_eq!(rc, 0);
    fds
}

fn set_timeout(fd: RawFd, opt: c_int, ms: i64) -> c_int {
    let tv = libc::timeval {
        tv_sec: ms / 1000,
        tv_usec: (ms % 1000) * 1000,
    };
    unsafe {
        hook::setsockopt(
            fd,
            libc::SOL_SOCKET,
            opt,
            (&tv as *const libc::timeval).cast(),
            mem::size_of::<libc::timeval>() as socklen_t,
        )
    }
}

fn loopback(port: u16) -> sockaddr_in {
    let mut addr: sockaddr_in = unsafe { mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_port = port.to_be();
    addr.sin_addr.s_addr = u32::from(std::net::Ipv4Addr::LOCALHOST).to_be();
    addr
}

fn addr_ptr(addr: &sockaddr_in) -> *const sockaddr {
    (addr as *const sockaddr_in).cast()
}

const ADDR_LEN: socklen_t = mem::size_of::<sockaddr_in>() as socklen_t;

fn wait_for<T>(slot: &Mutex<Option<T>>) -> T {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(v) = slot.lock().take() {
            return v;
        }
        assert!(Instant::now() < deadline, "timed out waiting for fiber result");
        std::thread::sleep(Duration::from_millis(2));
    }
}

#[test]
#[serial]
fn sleep_frees_the_thread() {
    let iom = IoManager::new(1, true, "sleeper").unwrap();
    let start = Instant::now();
    let slept = Arc::new(Mutex::new(None));
    let noop = Arc::new(Mutex::new(None));

    let s = slept.clone();
    iom.schedule(move || {
        let rc = unsafe { hook::sleep(1) };
        *s.lock() = Some((rc, start.elapsed()));
    });
    let n = noop.clone();
    iom.schedule(move || *n.lock() = Some(start.elapsed()));

    // Single thread, folded in by stop.
    iom.stop();
    let (rc, slept_for) = slept.lock().take().unwrap();
    let noop_at = noop.lock().take().unwrap();
    assert_eq!(rc, 0);
    assert!(slept_for >= Duration::from_millis(990), "slept {slept_for:?}");
    assert!(noop_at < Duration::from_millis(500), "no-op ran at {noop_at:?}");
}

#[test]
#[serial]
fn usleep_and_nanosleep_park_the_fiber() {
    let iom = IoManager::new(1, false, "naps").unwrap();
    let result = Arc::new(Mutex::new(None));
    let r = result.clone();
    iom.schedule(move || {
        let start = Instant::now();
        let a = unsafe { hook::usleep(50_000) };
        let req = libc::timespec {
            tv_sec: 0,
            tv_nsec: 50_000_000,
        };
        let mut rem = libc::timespec {
            tv_sec: 7,
            tv_nsec: 7,
        };
        let b = unsafe { hook::nanosleep(&req, &mut rem) };
        *r.lock() = Some((a, b, rem.tv_sec, rem.tv_nsec, start.elapsed()));
    });
    let (a, b, rem_sec, rem_nsec, took) = wait_for(&result);
    assert_eq!((a, b), (0, 0));
    assert_eq!((rem_sec, rem_nsec), (0, 0));
    assert!(took >= Duration::from_millis(95), "took {took:?}");
    drop(iom);
}

#[test]
#[serial]
fn recv_times_out() {
    let iom = IoManager::new(1, false, "recv-timeout").unwrap();
    let result = Arc::new(Mutex::new(None));
    let r = result.clone();
    iom.schedule(move || {
        let [a, b] = socket_pair();
        FdManager::global().get(a, true).unwrap();
        assert_eq!(set_timeout(a, libc::SO_RCVTIMEO, 100), 0);

        let start = Instant::now();
        let mut buf = [0u8; 8];
        let n = unsafe { hook::recv(a, buf.as_mut_ptr().cast(), buf.len(), 0) };
        let err = errno();
        let took = start.elapsed();
        unsafe {
            hook::close(a);
            hook::close(b);
        }
        *r.lock() = Some((n, err, took));
    });

    let (n, err, took) = wait_for(&result);
    assert_eq!(n, -1);
    assert_eq!(err, libc::ETIMEDOUT);
    assert!(took >= Duration::from_millis(90), "took {took:?}");
    assert!(took < Duration::from_millis(1000), "took {took:?}");
    assert_eq!(iom.pending_events(), 0);
    assert!(iom.reactor().timers().is_empty());
    drop(iom);
}

#[test]
fn read_waits_for_the_peer() {
    let iom = IoManager::new(2, false, "read-wait").unwrap();
    let [a, b] = socket_pair();
    let result = Arc::new(Mutex::new(None));
    let r = result.clone();
    iom.schedule(move || {
        FdManager::global().get(a, true).unwrap();
        let mut buf = [0u8; 5];
        let n = unsafe { hook::read(a, buf.as_mut_ptr().cast(), buf.len()) };
        *r.lock() = Some((n, buf));
    });

    let deadline = Instant::now() + Duration::from_secs(5);
    while iom.pending_events() == 0 {
        assert!(Instant::now() < deadline);
        std::thread::sleep(Duration::from_millis(2));
    }
    unsafe { libc::write(b, b"hello".as_ptr().cast(), 5) };
    let (n, buf) = wait_for(&result);
    assert_eq!(n, 5);
    assert_eq!(&buf, b"hello");

    drop(iom);
    FdManager::global().del(a);
    unsafe {
        libc::close(a);
        libc::close(b);
    }
}

#[test]
fn close_wakes_a_blocked_reader() {
    let iom = IoManager::new(2, false, "close-wake").unwrap();
    let [a, b] = socket_pair();
    let result = Arc::new(Mutex::new(None));

    let r = result.clone();
    iom.schedule(move || {
        FdManager::global().get(a, true).unwrap();
        let mut byte = 0u8;
        let n = unsafe { hook::read(a, (&mut byte as *mut u8).cast(), 1) };
        *r.lock() = Some((n, errno()));
    });
    iom.schedule(move || {
        let iom = IoManager::current().unwrap();
        while iom.reactor().unwrap().pending_events() == 0 {
            unsafe { hook::usleep(5_000) };
        }
        drop(iom);
        unsafe { hook::close(a) };
    });

    let (n, err) = wait_for(&result);
    assert_eq!(n, -1);
    assert_eq!(err, libc::EBADF);
    drop(iom);
    unsafe { libc::close(b) };
}

#[test]
fn loopback_echo() {
    let iom = IoManager::new(2, false, "echo").unwrap();
    let port = Arc::new(Mutex::new(None));
    let reply = Arc::new(Mutex::new(None));

    let p = port.clone();
    iom.schedule(move || unsafe {
        let listener = hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        assert!(listener >= 0);
        let addr = loopback(0);
        assert_eq!(libc::bind(listener, addr_ptr(&addr), ADDR_LEN), 0);
        assert_eq!(libc::listen(listener, 8), 0);
        let mut bound: sockaddr_in = mem::zeroed();
        let mut len = ADDR_LEN;
        libc::getsockname(listener, (&mut bound as *mut sockaddr_in).cast(), &mut len);
        *p.lock() = Some(u16::from_be(bound.sin_port));

        let conn = hook::accept(listener, std::ptr::null_mut(), std::ptr::null_mut());
        assert!(conn >= 0, "accept failed: {}", errno());
        let mut buf = [0u8; 64];
        let n = hook::read(conn, buf.as_mut_ptr().cast(), buf.len());
        assert!(n > 0);
        let w = hook::write(conn, buf.as_ptr().cast(), n as usize);
        assert_eq!(w, n);
        hook::close(conn);
        hook::close(listener);
    });

    let port = wait_for(&port);
    let r = reply.clone();
    iom.schedule(move || unsafe {
        let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        let addr = loopback(port);
        let rc = hook::connect(fd, addr_ptr(&addr), ADDR_LEN);
        assert_eq!(rc, 0, "connect failed: {}", errno());
        assert_eq!(hook::send(fd, b"ping".as_ptr().cast(), 4, 0), 4);
        let mut buf = [0u8; 4];
        let n = hook::recv(fd, buf.as_mut_ptr().cast(), buf.len(), 0);
        hook::close(fd);
        *r.lock() = Some((n, buf));
    });

    let (n, buf) = wait_for(&reply);
    assert_eq!(n, 4);
    assert_eq!(&buf, b"ping");
    drop(iom);
}

#[test]
fn connect_refused_cleans_up() {
    let iom = IoManager::new(1, false, "refused").unwrap();
    let result = Arc::new(Mutex::new(None));
    let r = result.clone();
    iom.schedule(move || unsafe {
        // Grab a free port, then release it so nobody listens there.
        let spare = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        let any = loopback(0);
        libc::bind(spare, addr_ptr(&any), ADDR_LEN);
        let mut bound: sockaddr_in = mem::zeroed();
        let mut len = ADDR_LEN;
        libc::getsockname(spare, (&mut bound as *mut sockaddr_in).cast(), &mut len);
        libc::close(spare);

        let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        let rc = hook::connect(fd, (&bound as *const sockaddr_in).cast(), ADDR_LEN);
        let err = errno();
        hook::close(fd);
        *r.lock() = Some((rc, err));
    });

    let (rc, err) = wait_for(&result);
    assert_eq!(rc, -1);
    assert_eq!(err, libc::ECONNREFUSED);
    assert_eq!(iom.pending_events(), 0);
    assert!(iom.reactor().timers().is_empty());
    drop(iom);
}

#[test]
#[serial]
fn connect_times_out() {
    let iom = IoManager::new(1, false, "connect-timeout").unwrap();
    let result = Arc::new(Mutex::new(None));
    let r = result.clone();
    iom.schedule(move || unsafe {
        // A listener that never accepts, with its backlog full: further
        // SYNs are dropped and the connect hangs in EINPROGRESS.
        let listener = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        let any = loopback(0);
        assert_eq!(libc::bind(listener, addr_ptr(&any), ADDR_LEN), 0);
        assert_eq!(libc::listen(listener, 0), 0);
        let mut bound: sockaddr_in = mem::zeroed();
        let mut len = ADDR_LEN;
        libc::getsockname(listener, (&mut bound as *mut sockaddr_in).cast(), &mut len);

        let mut fillers = Vec::new();
        for _ in 0..4 {
            let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_NONBLOCK, 0);
            libc::connect(fd, addr_ptr(&bound), ADDR_LEN);
            fillers.push(fd);
        }
        hook::usleep(20_000);

        let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        assert_eq!(set_timeout(fd, libc::SO_SNDTIMEO, 100), 0);
        let start = Instant::now();
        let rc = hook::connect(fd, addr_ptr(&bound), ADDR_LEN);
        let err = errno();
        let took = start.elapsed();
        hook::close(fd);
        for fd in fillers {
            libc::close(fd);
        }
        libc::close(listener);
        *r.lock() = Some((rc, err, took));
    });

    let (rc, err, took) = wait_for(&result);
    assert_eq!(rc, -1);
    assert_eq!(err, libc::ETIMEDOUT);
    assert!(took >= Duration::from_millis(90), "took {took:?}");
    assert!(took < Duration::from_millis(1000), "took {took:?}");
    assert_eq!(iom.pending_events(), 0);
    assert!(iom.reactor().timers().is_empty());
    drop(iom);
}
