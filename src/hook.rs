//! Cooperative re-implementations of the blocking OS surface.
//!
//! Each function here keeps the OS-native signature of the call it stands in
//! for, but routes would-block conditions through the reactor: the raw
//! nonblocking syscall is issued, and on `EAGAIN` the calling fiber
//! registers one-shot interest, optionally arms a condition timer for the
//! fd's configured timeout, and yields. The reactor (or the timer) hands
//! the fiber back to the scheduler, the syscall is retried, and user code
//! never observes the suspension.
//!
//! Hooking is per thread: scheduler workers enable it before dispatching,
//! so the runtime's own setup code never recursively yields. With the flag
//! off, or for fds that are not sockets, or for sockets the user explicitly
//! made non-blocking, every function is a transparent passthrough.
//!
//! Errors are reported the OS way: `-1` with `errno` preserved. A timeout
//! surfaces as `-1` with `errno = ETIMEDOUT`.

use std::cell::Cell;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use libc::{c_int, c_uint, c_ulong, c_void, size_t, socklen_t, ssize_t};
use log::error;

use crate::config;
use crate::fd::{self, NO_TIMEOUT};
use crate::fiber::Fiber;
use crate::reactor::{Interest, Reactor};

thread_local! {
    static HOOK_ENABLED: Cell<bool> = Cell::new(false);
}

/// Whether hooked calls on this thread go through the reactor.
#[inline]
pub fn is_hook_enabled() -> bool {
    HOOK_ENABLED.with(|flag| flag.get())
}

/// Enable or disable hooking for the calling thread.
#[inline]
pub fn set_hook_enabled(enabled: bool) {
    HOOK_ENABLED.with(|flag| flag.set(enabled));
}

#[inline]
fn errno() -> c_int {
    unsafe { *libc::__errno_location() }
}

#[inline]
fn set_errno(code: c_int) {
    unsafe { *libc::__errno_location() = code };
}

/// Cancellation token shared between a suspended I/O call and its condition
/// timer. A non-zero value is the errno the wakeup must surface.
#[derive(Default)]
struct IoToken {
    cancelled: AtomicI32,
}

/// Arm the timeout for a suspended I/O call: when it fires first, it marks
/// the token and cancels the registration, which resumes the waiter.
fn arm_io_timer(
    reactor: &Reactor,
    fd: c_int,
    interest: Interest,
    timeout_ms: u64,
    token: &Arc<IoToken>,
) -> Option<crate::timer::Timer> {
    if timeout_ms == NO_TIMEOUT {
        return None;
    }
    let weak_token = Arc::downgrade(token);
    let weak_reactor = reactor.downgrade();
    let cb = move || {
        let token = match weak_token.upgrade() {
            Some(token) => token,
            None => return,
        };
        if token.cancelled.load(Ordering::SeqCst) != 0 {
            return;
        }
        token.cancelled.store(libc::ETIMEDOUT, Ordering::SeqCst);
        if let Some(reactor) = weak_reactor.upgrade() {
            reactor.cancel_event(fd, interest);
        }
    };
    Some(reactor.add_condition_timer(timeout_ms, cb, Arc::downgrade(token), false))
}

/// The generic register-yield-retry contract shared by the whole I/O family.
unsafe fn do_io<F>(fd: c_int, name: &str, interest: Interest, mut raw: F) -> ssize_t
where
    F: FnMut() -> ssize_t,
{
    if !is_hook_enabled() {
        return raw();
    }
    let entry = match fd::registry().get(fd, false) {
        Some(entry) => entry,
        None => return raw(),
    };
    if entry.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !entry.is_socket() || entry.user_nonblock() {
        return raw();
    }

    let timeout_ms = if interest == Interest::WRITE {
        entry.send_timeout_ms()
    } else {
        entry.recv_timeout_ms()
    };
    let token = Arc::new(IoToken::default());

    loop {
        let mut res = raw();
        while res == -1 && errno() == libc::EINTR {
            res = raw();
        }
        if !(res == -1 && errno() == libc::EAGAIN) {
            return res;
        }

        // would block: suspend until readiness or timeout
        let reactor = match Reactor::current() {
            Some(reactor) => reactor,
            // no reactor to wait on; report the would-block as is
            None => return res,
        };
        let timer = arm_io_timer(&reactor, fd, interest, timeout_ms, &token);
        if let Err(err) = reactor.add_event(fd, interest) {
            error!("{}: registering {:?} on fd {} failed: {}", name, interest, fd, err);
            if let Some(timer) = timer {
                timer.cancel();
            }
            return -1;
        }
        Fiber::yield_to_hold();
        // resumed either by readiness or by the timeout callback
        if let Some(timer) = timer {
            timer.cancel();
        }
        let cancelled = token.cancelled.load(Ordering::SeqCst);
        if cancelled != 0 {
            set_errno(cancelled);
            return -1;
        }
    }
}

/// Park the current fiber on a timer. Returns false when the thread has no
/// reactor to wait on.
fn sleep_ms(ms: u64) -> bool {
    let reactor = match Reactor::current() {
        Some(reactor) => reactor,
        None => return false,
    };
    let sched = reactor.scheduler().clone();
    let fiber = Fiber::current();
    reactor.add_timer(
        ms,
        move || {
            sched.schedule(&fiber);
        },
        false,
    );
    Fiber::yield_to_hold();
    true
}

pub fn sleep(seconds: c_uint) -> c_uint {
    if !is_hook_enabled() {
        return unsafe { libc::sleep(seconds) };
    }
    if sleep_ms(seconds as u64 * 1_000) {
        0
    } else {
        unsafe { libc::sleep(seconds) }
    }
}

pub fn usleep(usec: libc::useconds_t) -> c_int {
    if !is_hook_enabled() {
        return unsafe { libc::usleep(usec) };
    }
    if sleep_ms(usec as u64 / 1_000) {
        0
    } else {
        unsafe { libc::usleep(usec) }
    }
}

/// # Safety
/// `req` must point to a valid timespec; `rem`, when non-null, to writable
/// memory.
pub unsafe fn nanosleep(req: *const libc::timespec, rem: *mut libc::timespec) -> c_int {
    if !is_hook_enabled() {
        return libc::nanosleep(req, rem);
    }
    if req.is_null() {
        set_errno(libc::EINVAL);
        return -1;
    }
    let ms = (*req).tv_sec as u64 * 1_000 + (*req).tv_nsec as u64 / 1_000_000;
    if sleep_ms(ms) {
        0
    } else {
        libc::nanosleep(req, rem)
    }
}

/// Create a socket and adopt it into the fd registry (which forces the
/// kernel non-blocking flag).
pub fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
    let fd = unsafe { libc::socket(domain, ty, protocol) };
    if !is_hook_enabled() || fd < 0 {
        return fd;
    }
    fd::registry().get(fd, true);
    fd
}

/// `connect` with an explicit timeout in milliseconds ([`NO_TIMEOUT`] waits
/// forever). After the WRITE readiness wakeup the real outcome is read back
/// with `getsockopt(SO_ERROR)`.
///
/// # Safety
/// `addr` must point to a valid socket address of `addrlen` bytes.
pub unsafe fn connect_with_timeout(
    sockfd: c_int,
    addr: *const libc::sockaddr,
    addrlen: socklen_t,
    timeout_ms: u64,
) -> c_int {
    if !is_hook_enabled() {
        return libc::connect(sockfd, addr, addrlen);
    }
    let entry = match fd::registry().get(sockfd, false) {
        Some(entry) => entry,
        None => return libc::connect(sockfd, addr, addrlen),
    };
    if entry.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !entry.is_socket() || entry.user_nonblock() {
        return libc::connect(sockfd, addr, addrlen);
    }

    let res = libc::connect(sockfd, addr, addrlen);
    if res == 0 {
        return 0;
    }
    if res != -1 || errno() != libc::EINPROGRESS {
        return res;
    }

    let reactor = match Reactor::current() {
        Some(reactor) => reactor,
        None => return res,
    };
    let token = Arc::new(IoToken::default());
    let timer = arm_io_timer(&reactor, sockfd, Interest::WRITE, timeout_ms, &token);
    if let Err(err) = reactor.add_event(sockfd, Interest::WRITE) {
        error!("connect: registering WRITE on fd {} failed: {}", sockfd, err);
        if let Some(timer) = timer {
            timer.cancel();
        }
        return -1;
    }
    Fiber::yield_to_hold();
    if let Some(timer) = timer {
        timer.cancel();
    }
    let cancelled = token.cancelled.load(Ordering::SeqCst);
    if cancelled != 0 {
        set_errno(cancelled);
        return -1;
    }

    let mut err: c_int = 0;
    let mut len = std::mem::size_of::<c_int>() as socklen_t;
    if libc::getsockopt(
        sockfd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut err as *mut c_int as *mut c_void,
        &mut len,
    ) == -1
    {
        return -1;
    }
    if err != 0 {
        set_errno(err);
        return -1;
    }
    0
}

/// # Safety
/// `addr` must point to a valid socket address of `addrlen` bytes.
pub unsafe fn connect(sockfd: c_int, addr: *const libc::sockaddr, addrlen: socklen_t) -> c_int {
    connect_with_timeout(sockfd, addr, addrlen, config::get().tcp_connect_timeout_ms)
}

/// # Safety
/// `addr`/`addrlen`, when non-null, follow the `accept(2)` contract.
pub unsafe fn accept(
    sockfd: c_int,
    addr: *mut libc::sockaddr,
    addrlen: *mut socklen_t,
) -> c_int {
    let fd = do_io(sockfd, "accept", Interest::READ, || {
        unsafe { libc::accept(sockfd, addr, addrlen) as ssize_t }
    }) as c_int;
    if fd >= 0 {
        fd::registry().get(fd, true);
    }
    fd
}

/// # Safety
/// `buf` must be valid for writes of `count` bytes.
pub unsafe fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    do_io(fd, "read", Interest::READ, || unsafe { libc::read(fd, buf, count) })
}

/// # Safety
/// `iov` must point to `iovcnt` valid iovecs.
pub unsafe fn readv(fd: c_int, iov: *const libc::iovec, iovcnt: c_int) -> ssize_t {
    do_io(fd, "readv", Interest::READ, || unsafe { libc::readv(fd, iov, iovcnt) })
}

/// # Safety
/// `buf` must be valid for writes of `len` bytes.
pub unsafe fn recv(sockfd: c_int, buf: *mut c_void, len: size_t, flags: c_int) -> ssize_t {
    do_io(sockfd, "recv", Interest::READ, || unsafe {
        libc::recv(sockfd, buf, len, flags)
    })
}

/// # Safety
/// `buf`, `src_addr` and `addrlen` follow the `recvfrom(2)` contract.
pub unsafe fn recvfrom(
    sockfd: c_int,
    buf: *mut c_void,
    len: size_t,
    flags: c_int,
    src_addr: *mut libc::sockaddr,
    addrlen: *mut socklen_t,
) -> ssize_t {
    do_io(sockfd, "recvfrom", Interest::READ, || unsafe {
        libc::recvfrom(sockfd, buf, len, flags, src_addr, addrlen)
    })
}

/// # Safety
/// `msg` must point to a valid msghdr.
pub unsafe fn recvmsg(sockfd: c_int, msg: *mut libc::msghdr, flags: c_int) -> ssize_t {
    do_io(sockfd, "recvmsg", Interest::READ, || unsafe {
        libc::recvmsg(sockfd, msg, flags)
    })
}

/// # Safety
/// `buf` must be valid for reads of `count` bytes.
pub unsafe fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
    do_io(fd, "write", Interest::WRITE, || unsafe { libc::write(fd, buf, count) })
}

/// # Safety
/// `iov` must point to `iovcnt` valid iovecs.
pub unsafe fn writev(fd: c_int, iov: *const libc::iovec, iovcnt: c_int) -> ssize_t {
    do_io(fd, "writev", Interest::WRITE, || unsafe {
        libc::writev(fd, iov, iovcnt)
    })
}

/// # Safety
/// `buf` must be valid for reads of `len` bytes.
pub unsafe fn send(sockfd: c_int, buf: *const c_void, len: size_t, flags: c_int) -> ssize_t {
    do_io(sockfd, "send", Interest::WRITE, || unsafe {
        libc::send(sockfd, buf, len, flags)
    })
}

/// # Safety
/// `buf` and `dest_addr` follow the `sendto(2)` contract.
pub unsafe fn sendto(
    sockfd: c_int,
    buf: *const c_void,
    len: size_t,
    flags: c_int,
    dest_addr: *const libc::sockaddr,
    addrlen: socklen_t,
) -> ssize_t {
    do_io(sockfd, "sendto", Interest::WRITE, || unsafe {
        libc::sendto(sockfd, buf, len, flags, dest_addr, addrlen)
    })
}

/// # Safety
/// `msg` must point to a valid msghdr.
pub unsafe fn sendmsg(sockfd: c_int, msg: *const libc::msghdr, flags: c_int) -> ssize_t {
    do_io(sockfd, "sendmsg", Interest::WRITE, || unsafe {
        libc::sendmsg(sockfd, msg, flags)
    })
}

/// Close `fd`, cancelling every outstanding registration on it (their
/// waiters resume on an error path) and dropping its registry record.
pub fn close(fd: c_int) -> c_int {
    if !is_hook_enabled() {
        return unsafe { libc::close(fd) };
    }
    if fd::registry().get(fd, false).is_some() {
        if let Some(reactor) = Reactor::current() {
            reactor.cancel_all(fd);
        }
        fd::registry().remove(fd);
    }
    unsafe { libc::close(fd) }
}

/// `fcntl` for the integer-argument commands.
///
/// `F_SETFL` records the O_NONBLOCK bit the user asked for and keeps the
/// kernel flag forced on for sockets; `F_GETFL` reports the flags the user
/// thinks are set. Everything else passes through. Lock and owner commands
/// taking struct pointers are not covered; call libc directly for those.
pub fn fcntl(fd: c_int, cmd: c_int, arg: c_int) -> c_int {
    match cmd {
        libc::F_SETFL => {
            let entry = fd::registry().get(fd, false);
            match entry {
                Some(entry) if is_hook_enabled() && entry.is_socket() && !entry.is_closed() => {
                    entry.set_user_nonblock(arg & libc::O_NONBLOCK != 0);
                    let arg = if entry.sys_nonblock() {
                        arg | libc::O_NONBLOCK
                    } else {
                        arg & !libc::O_NONBLOCK
                    };
                    unsafe { libc::fcntl(fd, cmd, arg) }
                }
                _ => unsafe { libc::fcntl(fd, cmd, arg) },
            }
        }
        libc::F_GETFL => {
            let flags = unsafe { libc::fcntl(fd, cmd) };
            if flags == -1 || !is_hook_enabled() {
                return flags;
            }
            match fd::registry().get(fd, false) {
                Some(entry) if entry.is_socket() && !entry.is_closed() => {
                    if entry.user_nonblock() {
                        flags | libc::O_NONBLOCK
                    } else {
                        flags & !libc::O_NONBLOCK
                    }
                }
                _ => flags,
            }
        }
        _ => unsafe { libc::fcntl(fd, cmd, arg) },
    }
}

/// `ioctl`. `FIONBIO` is recorded as the user's non-blocking request, like
/// `F_SETFL` with `O_NONBLOCK`.
///
/// # Safety
/// `arg` must match what the request expects.
pub unsafe fn ioctl(fd: c_int, request: c_ulong, arg: *mut c_void) -> c_int {
    if request == libc::FIONBIO as c_ulong && is_hook_enabled() && !arg.is_null() {
        if let Some(entry) = fd::registry().get(fd, false) {
            if entry.is_socket() && !entry.is_closed() {
                entry.set_user_nonblock(*(arg as *const c_int) != 0);
            }
        }
    }
    libc::ioctl(fd, request, arg)
}

/// # Safety
/// `optval`/`optlen` follow the `getsockopt(2)` contract.
pub unsafe fn getsockopt(
    sockfd: c_int,
    level: c_int,
    optname: c_int,
    optval: *mut c_void,
    optlen: *mut socklen_t,
) -> c_int {
    libc::getsockopt(sockfd, level, optname, optval, optlen)
}

/// `setsockopt`. `SO_RCVTIMEO`/`SO_SNDTIMEO` are captured into the fd
/// record so hooked I/O honors them; the raw call is still issued so that
/// non-hooked readers of the option see consistent values.
///
/// # Safety
/// `optval` must point to `optlen` valid bytes.
pub unsafe fn setsockopt(
    sockfd: c_int,
    level: c_int,
    optname: c_int,
    optval: *const c_void,
    optlen: socklen_t,
) -> c_int {
    if is_hook_enabled()
        && level == libc::SOL_SOCKET
        && (optname == libc::SO_RCVTIMEO || optname == libc::SO_SNDTIMEO)
        && !optval.is_null()
        && optlen as usize >= std::mem::size_of::<libc::timeval>()
    {
        if let Some(entry) = fd::registry().get(sockfd, false) {
            let tv = &*(optval as *const libc::timeval);
            let ms = tv.tv_sec as u64 * 1_000 + tv.tv_usec as u64 / 1_000;
            if optname == libc::SO_RCVTIMEO {
                entry.set_recv_timeout_ms(ms);
            } else {
                entry.set_send_timeout_ms(ms);
            }
        }
    }
    libc::setsockopt(sockfd, level, optname, optval, optlen)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enable_flag_round_trips() {
        assert!(!is_hook_enabled());
        set_hook_enabled(true);
        assert!(is_hook_enabled());
        set_hook_enabled(false);
        assert!(!is_hook_enabled());
    }

    #[test]
    fn socket_without_hook_is_a_plain_socket() {
        assert!(!is_hook_enabled());
        let fd = socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        assert!(fd >= 0);
        // not adopted: the registry knows nothing about it and the kernel
        // flag was left alone
        assert!(crate::fd::registry().get(fd, false).is_none());
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
        assert_eq!(flags & libc::O_NONBLOCK, 0);
        unsafe { libc::close(fd) };
    }
}
