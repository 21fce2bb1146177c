//! Per-file-descriptor registry.
//!
//! The hook layer needs to know, for every fd it sees, whether the fd is a
//! socket, which timeouts apply, and which non-blocking flag the *user*
//! thinks is set. Records are created lazily on first use and dropped when
//! the fd is closed through the hook layer.
//!
//! The kernel descriptor of every socket is forced to `O_NONBLOCK` the
//! moment it enters the registry, so that raw I/O returns `EAGAIN` promptly.
//! The flag the user requested via `fcntl`/`ioctl` is tracked separately and
//! is what `F_GETFL` reports back.

use std::mem::MaybeUninit;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;

/// Sentinel for "no timeout configured".
pub const NO_TIMEOUT: u64 = u64::MAX;

/// State tracked for one file descriptor.
#[derive(Debug)]
pub struct FdEntry {
    fd: RawFd,
    is_socket: bool,
    /// The kernel-level O_NONBLOCK flag. Always true for sockets.
    sys_nonblock: bool,
    /// The O_NONBLOCK flag the user asked for.
    user_nonblock: AtomicBool,
    closed: AtomicBool,
    recv_timeout_ms: AtomicU64,
    send_timeout_ms: AtomicU64,
}

impl FdEntry {
    fn new(fd: RawFd) -> Self {
        let mut is_socket = false;
        let mut sys_nonblock = false;

        let mut status = MaybeUninit::<libc::stat>::uninit();
        if unsafe { libc::fstat(fd, status.as_mut_ptr()) } == 0 {
            let status = unsafe { status.assume_init() };
            is_socket = status.st_mode & libc::S_IFMT == libc::S_IFSOCK;
        }

        if is_socket {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
            if flags >= 0 && flags & libc::O_NONBLOCK == 0 {
                unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
            }
            sys_nonblock = true;
        }

        FdEntry {
            fd,
            is_socket,
            sys_nonblock,
            user_nonblock: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            recv_timeout_ms: AtomicU64::new(NO_TIMEOUT),
            send_timeout_ms: AtomicU64::new(NO_TIMEOUT),
        }
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[inline]
    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock
    }

    #[inline]
    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_user_nonblock(&self, on: bool) {
        self.user_nonblock.store(on, Ordering::Release);
    }

    #[inline]
    pub fn recv_timeout_ms(&self) -> u64 {
        self.recv_timeout_ms.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_recv_timeout_ms(&self, ms: u64) {
        self.recv_timeout_ms.store(ms, Ordering::Release);
    }

    #[inline]
    pub fn send_timeout_ms(&self) -> u64 {
        self.send_timeout_ms.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_send_timeout_ms(&self, ms: u64) {
        self.send_timeout_ms.store(ms, Ordering::Release);
    }
}

/// Process-wide map from fd to [`FdEntry`].
///
/// Reads vastly outnumber writes (records are created on fd creation and
/// dropped on close), hence the read-write lock over a fd-indexed vector.
pub struct FdRegistry {
    slots: RwLock<Vec<Option<Arc<FdEntry>>>>,
}

impl FdRegistry {
    fn new() -> Self {
        FdRegistry {
            slots: RwLock::new(vec![None; 64]),
        }
    }

    /// Look up the record for `fd`, creating it when `create` is set.
    pub fn get(&self, fd: RawFd, create: bool) -> Option<Arc<FdEntry>> {
        if fd < 0 {
            return None;
        }
        let idx = fd as usize;
        {
            let slots = self.slots.read().unwrap();
            if let Some(Some(entry)) = slots.get(idx) {
                return Some(entry.clone());
            }
        }
        if !create {
            return None;
        }

        let mut slots = self.slots.write().unwrap();
        if idx >= slots.len() {
            slots.resize(idx + idx / 2 + 1, None);
        }
        // Another thread may have won the race between the two locks.
        if let Some(entry) = &slots[idx] {
            return Some(entry.clone());
        }
        let entry = Arc::new(FdEntry::new(fd));
        slots[idx] = Some(entry.clone());
        Some(entry)
    }

    /// Drop the record for `fd`. Subsequent lookups return absent.
    pub fn remove(&self, fd: RawFd) {
        if fd < 0 {
            return;
        }
        let mut slots = self.slots.write().unwrap();
        if let Some(slot) = slots.get_mut(fd as usize) {
            if let Some(entry) = slot.take() {
                entry.closed.store(true, Ordering::Release);
            }
        }
    }
}

static REGISTRY: Lazy<FdRegistry> = Lazy::new(FdRegistry::new);

/// The process-wide fd registry.
#[inline]
pub fn registry() -> &'static FdRegistry {
    &REGISTRY
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::UdpSocket;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn pipe_is_not_a_socket() {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let entry = registry().get(fds[0], true).unwrap();
        assert!(!entry.is_socket());
        assert!(!entry.sys_nonblock());
        registry().remove(fds[0]);
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn socket_is_forced_nonblocking() {
        let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        let fd = sock.as_raw_fd();
        let entry = registry().get(fd, true).unwrap();
        assert!(entry.is_socket());
        assert!(entry.sys_nonblock());
        // The registry touched the kernel flag, not the user-visible one.
        assert!(!entry.user_nonblock());
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
        assert!(flags & libc::O_NONBLOCK != 0);
        registry().remove(fd);
    }

    #[test]
    fn lookup_after_remove_is_absent() {
        let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        let fd = sock.as_raw_fd();
        let entry = registry().get(fd, true).unwrap();
        registry().remove(fd);
        assert!(entry.is_closed());
        assert!(registry().get(fd, false).is_none());
    }

    #[test]
    fn timeouts_default_to_infinity() {
        let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        let fd = sock.as_raw_fd();
        let entry = registry().get(fd, true).unwrap();
        assert_eq!(entry.recv_timeout_ms(), NO_TIMEOUT);
        assert_eq!(entry.send_timeout_ms(), NO_TIMEOUT);
        entry.set_recv_timeout_ms(250);
        assert_eq!(entry.recv_timeout_ms(), 250);
        registry().remove(fd);
    }

    #[test]
    fn negative_fd_is_rejected() {
        assert!(registry().get(-1, true).is_none());
    }
}
