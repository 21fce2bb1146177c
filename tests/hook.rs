use std::mem;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::unix::io::RawFd;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use libc::{c_int, c_void, socklen_t};

use filament::{clock, fd, hook, net, Reactor};

const WAIT: Duration = Duration::from_secs(5);

fn socket_pair() -> (RawFd, RawFd) {
    let mut fds = [0 as RawFd; 2];
    let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
    assert_eq!(rc, 0);
    (fds[0], fds[1])
}

#[test]
fn connect_refusal_reports_econnrefused_quickly() {
    let reactor = Reactor::new(1, false, "refused").unwrap();
    let (tx, rx) = mpsc::channel();
    reactor.schedule_call(move || {
        let t0 = clock::now_ms();
        let res = net::TcpStream::connect_timeout("127.0.0.1:1", Duration::from_secs(3));
        let errno = match &res {
            Err(err) => err.raw_os_error(),
            Ok(_) => None,
        };
        tx.send((res.is_err(), errno, clock::now_ms() - t0)).unwrap();
    });
    let (is_err, errno, elapsed) = rx.recv_timeout(WAIT).unwrap();
    assert!(is_err);
    assert_eq!(errno, Some(libc::ECONNREFUSED));
    assert!(elapsed < 500, "refusal took {}ms", elapsed);
    assert_eq!(reactor.pending_event_count(), 0);
    assert!(!reactor.has_pending_timers());
    reactor.stop();
}

/// A listener whose accept queue is already full: further SYNs are dropped,
/// so a connect can only hang until its timeout.
fn saturated_listener() -> (RawFd, SocketAddr, Vec<RawFd>) {
    unsafe {
        let listener = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        assert!(listener >= 0);
        let addr = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: 0,
            sin_addr: libc::in_addr {
                s_addr: u32::from_ne_bytes(Ipv4Addr::LOCALHOST.octets()),
            },
            sin_zero: [0; 8],
        };
        let rc = libc::bind(
            listener,
            &addr as *const libc::sockaddr_in as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as socklen_t,
        );
        assert_eq!(rc, 0);
        assert_eq!(libc::listen(listener, 1), 0);

        let mut bound: libc::sockaddr_in = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_in>() as socklen_t;
        assert_eq!(
            libc::getsockname(
                listener,
                &mut bound as *mut libc::sockaddr_in as *mut libc::sockaddr,
                &mut len,
            ),
            0
        );
        let port = u16::from_be(bound.sin_port);
        let sockaddr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port));

        let mut fillers = Vec::new();
        for _ in 0..8 {
            let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
            assert!(fd >= 0);
            let flags = libc::fcntl(fd, libc::F_GETFL, 0);
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
            libc::connect(
                fd,
                &bound as *const libc::sockaddr_in as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_in>() as socklen_t,
            );
            fillers.push(fd);
        }
        // let the handshakes that can complete do so
        thread::sleep(Duration::from_millis(100));
        (listener, sockaddr, fillers)
    }
}

#[test]
fn connect_timeout_surfaces_etimedout() {
    let (listener, addr, fillers) = saturated_listener();
    let reactor = Reactor::new(1, false, "timeout").unwrap();
    let (tx, rx) = mpsc::channel();
    reactor.schedule_call(move || {
        let t0 = clock::now_ms();
        let res = net::TcpStream::connect_timeout(addr, Duration::from_millis(500));
        let errno = match &res {
            Err(err) => err.raw_os_error(),
            Ok(_) => None,
        };
        tx.send((errno, clock::now_ms() - t0)).unwrap();
    });
    let (errno, elapsed) = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(errno, Some(libc::ETIMEDOUT));
    assert!(
        (450..=900).contains(&elapsed),
        "timed out after {}ms instead of ~500ms",
        elapsed
    );
    assert_eq!(reactor.pending_event_count(), 0);
    reactor.stop();
    unsafe {
        for fd in fillers {
            libc::close(fd);
        }
        libc::close(listener);
    }
}

#[test]
fn zero_receive_timeout_times_out_immediately() {
    let reactor = Reactor::new(1, false, "zero").unwrap();
    let (a, b) = socket_pair();
    let (tx, rx) = mpsc::channel();
    reactor.schedule_call(move || {
        fd::registry().get(a, true);
        let tv = libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        };
        unsafe {
            hook::setsockopt(
                a,
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &tv as *const libc::timeval as *const c_void,
                mem::size_of::<libc::timeval>() as socklen_t,
            );
        }
        let t0 = clock::now_ms();
        let mut buf = [0u8; 8];
        let n = unsafe { hook::recv(a, buf.as_mut_ptr() as *mut c_void, buf.len(), 0) };
        let errno = std::io::Error::last_os_error().raw_os_error();
        hook::close(a);
        tx.send((n, errno, clock::now_ms() - t0)).unwrap();
    });
    let (n, errno, elapsed) = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(n, -1);
    assert_eq!(errno, Some(libc::ETIMEDOUT));
    assert!(elapsed < 100, "zero timeout took {}ms", elapsed);
    unsafe { libc::close(b) };
    reactor.stop();
}

#[test]
fn user_nonblock_is_tracked_separately_from_the_kernel_flag() {
    let reactor = Reactor::new(1, false, "flags").unwrap();
    let (tx, rx) = mpsc::channel();
    reactor.schedule_call(move || {
        let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        assert!(fd >= 0);
        let kernel_on = unsafe { libc::fcntl(fd, libc::F_GETFL) } & libc::O_NONBLOCK != 0;
        let user_before = hook::fcntl(fd, libc::F_GETFL, 0) & libc::O_NONBLOCK != 0;

        let flags = hook::fcntl(fd, libc::F_GETFL, 0);
        hook::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        let user_after_set = hook::fcntl(fd, libc::F_GETFL, 0) & libc::O_NONBLOCK != 0;

        let mut off: c_int = 0;
        unsafe {
            hook::ioctl(fd, libc::FIONBIO as libc::c_ulong, &mut off as *mut c_int as *mut c_void)
        };
        let user_after_clear = hook::fcntl(fd, libc::F_GETFL, 0) & libc::O_NONBLOCK != 0;
        // whatever the user toggles, the kernel flag stays forced on
        let kernel_still_on = unsafe { libc::fcntl(fd, libc::F_GETFL) } & libc::O_NONBLOCK != 0;
        hook::close(fd);
        tx.send((kernel_on, user_before, user_after_set, user_after_clear, kernel_still_on))
            .unwrap();
    });
    let (kernel_on, user_before, user_after_set, user_after_clear, kernel_still_on) =
        rx.recv_timeout(WAIT).unwrap();
    assert!(kernel_on);
    assert!(!user_before);
    assert!(user_after_set);
    assert!(!user_after_clear);
    assert!(kernel_still_on);
    reactor.stop();
}

#[test]
fn user_nonblocking_sockets_pass_through() {
    let reactor = Reactor::new(1, false, "passthrough").unwrap();
    let (a, b) = socket_pair();
    let (tx, rx) = mpsc::channel();
    reactor.schedule_call(move || {
        fd::registry().get(a, true);
        let flags = hook::fcntl(a, libc::F_GETFL, 0);
        hook::fcntl(a, libc::F_SETFL, flags | libc::O_NONBLOCK);
        let t0 = clock::now_ms();
        let mut buf = [0u8; 8];
        let n = unsafe { hook::recv(a, buf.as_mut_ptr() as *mut c_void, buf.len(), 0) };
        let errno = std::io::Error::last_os_error().raw_os_error();
        hook::close(a);
        tx.send((n, errno, clock::now_ms() - t0)).unwrap();
    });
    let (n, errno, elapsed) = rx.recv_timeout(WAIT).unwrap();
    // a socket the user made non-blocking reports EAGAIN instead of parking
    assert_eq!(n, -1);
    assert_eq!(errno, Some(libc::EAGAIN));
    assert!(elapsed < 100);
    unsafe { libc::close(b) };
    reactor.stop();
}
