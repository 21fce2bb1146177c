//! Cooperative TCP stream and listener.
//!
//! Thin wrappers over the hooked syscall surface, so that server code
//! written against `std::io::Read`/`Write` suspends the calling fiber
//! instead of blocking its thread. Use them from fibers running on a
//! reactor; on a non-hooked thread they behave like plain non-blocking
//! sockets.

use std::io::{self, Read, Write};
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};
use std::time::Duration;

use libc::{c_int, c_void, socklen_t};

use crate::config;
use crate::fd::{self, NO_TIMEOUT};
use crate::hook;
use crate::Result;

fn sockaddr_from(addr: &SocketAddr) -> (libc::sockaddr_storage, socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in;
            unsafe {
                (*sin).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sin).sin_port = v4.port().to_be();
                (*sin).sin_addr = libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                };
            }
            (storage, mem::size_of::<libc::sockaddr_in>() as socklen_t)
        }
        SocketAddr::V6(v6) => {
            let sin6 = &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in6;
            unsafe {
                (*sin6).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sin6).sin6_port = v6.port().to_be();
                (*sin6).sin6_flowinfo = v6.flowinfo();
                (*sin6).sin6_addr.s6_addr = v6.ip().octets();
                (*sin6).sin6_scope_id = v6.scope_id();
            }
            (storage, mem::size_of::<libc::sockaddr_in6>() as socklen_t)
        }
    }
}

fn sockaddr_into(storage: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            let sin = unsafe {
                &*(storage as *const libc::sockaddr_storage as *const libc::sockaddr_in)
            };
            Ok(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes()),
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe {
                &*(storage as *const libc::sockaddr_storage as *const libc::sockaddr_in6)
            };
            Ok(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        family => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported address family {}", family),
        )),
    }
}

fn timeout_ms(timeout: Option<Duration>) -> u64 {
    match timeout {
        Some(t) => t.as_millis() as u64,
        None => NO_TIMEOUT,
    }
}

/// A TCP connection whose reads and writes suspend the calling fiber.
pub struct TcpStream {
    fd: RawFd,
}

impl TcpStream {
    /// Open a connection using the configured `tcp.connect.timeout`.
    pub fn connect<A: ToSocketAddrs>(addr: A) -> Result<TcpStream> {
        Self::connect_ms(addr, config::get().tcp_connect_timeout_ms)
    }

    /// Open a connection with an explicit timeout.
    pub fn connect_timeout<A: ToSocketAddrs>(addr: A, timeout: Duration) -> Result<TcpStream> {
        Self::connect_ms(addr, timeout.as_millis() as u64)
    }

    fn connect_ms<A: ToSocketAddrs>(addr: A, timeout_ms: u64) -> Result<TcpStream> {
        let mut last_err: Option<io::Error> = None;
        for sockaddr in addr.to_socket_addrs().map_err(crate::Error::IO)? {
            let domain = if sockaddr.is_ipv4() {
                libc::AF_INET
            } else {
                libc::AF_INET6
            };
            let fd = hook::socket(domain, libc::SOCK_STREAM, 0);
            if fd < 0 {
                last_err = Some(io::Error::last_os_error());
                continue;
            }
            // adopt the fd even when called from a non-hooked thread
            fd::registry().get(fd, true);
            let (storage, len) = sockaddr_from(&sockaddr);
            let rc = unsafe {
                hook::connect_with_timeout(
                    fd,
                    &storage as *const libc::sockaddr_storage as *const libc::sockaddr,
                    len,
                    timeout_ms,
                )
            };
            if rc == 0 {
                return Ok(TcpStream { fd });
            }
            last_err = Some(io::Error::last_os_error());
            hook::close(fd);
        }
        let err = last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "no address to connect to")
        });
        if err.raw_os_error() == Some(libc::ETIMEDOUT) {
            return Err(crate::Error::Timeout);
        }
        Err(err.into())
    }

    /// Receive timeout for subsequent reads; `None` waits forever.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) {
        if let Some(entry) = fd::registry().get(self.fd, true) {
            entry.set_recv_timeout_ms(timeout_ms(timeout));
        }
    }

    /// Send timeout for subsequent writes; `None` waits forever.
    pub fn set_write_timeout(&self, timeout: Option<Duration>) {
        if let Some(entry) = fd::registry().get(self.fd, true) {
            entry.set_send_timeout_ms(timeout_ms(timeout));
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
        let rc = unsafe {
            libc::getsockname(
                self.fd,
                &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
                &mut len,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(sockaddr_into(&storage)?)
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
        let rc = unsafe {
            libc::getpeername(
                self.fd,
                &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
                &mut len,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(sockaddr_into(&storage)?)
    }
}

impl Read for TcpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe {
            hook::recv(self.fd, buf.as_mut_ptr() as *mut c_void, buf.len(), 0)
        };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }
}

impl Write for TcpStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = unsafe {
            hook::send(
                self.fd,
                buf.as_ptr() as *const c_void,
                buf.len(),
                libc::MSG_NOSIGNAL,
            )
        };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AsRawFd for TcpStream {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl FromRawFd for TcpStream {
    unsafe fn from_raw_fd(fd: RawFd) -> TcpStream {
        fd::registry().get(fd, true);
        TcpStream { fd }
    }
}

impl IntoRawFd for TcpStream {
    fn into_raw_fd(self) -> RawFd {
        let fd = self.fd;
        mem::forget(self);
        fd
    }
}

impl Drop for TcpStream {
    fn drop(&mut self) {
        hook::close(self.fd);
    }
}

/// A TCP listener whose `accept` suspends the calling fiber.
pub struct TcpListener {
    fd: RawFd,
}

impl TcpListener {
    pub fn bind<A: ToSocketAddrs>(addr: A) -> Result<TcpListener> {
        let mut last_err: Option<io::Error> = None;
        for sockaddr in addr.to_socket_addrs().map_err(crate::Error::IO)? {
            let domain = if sockaddr.is_ipv4() {
                libc::AF_INET
            } else {
                libc::AF_INET6
            };
            let fd = hook::socket(domain, libc::SOCK_STREAM, 0);
            if fd < 0 {
                last_err = Some(io::Error::last_os_error());
                continue;
            }
            fd::registry().get(fd, true);
            let one: c_int = 1;
            unsafe {
                libc::setsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_REUSEADDR,
                    &one as *const c_int as *const c_void,
                    mem::size_of::<c_int>() as socklen_t,
                );
            }
            let (storage, len) = sockaddr_from(&sockaddr);
            let rc = unsafe {
                libc::bind(
                    fd,
                    &storage as *const libc::sockaddr_storage as *const libc::sockaddr,
                    len,
                )
            };
            if rc != 0 || unsafe { libc::listen(fd, libc::SOMAXCONN) } != 0 {
                last_err = Some(io::Error::last_os_error());
                hook::close(fd);
                continue;
            }
            return Ok(TcpListener { fd });
        }
        Err(last_err
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no address to bind"))
            .into())
    }

    /// Accept one connection. The accepted socket gets the configured
    /// `tcp_server.read_timeout` as its receive timeout.
    pub fn accept(&self) -> Result<(TcpStream, SocketAddr)> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
        let fd = unsafe {
            hook::accept(
                self.fd,
                &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
                &mut len,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        if let Some(entry) = fd::registry().get(fd, true) {
            entry.set_recv_timeout_ms(config::get().tcp_server_read_timeout_ms);
        }
        let peer = sockaddr_into(&storage)?;
        Ok((TcpStream { fd }, peer))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
        let rc = unsafe {
            libc::getsockname(
                self.fd,
                &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
                &mut len,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(sockaddr_into(&storage)?)
    }
}

impl AsRawFd for TcpListener {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for TcpListener {
    fn drop(&mut self) {
        hook::close(self.fd);
    }
}
