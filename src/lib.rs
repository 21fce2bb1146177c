//! Filament: a cooperative M:N fiber runtime.
//!
//! Application code written in straight-line blocking style runs inside
//! stackful [fibers](fiber) dispatched by an M:N [scheduler](sched) over a
//! thread pool. The [reactor](reactor) extends the scheduler with an epoll
//! loop and a deadline-ordered [timer set](mod@timer); the [hook](mod@hook)
//! layer re-implements the blocking syscall surface on top of them, so a
//! `recv` that would block instead parks its fiber until the kernel reports
//! readiness or the configured timeout elapses.
//!
//! - [Fibers: stackful coroutines with explicit resume/yield](fiber)
//! - [Scheduler: thread pool + shared task queue](sched)
//! - [Reactor: epoll + timers behind the scheduler's idle loop](reactor)
//! - [Timers: deadline-ordered set with condition timers](mod@timer)
//! - [FD registry: per-descriptor flags and timeouts](fd)
//! - [Hooked syscalls](mod@hook) and [cooperative TCP wrappers](net)
//! - [Configuration](config), [error handling](error), monotonic [clock]
//!
//! ```no_run
//! use std::io::{Read, Write};
//! use filament::{net, reactor::Reactor};
//!
//! let reactor = Reactor::new(4, false, "echo").unwrap();
//! reactor.schedule_call(|| {
//!     let listener = net::TcpListener::bind("127.0.0.1:8080").unwrap();
//!     loop {
//!         let (mut stream, _peer) = listener.accept().unwrap();
//!         Reactor::current().unwrap().schedule_call(move || {
//!             let mut buf = [0u8; 4096];
//!             while let Ok(n) = stream.read(&mut buf) {
//!                 if n == 0 || stream.write_all(&buf[..n]).is_err() {
//!                     break;
//!                 }
//!             }
//!         });
//!     }
//! });
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod fd;
pub mod fiber;
pub mod hook;
pub mod net;
pub mod reactor;
pub mod sched;
pub mod timer;

pub use error::{Error, Result};
pub use fiber::Fiber;
pub use reactor::{Interest, Reactor};
pub use sched::Scheduler;
