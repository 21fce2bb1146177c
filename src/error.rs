//! Error handling utils.
//!
//! The runtime distinguishes user-level I/O failures (always surfaced to the
//! caller with `errno` preserved) from faults in the runtime itself. The
//! hooked syscall layer reports errors the OS-native way (`-1` + `errno`);
//! the Rust-native surfaces (event registration, net wrappers, config
//! loading) return this crate's [`Error`].
//!
//! Invariant violations (resuming a fiber that is currently executing,
//! destroying a live fiber) are not errors: they are programming mistakes
//! and fire always-on assertions, on release builds too.

use std::io;

use crate::reactor::Interest;

/// A specialized [`Result`] type for the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Represents all error cases for all routines of the crate.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("io error: {0}")]
    IO(#[from] io::Error),

    /// A condition timer fired before the awaited readiness arrived.
    #[error("operation timed out")]
    Timeout,

    /// `add_event` refused the registration: the direction already has a
    /// waiter, or the kernel rejected the `epoll_ctl` call (the underlying
    /// errno is logged at the registration site).
    #[error("event registration failed for fd {fd} ({interest:?})")]
    EventRegistration { fd: i32, interest: Interest },

    #[error("failed to parse config: {0}")]
    Config(#[from] serde_json::Error),
}

impl Error {
    /// The raw OS error this error maps to at the syscall surface, if any.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::IO(e) => e.raw_os_error(),
            Error::Timeout => Some(libc::ETIMEDOUT),
            _ => None,
        }
    }
}
