//! Monotonic reference clock.
//!
//! All timer arithmetic in the runtime is expressed as milliseconds since an
//! arbitrary monotonic epoch, derived from the Posix / C
//! [CLOCK_GETTIME](http://pubs.opengroup.org/onlinepubs/9699919799/functions/clock_getres.html)
//! function with `CLOCK_MONOTONIC`. Wall clock jumps never reorder timers.

use std::mem::MaybeUninit;

#[inline]
fn monotonic_raw() -> libc::timespec {
    let mut ts = MaybeUninit::<libc::timespec>::uninit();
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, ts.as_mut_ptr()) };
    // clock_gettime(CLOCK_MONOTONIC) cannot fail with a valid pointer.
    assert_eq!(rc, 0, "clock_gettime(CLOCK_MONOTONIC) failed");
    unsafe { ts.assume_init() }
}

/// The monotonic time in milliseconds.
#[inline]
pub fn now_ms() -> u64 {
    let ts = monotonic_raw();
    ts.tv_sec as u64 * 1_000 + ts.tv_nsec as u64 / 1_000_000
}

/// The monotonic time in microseconds.
#[inline]
pub fn now_us() -> u64 {
    let ts = monotonic_raw();
    ts.tv_sec as u64 * 1_000_000 + ts.tv_nsec as u64 / 1_000
}

/// The monotonic time in nanoseconds.
///
/// This is the best function to use with benchmarks that need to calculate
/// elapsed time.
#[inline]
pub fn monotonic64() -> u64 {
    let ts = monotonic_raw();
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}
