//! Monotonic clock
//!
//! All deadlines in the runtime are absolute values of this clock.
//! CLOCK_MONOTONIC is immune to wall-clock adjustments, which matters for
//! I/O deadlines that may be minutes long.

use weft_core::timeout::TimeMs;

/// Current monotonic time in milliseconds
#[inline]
pub fn now_ms() -> TimeMs {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // clock_gettime(CLOCK_MONOTONIC) cannot fail with a valid timespec
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as TimeMs * 1000 + ts.tv_nsec as TimeMs / 1_000_000
}
