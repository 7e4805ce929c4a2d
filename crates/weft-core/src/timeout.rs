//! Millisecond timeouts with reserved sentinel values
//!
//! Finite timeouts are plain millisecond counts. "Wait forever" and "do
//! not wait" are encoded as the extreme representable i64 values rather
//! than as zero: zero means "return immediately if not ready", which is a
//! distinct, meaningful timeout.

/// Monotonic milliseconds, also used for timeouts and deadlines
pub type TimeMs = i64;

/// Block until the condition holds, however long that takes
pub const WAIT_FOREVER: TimeMs = i64::MAX;

/// Fail immediately if the condition does not already hold
pub const NO_WAIT: TimeMs = i64::MIN;

/// True if `timeout` is the wait-forever sentinel
#[inline]
pub const fn is_forever(timeout: TimeMs) -> bool {
    timeout == WAIT_FOREVER
}

/// True if `timeout` is the no-wait sentinel
#[inline]
pub const fn is_no_wait(timeout: TimeMs) -> bool {
    timeout == NO_WAIT
}

/// Absolute deadline for an I/O wait starting at `now`.
///
/// A non-positive or sentinel timeout means "no deadline" (the wait is
/// bounded only by readiness or an abort); saturates instead of wrapping
/// for very large finite timeouts.
#[inline]
pub fn deadline_for(now: TimeMs, timeout: TimeMs) -> Option<TimeMs> {
    if timeout <= 0 || is_forever(timeout) {
        None
    } else {
        Some(now.saturating_add(timeout))
    }
}
