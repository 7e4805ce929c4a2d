//! Cross-thread wakeups: pending-signal bitmask plus an eventfd
//!
//! Each managed thread owns one `ThreadWaker`. Senders set bits in the
//! atomic pending mask and write to the eventfd; the owning thread has the
//! eventfd registered in its poller (and polls it directly inside
//! `os_thread::wait`), so a signal interrupts a blocked `epoll_wait`
//! promptly instead of waiting out the poll timeout.
//!
//! Coalescing: multiple raises before the owner drains the eventfd produce
//! a single wakeup (eventfd counter semantics). Pending bits are never
//! lost; the counter is only a doorbell.

use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use weft_core::error::{WeftError, WeftResult};
use weft_core::signal::SignalSet;
use weft_core::timeout::{is_forever, is_no_wait, TimeMs};

use crate::time::now_ms;

/// Per-iteration cap on the poll timeout so finite deadlines beyond
/// u16::MAX milliseconds still work
const POLL_CHUNK_MS: u16 = 60_000;

/// Pending-signal mask plus eventfd doorbell for one thread
pub struct ThreadWaker {
    pending: AtomicU64,
    efd: OwnedFd,
}

impl ThreadWaker {
    /// Create a waker with a fresh non-blocking eventfd
    pub fn new() -> WeftResult<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(WeftError::NetworkError(last_errno()));
        }
        Ok(Self {
            pending: AtomicU64::new(0),
            efd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// The eventfd, for registration in a poller
    #[inline]
    pub fn fd(&self) -> RawFd {
        self.efd.as_raw_fd()
    }

    /// Set signal bits and ring the doorbell
    pub fn raise(&self, signals: SignalSet) -> WeftResult<()> {
        self.pending.fetch_or(signals.bits(), Ordering::AcqRel);
        self.poke()
    }

    /// Ring the doorbell without setting any signal bits (plain wakeup)
    pub fn poke(&self) -> WeftResult<()> {
        let val: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.fd(),
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            let errno = last_errno();
            // EAGAIN means the counter is saturated, so a wakeup is
            // already pending and nothing is lost.
            if errno != libc::EAGAIN {
                return Err(WeftError::NetworkError(errno));
            }
        }
        Ok(())
    }

    /// Signals currently pending (not cleared by reading)
    #[inline]
    pub fn pending(&self) -> SignalSet {
        SignalSet::from_bits(self.pending.load(Ordering::Acquire))
    }

    /// True if any bit of `signals` is pending
    #[inline]
    pub fn has(&self, signals: SignalSet) -> bool {
        self.pending().intersects(signals)
    }

    /// Clear the given bits from the pending mask
    #[inline]
    pub fn clear(&self, mask: SignalSet) {
        self.pending.fetch_and(!mask.bits(), Ordering::AcqRel);
    }

    /// Consume the eventfd counter so the next poll blocks again
    pub fn drain(&self) {
        let mut buf: u64 = 0;
        loop {
            let ret = unsafe {
                libc::read(
                    self.fd(),
                    &mut buf as *mut u64 as *mut libc::c_void,
                    std::mem::size_of::<u64>(),
                )
            };
            if ret < 0 {
                // EAGAIN: counter is back to zero
                break;
            }
        }
    }

    /// Block the calling thread on this waker.
    ///
    /// Returns the pending signal set if any bit is (or becomes) set, or
    /// `SignalSet::EMPTY` when the timeout elapses first. Pending bits are
    /// left set; callers clear what they have handled.
    pub fn wait(&self, timeout_ms: TimeMs) -> WeftResult<SignalSet> {
        let deadline = if is_forever(timeout_ms) {
            None
        } else if is_no_wait(timeout_ms) || timeout_ms <= 0 {
            Some(now_ms())
        } else {
            Some(now_ms().saturating_add(timeout_ms))
        };

        loop {
            let pending = self.pending();
            if !pending.is_empty() {
                return Ok(pending);
            }

            let chunk: PollTimeout = match deadline {
                None => PollTimeout::from(POLL_CHUNK_MS),
                Some(dl) => {
                    let remaining = dl - now_ms();
                    if remaining <= 0 {
                        return Ok(SignalSet::EMPTY);
                    }
                    PollTimeout::from(remaining.min(POLL_CHUNK_MS as TimeMs) as u16)
                }
            };

            let borrowed = unsafe { BorrowedFd::borrow_raw(self.fd()) };
            let mut fds = [PollFd::new(borrowed, PollFlags::POLLIN)];
            match poll(&mut fds, chunk) {
                Ok(n) if n > 0 => {
                    self.drain();
                    // Loop back to re-read the mask: a bare poke carries
                    // no signal and the wait continues.
                }
                Ok(_) => {
                    if deadline.is_none() {
                        continue;
                    }
                    // Finite deadline: top of the loop decides expiry
                }
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(WeftError::NetworkError(e as i32)),
            }
        }
    }
}

#[inline]
fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_raise_and_clear() {
        let w = ThreadWaker::new().unwrap();
        assert!(w.pending().is_empty());

        w.raise(SignalSet::ABORT).unwrap();
        w.raise(SignalSet::WAKE).unwrap();
        assert!(w.has(SignalSet::ABORT));
        assert!(w.has(SignalSet::WAKE));

        w.clear(SignalSet::ABORT_MASK);
        assert!(!w.has(SignalSet::ABORT));
        assert!(w.has(SignalSet::WAKE));
    }

    #[test]
    fn test_wait_timeout_returns_empty() {
        let w = ThreadWaker::new().unwrap();
        let start = now_ms();
        let got = w.wait(30).unwrap();
        assert!(got.is_empty());
        assert!(now_ms() - start >= 25);
    }

    #[test]
    fn test_wait_returns_pending_immediately() {
        let w = ThreadWaker::new().unwrap();
        w.raise(SignalSet::TERMINATE).unwrap();
        let got = w.wait(5_000).unwrap();
        assert!(got.contains(SignalSet::TERMINATE));
    }

    #[test]
    fn test_cross_thread_wakeup() {
        let w = Arc::new(ThreadWaker::new().unwrap());
        let w2 = w.clone();
        let sender = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            w2.raise(SignalSet::ABORT).unwrap();
        });

        let start = now_ms();
        let got = w.wait(10_000).unwrap();
        sender.join().unwrap();

        assert!(got.contains(SignalSet::ABORT));
        // Woken by the signal, not the timeout
        assert!(now_ms() - start < 5_000);
    }

    #[test]
    fn test_poke_does_not_set_signals() {
        let w = ThreadWaker::new().unwrap();
        w.poke().unwrap();
        assert!(w.pending().is_empty());
        w.drain();
        // Waiting after a drained poke times out normally
        assert!(w.wait(10).unwrap().is_empty());
    }
}
