//! Thin readiness multiplexer over epoll
//!
//! The event loop never touches epoll directly; it talks to [`Poller`] in
//! terms of raw fds, a caller-chosen `u64` token, and an [`Interest`]. The
//! token comes back unchanged in each [`PollEvent`], which is how the loop
//! maps readiness to a waiting task without a second lookup.

use std::os::fd::{AsRawFd, BorrowedFd, RawFd};

use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};

use weft_core::error::{WeftError, WeftResult};
use weft_core::timeout::{is_forever, TimeMs};

/// Which readiness directions a registration cares about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    pub const READ: Interest = Interest {
        readable: true,
        writable: false,
    };
    pub const WRITE: Interest = Interest {
        readable: false,
        writable: true,
    };
    pub const BOTH: Interest = Interest {
        readable: true,
        writable: true,
    };

    fn as_flags(self) -> EpollFlags {
        let mut flags = EpollFlags::empty();
        if self.readable {
            flags |= EpollFlags::EPOLLIN;
        }
        if self.writable {
            flags |= EpollFlags::EPOLLOUT;
        }
        flags
    }
}

/// One readiness report out of [`Poller::wait`]
#[derive(Debug, Clone, Copy)]
pub struct PollEvent {
    pub token: u64,
    pub readable: bool,
    pub writable: bool,
    /// EPOLLERR or EPOLLHUP. Delivered even when not asked for; waiters
    /// are woken so the subsequent I/O attempt can observe the error.
    pub error: bool,
}

pub struct Poller {
    epoll: Epoll,
    events: Vec<EpollEvent>,
}

impl Poller {
    pub fn new(max_events: usize) -> WeftResult<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)
            .map_err(|e| WeftError::NetworkError(e as i32))?;
        Ok(Self {
            epoll,
            events: vec![EpollEvent::empty(); max_events.max(1)],
        })
    }

    /// Level-triggered registration. epoll rejects a duplicate fd with
    /// EEXIST, which surfaces as [`WeftError::InvalidState`].
    pub fn register(&self, fd: RawFd, token: u64, interest: Interest) -> WeftResult<()> {
        let event = EpollEvent::new(interest.as_flags(), token);
        // The fd's lifetime is managed by the registration's owner
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        self.epoll.add(borrowed, event).map_err(|e| match e {
            nix::errno::Errno::EEXIST => WeftError::InvalidState,
            nix::errno::Errno::EBADF => WeftError::InvalidParam,
            other => WeftError::NetworkError(other as i32),
        })
    }

    pub fn modify(&self, fd: RawFd, token: u64, interest: Interest) -> WeftResult<()> {
        let mut event = EpollEvent::new(interest.as_flags(), token);
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        self.epoll.modify(borrowed, &mut event).map_err(|e| match e {
            nix::errno::Errno::ENOENT => WeftError::NotFound,
            other => WeftError::NetworkError(other as i32),
        })
    }

    /// Remove an fd. Idempotent: an fd that was never registered (or that
    /// the kernel already dropped on close) is not an error.
    pub fn unregister(&self, fd: RawFd) -> WeftResult<()> {
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        match self.epoll.delete(borrowed) {
            Ok(()) => Ok(()),
            Err(nix::errno::Errno::ENOENT) | Err(nix::errno::Errno::EBADF) => Ok(()),
            Err(other) => Err(WeftError::NetworkError(other as i32)),
        }
    }

    /// Block up to `timeout_ms` for readiness, then invoke `f` per event.
    /// Returns the number of events delivered. EINTR reports zero events
    /// so the caller re-evaluates deadlines instead of sleeping through
    /// them.
    pub fn wait(&mut self, timeout_ms: TimeMs, mut f: impl FnMut(PollEvent)) -> WeftResult<usize> {
        let timeout = if is_forever(timeout_ms) {
            EpollTimeout::NONE
        } else {
            let clamped = timeout_ms.clamp(0, u16::MAX as TimeMs) as u16;
            EpollTimeout::from(clamped)
        };
        let n = match self.epoll.wait(&mut self.events, timeout) {
            Ok(n) => n,
            Err(nix::errno::Errno::EINTR) => 0,
            Err(e) => return Err(WeftError::NetworkError(e as i32)),
        };
        for ev in &self.events[..n] {
            let flags = ev.events();
            f(PollEvent {
                token: ev.data(),
                readable: flags.contains(EpollFlags::EPOLLIN),
                writable: flags.contains(EpollFlags::EPOLLOUT),
                error: flags.intersects(EpollFlags::EPOLLERR | EpollFlags::EPOLLHUP),
            });
        }
        Ok(n)
    }
}

impl AsRawFd for Poller {
    fn as_raw_fd(&self) -> RawFd {
        self.epoll.0.as_raw_fd()
    }
}
