//! Task lifecycle states and wait outcomes

use core::fmt;

/// State of a threadlet
///
/// A live task is in exactly one of: running, Ready (sitting in the ready
/// queue), or Waiting (bound to exactly one I/O registration). Finished
/// and Aborted are terminal and trigger reclamation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskStatus {
    /// In the ready queue, eligible to run
    Ready = 0,

    /// Currently executing on its event loop
    Running = 1,

    /// Blocked on exactly one I/O registration
    Waiting = 2,

    /// Completed, awaiting reclamation
    Finished = 3,

    /// Cancelled before completion
    Aborted = 4,
}

impl TaskStatus {
    /// Terminal states trigger slot reclamation
    #[inline]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Finished | TaskStatus::Aborted)
    }
}

impl From<u8> for TaskStatus {
    fn from(v: u8) -> Self {
        match v {
            0 => TaskStatus::Ready,
            1 => TaskStatus::Running,
            2 => TaskStatus::Waiting,
            3 => TaskStatus::Finished,
            _ => TaskStatus::Aborted,
        }
    }
}

/// Why a waiting threadlet was moved back to the ready queue
///
/// Passed into the task's `resume` so it can tell readiness apart from a
/// deadline expiry or a cancellation. The first resume after spawn carries
/// `Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The descriptor became ready (or this is the initial run)
    Ready,

    /// The registration's deadline elapsed
    Timeout,

    /// The wait was cancelled via abort
    Abort,
}

impl fmt::Display for WaitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitOutcome::Ready => write!(f, "ready"),
            WaitOutcome::Timeout => write!(f, "timeout"),
            WaitOutcome::Abort => write!(f, "abort"),
        }
    }
}
