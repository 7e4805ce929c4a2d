//! Error types for the weft runtime

use core::fmt;

/// Result type for runtime operations
pub type WeftResult<T> = Result<T, WeftError>;

/// Errors that can occur in runtime operations
///
/// The taxonomy splits along caller-visible lines: bad input
/// (`InvalidParam`), wrong lifecycle phase (`InvalidState`), a handle whose
/// slot has been reused (`InvalidHandle`), and the non-fatal waiting
/// outcomes (`Timeout`, `Aborted`, `Signal`). `Timeout` is never treated as
/// fatal anywhere in the runtime; retry policy belongs to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WeftError {
    /// Malformed input (null handle, negative fd, zero size)
    InvalidParam,

    /// Operation not valid in the current lifecycle phase
    InvalidState,

    /// Handle is stale: slot freed or reused under a newer generation
    InvalidHandle,

    /// No registration / child / argument for the given key
    NotFound,

    /// A bounded wait elapsed
    Timeout,

    /// Cooperative cancellation was delivered
    Aborted,

    /// A signal interrupted the wait (check pending signals)
    Signal,

    /// Table growth or allocation failed
    OutOfMemory,

    /// Queue or resource is full; try again later
    WouldBlock,

    /// Descriptor or native thread level OS failure (errno)
    NetworkError(i32),
}

impl fmt::Display for WeftError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WeftError::InvalidParam => write!(f, "invalid parameter"),
            WeftError::InvalidState => write!(f, "invalid state for operation"),
            WeftError::InvalidHandle => write!(f, "stale or invalid shared handle"),
            WeftError::NotFound => write!(f, "not found"),
            WeftError::Timeout => write!(f, "operation timed out"),
            WeftError::Aborted => write!(f, "operation aborted"),
            WeftError::Signal => write!(f, "interrupted by signal"),
            WeftError::OutOfMemory => write!(f, "out of memory"),
            WeftError::WouldBlock => write!(f, "resource busy, would block"),
            WeftError::NetworkError(errno) => write!(f, "os error: errno {}", errno),
        }
    }
}

impl std::error::Error for WeftError {}

impl WeftError {
    /// True for the outcomes a waiting caller is expected to handle
    /// as part of normal operation rather than as failures.
    #[inline]
    pub const fn is_wait_outcome(&self) -> bool {
        matches!(
            self,
            WeftError::Timeout | WeftError::Aborted | WeftError::Signal
        )
    }
}
