//! Cross-thread signal bitmasks
//!
//! Signals are delivered by setting bits in the target thread's pending
//! mask and poking its wakeup descriptor. The layout reserves the bottom
//! byte for abort-class signals so `is_abort()` is a single mask test.

use core::fmt;
use core::ops::{BitOr, BitOrAssign};

/// A set of pending thread signals
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct SignalSet(u64);

impl SignalSet {
    /// Empty set
    pub const EMPTY: SignalSet = SignalSet(0);

    /// Request graceful shutdown
    pub const ABORT: SignalSet = SignalSet(1 << 0);

    /// Force immediate termination
    pub const TERMINATE: SignalSet = SignalSet(1 << 1);

    /// All abort-class signals occupy bits 0-7
    pub const ABORT_MASK: SignalSet = SignalSet(0xFF);

    /// General wake-up, no shutdown semantics
    pub const WAKE: SignalSet = SignalSet(1 << 8);

    /// Raised automatically on the parent when a child's run function returns
    pub const CHILD_DIED: SignalSet = SignalSet(1 << 9);

    /// Build from raw bits
    #[inline]
    pub const fn from_bits(bits: u64) -> Self {
        SignalSet(bits)
    }

    /// Raw bits
    #[inline]
    pub const fn bits(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True if every bit of `other` is present
    #[inline]
    pub const fn contains(self, other: SignalSet) -> bool {
        (self.0 & other.0) == other.0
    }

    /// True if any bit of `other` is present
    #[inline]
    pub const fn intersects(self, other: SignalSet) -> bool {
        (self.0 & other.0) != 0
    }

    /// True if any abort-class bit is set
    #[inline]
    pub const fn is_abort(self) -> bool {
        self.intersects(SignalSet::ABORT_MASK)
    }

    /// Set without the bits in `mask`
    #[inline]
    pub const fn without(self, mask: SignalSet) -> SignalSet {
        SignalSet(self.0 & !mask.0)
    }
}

impl BitOr for SignalSet {
    type Output = SignalSet;

    #[inline]
    fn bitor(self, rhs: SignalSet) -> SignalSet {
        SignalSet(self.0 | rhs.0)
    }
}

impl BitOrAssign for SignalSet {
    #[inline]
    fn bitor_assign(&mut self, rhs: SignalSet) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for SignalSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "SignalSet(empty)");
        }
        let mut first = true;
        let mut put = |f: &mut fmt::Formatter<'_>, name: &str| -> fmt::Result {
            if !first {
                write!(f, "|")?;
            }
            first = false;
            write!(f, "{}", name)
        };
        write!(f, "SignalSet(")?;
        if self.contains(SignalSet::ABORT) {
            put(f, "ABORT")?;
        }
        if self.contains(SignalSet::TERMINATE) {
            put(f, "TERMINATE")?;
        }
        if self.contains(SignalSet::WAKE) {
            put(f, "WAKE")?;
        }
        if self.contains(SignalSet::CHILD_DIED) {
            put(f, "CHILD_DIED")?;
        }
        write!(f, ")")
    }
}
