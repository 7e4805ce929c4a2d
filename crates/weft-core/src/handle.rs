//! Shared memory handle type
//!
//! A handle packs a slot index (low 32 bits) and a generation counter
//! (high 32 bits) into one opaque u64. Generations start at 1 and are
//! bumped every time a slot is reused, so a handle to a freed slot can
//! never match a live entry even if the slot now holds new data.
//!
//! The all-zero value is reserved as the invalid handle.

use core::fmt;

/// Opaque reference to a slot in the shared memory table
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ShmHandle(u64);

impl ShmHandle {
    /// The invalid handle (generation 0 never exists in the table)
    pub const INVALID: ShmHandle = ShmHandle(0);

    /// Reconstruct a handle from its raw value
    #[inline]
    pub const fn from_raw(value: u64) -> Self {
        ShmHandle(value)
    }

    /// Build a handle from slot index and generation
    #[inline]
    pub const fn from_parts(index: u32, generation: u32) -> Self {
        ShmHandle(((generation as u64) << 32) | index as u64)
    }

    /// Raw 64-bit value
    #[inline]
    pub const fn as_raw(self) -> u64 {
        self.0
    }

    /// Slot index (low 32 bits)
    #[inline]
    pub const fn index(self) -> u32 {
        (self.0 & 0xFFFF_FFFF) as u32
    }

    /// Generation stamp (high 32 bits)
    #[inline]
    pub const fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// A handle is structurally valid if its generation is non-zero.
    /// Whether the referenced slot is still live is decided by the table.
    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl Default for ShmHandle {
    fn default() -> Self {
        ShmHandle::INVALID
    }
}

impl fmt::Debug for ShmHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "ShmHandle({}@gen{})", self.index(), self.generation())
        } else {
            write!(f, "ShmHandle(INVALID)")
        }
    }
}

impl fmt::Display for ShmHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}
