//! Threadlet identifier type

use core::fmt;

/// Unique identifier for a threadlet within one event loop
///
/// Packs the task-slab index in the low 32 bits and the slot's generation
/// in the high 32, the same layout as a shared-memory handle. Slots are
/// reused, but each reuse bumps the generation, so a stale id held by a
/// late waker targets nothing instead of an unrelated task. The all-ones
/// value is reserved as the "no task" sentinel.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct TaskId(u64);

impl TaskId {
    /// Sentinel value indicating no task
    pub const NONE: TaskId = TaskId(u64::MAX);

    /// Assemble an id from a slab index and a slot generation
    #[inline]
    pub const fn from_parts(index: u32, generation: u32) -> Self {
        TaskId(((generation as u64) << 32) | index as u64)
    }

    /// Slab index of the task's slot
    #[inline]
    pub const fn index(self) -> u32 {
        self.0 as u32
    }

    /// Generation of the slot when this id was issued
    #[inline]
    pub const fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Slab index as usize for indexing
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0 as u32 as usize
    }

    /// Check if this is the NONE sentinel
    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == u64::MAX
    }

    /// Check if this is a real task id
    #[inline]
    pub const fn is_some(self) -> bool {
        self.0 != u64::MAX
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "TaskId(NONE)")
        } else {
            write!(f, "TaskId({}@gen{})", self.index(), self.generation())
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "none")
        } else {
            write!(f, "{}@{}", self.index(), self.generation())
        }
    }
}
