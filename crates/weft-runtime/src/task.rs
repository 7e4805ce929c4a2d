//! Cooperative tasks as explicit state machines
//!
//! There is no stack switching here. A task is a [`Threadlet`]: each call
//! to `resume` runs one slice of the task's work and returns a [`Step`]
//! telling the event loop what to do next. Suspension is therefore always
//! explicit, which keeps the core contract easy to honor: a task must not
//! hold a shared-memory guard across the point where it returns a
//! suspending step.

use std::os::fd::RawFd;

use weft_core::id::TaskId;
use weft_core::status::{TaskStatus, WaitOutcome};
use weft_core::timeout::TimeMs;

use crate::poller::Interest;

/// What a task wants after one resumption slice
pub enum Step {
    /// Go to the tail of the ready queue; resume again this tick or next
    Yield,
    /// Suspend until `fd` is ready for `interest` or `timeout_ms` elapses
    Wait {
        fd: RawFd,
        interest: Interest,
        timeout_ms: TimeMs,
    },
    /// Done; the slot is reclaimed
    Finish,
}

/// Per-resumption view of the event loop.
///
/// Spawns requested during a resumption are buffered here and admitted by
/// the loop after the resumption returns, so a running task never needs a
/// second borrow of the loop to create siblings.
pub struct Context {
    task_id: TaskId,
    pub(crate) spawned: Vec<Box<dyn Threadlet>>,
}

impl Context {
    pub(crate) fn new(task_id: TaskId) -> Self {
        Self {
            task_id,
            spawned: Vec::new(),
        }
    }

    /// Id of the task being resumed
    #[inline]
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Queue a new task for admission after this resumption returns
    pub fn spawn(&mut self, t: impl Threadlet + 'static) {
        self.spawned.push(Box::new(t));
    }
}

/// A resumable unit of cooperative work
pub trait Threadlet {
    /// Run one slice. `outcome` reports why the task is being resumed:
    /// `Ready` after a yield or descriptor readiness, `Timeout` when an
    /// I/O deadline expired, `Abort` when the descriptor's wait was
    /// cancelled.
    fn resume(&mut self, cx: &mut Context, outcome: WaitOutcome) -> Step;
}

/// Closures are single-state threadlets
impl<F> Threadlet for F
where
    F: FnMut(&mut Context, WaitOutcome) -> Step,
{
    fn resume(&mut self, cx: &mut Context, outcome: WaitOutcome) -> Step {
        self(cx, outcome)
    }
}

pub(crate) struct Task {
    pub id: TaskId,
    pub status: TaskStatus,
    pub body: Box<dyn Threadlet>,
    /// Descriptor this task is parked on, if WAITING
    pub waiting_fd: Option<RawFd>,
}

/// Slot table for one loop's tasks; single-threaded, ids carry the slot
/// index plus a generation bumped on every reclaim. A stale id from a
/// finished task misses the slot's new occupant instead of hitting it.
pub(crate) struct TaskTable {
    slots: Vec<Option<Task>>,
    gens: Vec<u32>,
    free: Vec<u32>,
    live: usize,
}

impl TaskTable {
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            slots: Vec::with_capacity(cap),
            gens: Vec::with_capacity(cap),
            free: Vec::new(),
            live: 0,
        }
    }

    pub fn insert(&mut self, body: Box<dyn Threadlet>) -> TaskId {
        let index = match self.free.pop() {
            Some(i) => i,
            None => {
                self.slots.push(None);
                self.gens.push(0);
                (self.slots.len() - 1) as u32
            }
        };
        let id = TaskId::from_parts(index, self.gens[index as usize]);
        self.slots[index as usize] = Some(Task {
            id,
            status: TaskStatus::Ready,
            body,
            waiting_fd: None,
        });
        self.live += 1;
        id
    }

    pub fn get_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        self.slots
            .get_mut(id.as_usize())?
            .as_mut()
            .filter(|t| t.id == id)
    }

    /// Move the task body out for resumption so the table stays borrowable
    /// while user code runs
    pub fn take(&mut self, id: TaskId) -> Option<Task> {
        let slot = self.slots.get_mut(id.as_usize())?;
        if slot.as_ref().is_some_and(|t| t.id != id) {
            return None;
        }
        slot.take()
    }

    pub fn put_back(&mut self, task: Task) {
        let index = task.id.as_usize();
        debug_assert!(self.slots[index].is_none());
        self.slots[index] = Some(task);
    }

    pub fn remove(&mut self, id: TaskId) {
        let Some(slot) = self.slots.get_mut(id.as_usize()) else {
            return;
        };
        if slot.as_ref().is_some_and(|t| t.id == id) {
            *slot = None;
            self.retire(id.index());
        }
    }

    /// Reclaim the slot of a task that was taken out for resumption
    pub fn reclaim_taken(&mut self, id: TaskId) {
        self.retire(id.index());
    }

    /// Retire a slot: bump its generation so outstanding ids go stale,
    /// then hand the index back to the free list
    fn retire(&mut self, index: u32) {
        self.gens[index as usize] = self.gens[index as usize].wrapping_add(1);
        self.free.push(index);
        self.live -= 1;
    }

    pub fn live(&self) -> usize {
        self.live
    }
}
