//! Thread-local runtime context
//!
//! Every OS thread in the runtime owns exactly one [`ThreadWaker`] and at
//! most one [`EventLoop`]. Both are reachable here so that code deep in a
//! call stack can find "my loop" and "my wakeup descriptor" without
//! threading them through every signature.

use std::cell::{Cell, RefCell};
use std::sync::Arc;

use weft_core::error::WeftResult;
use weft_core::handle::ShmHandle;

use crate::config::EventLoopConfig;
use crate::event_loop::EventLoop;
use crate::waker::ThreadWaker;

thread_local! {
    /// Wakeup descriptor + pending-signal mask for this OS thread.
    /// Lazily created for threads not spawned by the runtime (e.g. main).
    static WAKER: RefCell<Option<Arc<ThreadWaker>>> = const { RefCell::new(None) };

    /// Shared-memory handle of this thread's state record, if the thread
    /// was spawned through the OS thread layer
    static THREAD_HANDLE: Cell<ShmHandle> = const { Cell::new(ShmHandle::INVALID) };

    /// This thread's event loop, created on first use
    static EVENT_LOOP: RefCell<Option<EventLoop>> = const { RefCell::new(None) };
}

/// This thread's waker, creating one on first use
pub fn waker() -> WeftResult<Arc<ThreadWaker>> {
    WAKER.with(|cell| {
        let mut slot = cell.borrow_mut();
        if let Some(w) = slot.as_ref() {
            return Ok(w.clone());
        }
        let w = Arc::new(ThreadWaker::new()?);
        *slot = Some(w.clone());
        Ok(w)
    })
}

/// Adopt a waker allocated before the thread existed (spawn path)
pub(crate) fn set_waker(w: Arc<ThreadWaker>) {
    WAKER.with(|cell| *cell.borrow_mut() = Some(w));
}

/// Handle of the current thread's state record; INVALID outside managed
/// threads
#[inline]
pub fn current_thread_handle() -> ShmHandle {
    THREAD_HANDLE.with(|cell| cell.get())
}

#[inline]
pub(crate) fn set_current_thread_handle(h: ShmHandle) {
    THREAD_HANDLE.with(|cell| cell.set(h));
}

/// Run `f` against this thread's event loop, creating the loop (config
/// from the environment) on first use.
///
/// Panics if called re-entrantly from inside a task resumption; task code
/// talks to the loop through its [`Context`](crate::task::Context) and
/// returned [`Step`](crate::task::Step) instead.
pub fn with_event_loop<R>(f: impl FnOnce(&mut EventLoop) -> WeftResult<R>) -> WeftResult<R> {
    EVENT_LOOP.with(|cell| {
        let mut slot = cell.borrow_mut();
        if slot.is_none() {
            *slot = Some(EventLoop::new(EventLoopConfig::from_env())?);
        }
        f(slot.as_mut().unwrap())
    })
}

/// True if this thread already created its event loop
pub fn has_event_loop() -> bool {
    EVENT_LOOP.with(|cell| cell.borrow().is_some())
}

/// Tear down this thread's event loop (managed threads call this on exit)
pub(crate) fn drop_event_loop() {
    EVENT_LOOP.with(|cell| {
        cell.borrow_mut().take();
    });
}
