//! Managed OS threads
//!
//! A managed thread's state record lives behind a shared-memory handle,
//! never a raw pointer, so a thread that has exited (and whose record has
//! been released) turns every later operation into `InvalidHandle` rather
//! than a use-after-free.
//!
//! Lifecycle: [`create`] allocates the record and the thread's waker,
//! `set_*_arg` stage typed arguments, [`start`] spawns the native thread.
//! The spawned thread adopts its waker and handle, creates its
//! thread-local event loop, then calls the run function with no arguments;
//! arguments are fetched from inside via [`get_int_arg`] and friends. On
//! return the record is marked finished and the parent receives
//! `CHILD_DIED`.
//!
//! Signaling: [`signal`] sets bits in the target's pending mask and writes
//! its wakeup descriptor, so a target blocked in [`wait`] or in its event
//! loop's poll returns promptly. Abort-class bits are advisory: the target
//! checks [`has_signal`] at its own checkpoints.

use std::any::Any;
use std::sync::Arc;
use std::thread;

use weft_core::error::{WeftError, WeftResult};
use weft_core::handle::ShmHandle;
use weft_core::signal::SignalSet;
use weft_core::timeout::{TimeMs, WAIT_FOREVER};
use weft_core::{wdebug, wwarn};

use crate::shared;
use crate::tls;
use crate::waker::ThreadWaker;

/// One staged thread argument, retrieved by index from the running thread
pub enum ThreadArg {
    /// Unset placeholder (sparse indices)
    None,
    Int(i64),
    Uint(u64),
    Float(f64),
    Str(String),
    Handle(ShmHandle),
    /// Owned value, moved out by [`take_boxed_arg`]
    Boxed(Option<Box<dyn Any + Send>>),
}

struct ThreadState {
    name: String,
    run_fn: Option<Box<dyn FnOnce() + Send>>,
    args: Vec<ThreadArg>,
    started: bool,
    finished: bool,
    parent: ShmHandle,
    children: Vec<ShmHandle>,
    waker: Arc<ThreadWaker>,
    join: Option<thread::JoinHandle<()>>,
}

impl Drop for ThreadState {
    fn drop(&mut self) {
        // The children vec owns one reference per child record
        for child in self.children.drain(..) {
            if let Err(e) = shared::release(child) {
                wwarn!("os_thread: releasing child record failed: {}", e);
            }
        }
    }
}

/// Allocate a thread record (refcount 1, owned by the caller) for `run`.
/// The thread does not exist until [`start`].
pub fn create(name: &str, run: impl FnOnce() + Send + 'static) -> WeftResult<ShmHandle> {
    let waker = Arc::new(ThreadWaker::new()?);
    let parent = tls::current_thread_handle();
    let handle = shared::wrap(ThreadState {
        name: name.to_string(),
        run_fn: Some(Box::new(run)),
        args: Vec::new(),
        started: false,
        finished: false,
        parent,
        children: Vec::new(),
        waker,
        join: None,
    })?;

    // The parent's record keeps its own reference to each child
    if parent.is_valid() {
        shared::retain(handle)?;
        let mut guard = shared::acquire(parent, WAIT_FOREVER)?;
        guard.value_mut::<ThreadState>()?.children.push(handle);
    }
    wdebug!("os_thread: created '{}' as {:?}", name, handle);
    Ok(handle)
}

/// Replace the run function staged at [`create`] (before [`start`])
pub fn set_run_function(handle: ShmHandle, run: impl FnOnce() + Send + 'static) -> WeftResult<()> {
    let mut guard = shared::acquire(handle, WAIT_FOREVER)?;
    let state = guard.value_mut::<ThreadState>()?;
    if state.started {
        return Err(WeftError::InvalidState);
    }
    state.run_fn = Some(Box::new(run));
    Ok(())
}

fn set_arg(handle: ShmHandle, index: usize, arg: ThreadArg) -> WeftResult<()> {
    let mut guard = shared::acquire(handle, WAIT_FOREVER)?;
    let state = guard.value_mut::<ThreadState>()?;
    if state.started {
        return Err(WeftError::InvalidState);
    }
    while state.args.len() <= index {
        state.args.push(ThreadArg::None);
    }
    state.args[index] = arg;
    Ok(())
}

/// Stage an integer argument at `index` (before [`start`])
pub fn set_int_arg(handle: ShmHandle, index: usize, value: i64) -> WeftResult<()> {
    set_arg(handle, index, ThreadArg::Int(value))
}

/// Stage an unsigned argument at `index` (before [`start`])
pub fn set_uint_arg(handle: ShmHandle, index: usize, value: u64) -> WeftResult<()> {
    set_arg(handle, index, ThreadArg::Uint(value))
}

/// Stage a float argument at `index` (before [`start`])
pub fn set_float_arg(handle: ShmHandle, index: usize, value: f64) -> WeftResult<()> {
    set_arg(handle, index, ThreadArg::Float(value))
}

/// Stage a string argument at `index` (before [`start`])
pub fn set_str_arg(handle: ShmHandle, index: usize, value: &str) -> WeftResult<()> {
    set_arg(handle, index, ThreadArg::Str(value.to_string()))
}

/// Stage an owned value at `index` (before [`start`]); the running thread
/// moves it out with [`take_boxed_arg`]
pub fn set_boxed_arg<T: Any + Send>(handle: ShmHandle, index: usize, value: T) -> WeftResult<()> {
    set_arg(handle, index, ThreadArg::Boxed(Some(Box::new(value))))
}

/// Stage a shared-memory handle argument at `index` (before [`start`]).
/// A reference is retained on the staged handle; the running thread owns
/// it and releases it when done with it.
pub fn set_handle_arg(handle: ShmHandle, index: usize, value: ShmHandle) -> WeftResult<()> {
    shared::retain(value)?;
    if let Err(e) = set_arg(handle, index, ThreadArg::Handle(value)) {
        let _ = shared::release(value);
        return Err(e);
    }
    Ok(())
}

/// Spawn the native thread for `handle`
pub fn start(handle: ShmHandle) -> WeftResult<()> {
    let name = {
        let mut guard = shared::acquire(handle, WAIT_FOREVER)?;
        let state = guard.value_mut::<ThreadState>()?;
        if state.started {
            return Err(WeftError::InvalidState);
        }
        if state.run_fn.is_none() {
            return Err(WeftError::InvalidState);
        }
        state.started = true;
        state.name.clone()
    };

    // The thread holds its own reference until it exits
    shared::retain(handle)?;
    let spawn = thread::Builder::new()
        .name(name)
        .spawn(move || thread_main(handle));
    let join = match spawn {
        Ok(j) => j,
        Err(_) => {
            let _ = shared::release(handle);
            let mut guard = shared::acquire(handle, WAIT_FOREVER)?;
            guard.value_mut::<ThreadState>()?.started = false;
            return Err(WeftError::OutOfMemory);
        }
    };

    let mut guard = shared::acquire(handle, WAIT_FOREVER)?;
    guard.value_mut::<ThreadState>()?.join = Some(join);
    Ok(())
}

fn thread_main(handle: ShmHandle) {
    let (waker, run) = {
        let mut guard = match shared::acquire(handle, WAIT_FOREVER) {
            Ok(g) => g,
            Err(e) => {
                wwarn!("os_thread: thread record vanished before start: {}", e);
                return;
            }
        };
        let state = match guard.value_mut::<ThreadState>() {
            Ok(s) => s,
            Err(_) => return,
        };
        (state.waker.clone(), state.run_fn.take())
    };

    tls::set_waker(waker);
    tls::set_current_thread_handle(handle);
    // The loop (and its multiplexer) exist before user code runs
    if let Err(e) = tls::with_event_loop(|_| Ok(())) {
        wwarn!("os_thread: event loop init failed: {}", e);
    }

    if let Some(run) = run {
        run();
    }

    let parent = {
        match shared::acquire(handle, WAIT_FOREVER) {
            Ok(mut guard) => match guard.value_mut::<ThreadState>() {
                Ok(state) => {
                    state.finished = true;
                    state.parent
                }
                Err(_) => ShmHandle::INVALID,
            },
            Err(_) => ShmHandle::INVALID,
        }
    };
    // Signal after the guard is dropped: the parent may react by touching
    // this record
    if parent.is_valid() {
        let _ = signal(parent, SignalSet::CHILD_DIED);
    }

    tls::drop_event_loop();
    let _ = shared::release(handle);
}

/// Handle of the calling thread's own record; INVALID on threads not
/// spawned through this layer
pub fn self_handle() -> ShmHandle {
    tls::current_thread_handle()
}

/// Set `bits` in the target thread's pending mask and write its wakeup
/// descriptor. A target blocked in [`wait`] or in its loop's poll returns
/// promptly.
pub fn signal(handle: ShmHandle, bits: SignalSet) -> WeftResult<()> {
    let waker = {
        let guard = shared::acquire(handle, WAIT_FOREVER)?;
        guard.value::<ThreadState>()?.waker.clone()
    };
    waker.raise(bits)
}

/// Broadcast `bits` to every child of `handle`. Stale child records are
/// skipped. Returns the number of children signaled.
pub fn signal_all_children(handle: ShmHandle, bits: SignalSet) -> WeftResult<usize> {
    let children = {
        let guard = shared::acquire(handle, WAIT_FOREVER)?;
        guard.value::<ThreadState>()?.children.clone()
    };
    let mut signaled = 0;
    for child in children {
        if signal(child, bits).is_ok() {
            signaled += 1;
        }
    }
    Ok(signaled)
}

/// Block the *calling* thread on its own wakeup descriptor.
///
/// Returns `Ok(EMPTY)` when `timeout_ms` elapses with nothing pending,
/// or the pending set (left un-cleared) as soon as any bit is up.
pub fn wait(timeout_ms: TimeMs) -> WeftResult<SignalSet> {
    tls::waker()?.wait(timeout_ms)
}

/// Pending bits of the calling thread
pub fn pending_signals() -> WeftResult<SignalSet> {
    Ok(tls::waker()?.pending())
}

/// True if any bit of `bits` is pending on the calling thread
pub fn has_signal(bits: SignalSet) -> WeftResult<bool> {
    Ok(tls::waker()?.pending().intersects(bits))
}

/// Clear `bits` from the calling thread's pending mask
pub fn clear_signals(bits: SignalSet) -> WeftResult<()> {
    tls::waker()?.clear(bits);
    Ok(())
}

/// Handle of the thread that created `handle` (INVALID for top-level
/// threads)
pub fn parent_of(handle: ShmHandle) -> WeftResult<ShmHandle> {
    let guard = shared::acquire(handle, WAIT_FOREVER)?;
    Ok(guard.value::<ThreadState>()?.parent)
}

/// Number of children currently tracked by `handle`
pub fn count_children(handle: ShmHandle) -> WeftResult<usize> {
    let guard = shared::acquire(handle, WAIT_FOREVER)?;
    Ok(guard.value::<ThreadState>()?.children.len())
}

/// Reap finished children of `handle`: join each, drop it from the
/// children list, and release the list's reference. Returns the number
/// reaped. `timeout_ms` bounds each state acquire.
pub fn cleanup_dead_children(handle: ShmHandle, timeout_ms: TimeMs) -> WeftResult<usize> {
    let children = {
        let guard = shared::acquire(handle, timeout_ms)?;
        guard.value::<ThreadState>()?.children.clone()
    };

    let mut reaped = 0;
    for child in children {
        let finished = {
            match shared::acquire(child, timeout_ms) {
                Ok(guard) => guard.value::<ThreadState>()?.finished,
                // A stale entry is dead by definition
                Err(WeftError::InvalidHandle) => true,
                Err(e) => return Err(e),
            }
        };
        if !finished {
            continue;
        }
        // Already-joined children report InvalidState here; that is fine
        let _ = join(child);

        let mut guard = shared::acquire(handle, timeout_ms)?;
        let state = guard.value_mut::<ThreadState>()?;
        if let Some(pos) = state.children.iter().position(|&c| c == child) {
            state.children.remove(pos);
            drop(guard);
            if let Err(e) = shared::release(child) {
                wwarn!("os_thread: releasing reaped child failed: {}", e);
            }
            reaped += 1;
        }
    }
    wdebug!("os_thread: reaped {} children of {:?}", reaped, handle);
    Ok(reaped)
}

/// True once the thread's run function has returned
pub fn is_finished(handle: ShmHandle) -> WeftResult<bool> {
    let guard = shared::acquire(handle, WAIT_FOREVER)?;
    Ok(guard.value::<ThreadState>()?.finished)
}

/// Block until the thread exits. Fails with `InvalidState` if it was
/// never started or is already joined.
pub fn join(handle: ShmHandle) -> WeftResult<()> {
    let join = {
        let mut guard = shared::acquire(handle, WAIT_FOREVER)?;
        let state = guard.value_mut::<ThreadState>()?;
        if !state.started {
            return Err(WeftError::InvalidState);
        }
        state.join.take().ok_or(WeftError::InvalidState)?
    };
    join.join().map_err(|_| WeftError::InvalidState)
}

/// Fetch a staged integer argument from inside the running thread
pub fn get_int_arg(index: usize) -> WeftResult<i64> {
    with_own_arg(index, |arg| match arg {
        ThreadArg::Int(v) => Ok(*v),
        _ => Err(WeftError::InvalidParam),
    })
}

/// Fetch a staged unsigned argument from inside the running thread
pub fn get_uint_arg(index: usize) -> WeftResult<u64> {
    with_own_arg(index, |arg| match arg {
        ThreadArg::Uint(v) => Ok(*v),
        _ => Err(WeftError::InvalidParam),
    })
}

/// Fetch a staged float argument from inside the running thread
pub fn get_float_arg(index: usize) -> WeftResult<f64> {
    with_own_arg(index, |arg| match arg {
        ThreadArg::Float(v) => Ok(*v),
        _ => Err(WeftError::InvalidParam),
    })
}

/// Fetch a staged string argument from inside the running thread
pub fn get_str_arg(index: usize) -> WeftResult<String> {
    with_own_arg(index, |arg| match arg {
        ThreadArg::Str(v) => Ok(v.clone()),
        _ => Err(WeftError::InvalidParam),
    })
}

/// Fetch a staged handle argument from inside the running thread. The
/// reference retained at staging time becomes the caller's to release.
pub fn get_handle_arg(index: usize) -> WeftResult<ShmHandle> {
    with_own_arg(index, |arg| match arg {
        ThreadArg::Handle(v) => Ok(*v),
        _ => Err(WeftError::InvalidParam),
    })
}

/// Move a staged boxed value out of the argument list; a second take on
/// the same index is `InvalidState`
pub fn take_boxed_arg<T: Any + Send>(index: usize) -> WeftResult<Box<T>> {
    let boxed = with_own_arg(index, |arg| match arg {
        ThreadArg::Boxed(slot) => slot.take().ok_or(WeftError::InvalidState),
        _ => Err(WeftError::InvalidParam),
    })?;
    boxed.downcast::<T>().map_err(|_| WeftError::InvalidParam)
}

fn with_own_arg<R>(index: usize, f: impl FnOnce(&mut ThreadArg) -> WeftResult<R>) -> WeftResult<R> {
    let handle = tls::current_thread_handle();
    if !handle.is_valid() {
        return Err(WeftError::InvalidState);
    }
    let mut guard = shared::acquire(handle, WAIT_FOREVER)?;
    let state = guard.value_mut::<ThreadState>()?;
    match state.args.get_mut(index) {
        None | Some(ThreadArg::None) => Err(WeftError::NotFound),
        Some(arg) => f(arg),
    }
}

/// Release the caller's reference on a thread record. If the thread holds
/// the last other reference, the record survives until it exits.
pub fn destroy(handle: ShmHandle) -> WeftResult<()> {
    shared::release(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::now_ms;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::mpsc;

    #[test]
    fn test_create_start_join() {
        let got = Arc::new(AtomicI64::new(0));
        let g = got.clone();
        let h = create("adder", move || {
            let a = get_int_arg(0).unwrap();
            let b = get_uint_arg(1).unwrap() as i64;
            assert_eq!(get_str_arg(2).unwrap(), "tag");
            assert!((get_float_arg(3).unwrap() - 0.5).abs() < 1e-9);
            g.store(a + b, Ordering::SeqCst);
        })
        .unwrap();
        set_int_arg(h, 0, 30).unwrap();
        set_uint_arg(h, 1, 12).unwrap();
        set_str_arg(h, 2, "tag").unwrap();
        set_float_arg(h, 3, 0.5).unwrap();

        start(h).unwrap();
        join(h).unwrap();
        assert_eq!(got.load(Ordering::SeqCst), 42);
        assert!(is_finished(h).unwrap());
        destroy(h).unwrap();
    }

    #[test]
    fn test_boxed_arg_moves_ownership() {
        let (tx, rx) = mpsc::channel();
        let h = create("boxed", move || {
            let v = take_boxed_arg::<Vec<u32>>(0).unwrap();
            // A second take reports the value as already moved
            assert_eq!(
                take_boxed_arg::<Vec<u32>>(0).unwrap_err(),
                WeftError::InvalidState
            );
            tx.send(v.iter().sum::<u32>()).unwrap();
        })
        .unwrap();
        set_boxed_arg(h, 0, vec![1u32, 2, 3]).unwrap();
        start(h).unwrap();
        assert_eq!(rx.recv().unwrap(), 6);
        join(h).unwrap();
        destroy(h).unwrap();
    }

    #[test]
    fn test_handle_stale_after_thread_and_destroy() {
        let h = create("short", || {}).unwrap();
        start(h).unwrap();
        join(h).unwrap();
        destroy(h).unwrap();
        // Both references (caller + thread) are gone
        assert_eq!(is_finished(h).unwrap_err(), WeftError::InvalidHandle);
        assert_eq!(signal(h, SignalSet::WAKE).unwrap_err(), WeftError::InvalidHandle);
    }

    #[test]
    fn test_wait_timeout_returns_empty() {
        let start_ms = now_ms();
        let set = wait(40).unwrap();
        assert!(set.is_empty());
        assert!(now_ms() - start_ms >= 35);
    }

    #[test]
    fn test_signal_interrupts_wait() {
        let (tx, rx) = mpsc::channel();
        let h = create("waiter", move || {
            let start_ms = now_ms();
            let set = wait(60_000).unwrap();
            tx.send((set, now_ms() - start_ms)).unwrap();
            clear_signals(SignalSet::WAKE).unwrap();
        })
        .unwrap();
        start(h).unwrap();

        std::thread::sleep(std::time::Duration::from_millis(30));
        signal(h, SignalSet::WAKE).unwrap();

        let (set, elapsed) = rx.recv().unwrap();
        assert!(set.contains(SignalSet::WAKE));
        assert!(elapsed < 5_000, "signal did not interrupt the wait");
        join(h).unwrap();
        destroy(h).unwrap();
    }

    #[test]
    fn test_abort_is_advisory_and_sticky() {
        let (tx, rx) = mpsc::channel();
        let h = create("workhorse", move || {
            // Loop until the abort checkpoint observes the bit
            loop {
                if has_signal(SignalSet::ABORT).unwrap() {
                    break;
                }
                let _ = wait(10).unwrap();
            }
            tx.send(pending_signals().unwrap()).unwrap();
        })
        .unwrap();
        start(h).unwrap();
        signal(h, SignalSet::ABORT).unwrap();
        let set = rx.recv().unwrap();
        assert!(set.is_abort());
        join(h).unwrap();
        destroy(h).unwrap();
    }

    #[test]
    fn test_parent_gets_child_died() {
        let (tx, rx) = mpsc::channel();
        let parent = create("parent", move || {
            let me = self_handle();
            assert!(me.is_valid());
            let child = create("child", || {
                assert!(parent_of(self_handle()).unwrap().is_valid());
            })
            .unwrap();
            assert_eq!(count_children(me).unwrap(), 1);
            start(child).unwrap();
            let set = wait(60_000).unwrap();
            clear_signals(SignalSet::CHILD_DIED).unwrap();

            // The reap joins, unlinks, and releases the list's reference
            assert_eq!(cleanup_dead_children(me, 1_000).unwrap(), 1);
            assert_eq!(count_children(me).unwrap(), 0);
            destroy(child).unwrap();
            tx.send(set).unwrap();
        })
        .unwrap();
        start(parent).unwrap();
        let set = rx.recv().unwrap();
        assert!(set.contains(SignalSet::CHILD_DIED));
        join(parent).unwrap();
        destroy(parent).unwrap();
    }

    #[test]
    fn test_signal_all_children_broadcast() {
        let (tx, rx) = mpsc::channel();
        let parent = create("broadcaster", move || {
            let me = self_handle();
            let mut kids = Vec::new();
            for i in 0..3 {
                let kid = create(&format!("kid-{}", i), || {
                    // Every child must observe the abort bit, not just one
                    loop {
                        let set = wait(60_000).unwrap();
                        if set.contains(SignalSet::ABORT) {
                            break;
                        }
                    }
                })
                .unwrap();
                start(kid).unwrap();
                kids.push(kid);
            }
            assert_eq!(count_children(me).unwrap(), 3);
            assert_eq!(signal_all_children(me, SignalSet::ABORT).unwrap(), 3);

            for &kid in &kids {
                join(kid).unwrap();
                destroy(kid).unwrap();
            }
            // Reaping unlinks all three and drops the last references
            assert_eq!(cleanup_dead_children(me, 1_000).unwrap(), 3);
            assert_eq!(count_children(me).unwrap(), 0);
            for kid in kids {
                assert!(!shared::is_valid(kid));
            }
            tx.send(()).unwrap();
        })
        .unwrap();
        start(parent).unwrap();
        rx.recv().unwrap();
        join(parent).unwrap();
        destroy(parent).unwrap();
    }

    #[test]
    fn test_handle_arg_transfers_ownership() {
        let payload = shared::wrap(String::from("carried")).unwrap();
        let h = create("carrier", move || {
            let got = get_handle_arg(0).unwrap();
            {
                let guard = shared::acquire(got, WAIT_FOREVER).unwrap();
                assert_eq!(guard.value::<String>().unwrap(), "carried");
            }
            shared::release(got).unwrap();
        })
        .unwrap();
        set_handle_arg(h, 0, payload).unwrap();
        // Drop the creator's reference; the staged retain keeps it alive
        shared::release(payload).unwrap();
        start(h).unwrap();
        join(h).unwrap();
        destroy(h).unwrap();
        assert!(!shared::is_valid(payload));
    }

    #[test]
    fn test_set_arg_after_start_rejected() {
        let (tx, rx) = mpsc::channel::<()>();
        let h = create("held", move || {
            // Block until the test releases us
            let _ = rx.recv();
        })
        .unwrap();
        start(h).unwrap();
        assert_eq!(set_int_arg(h, 0, 1).unwrap_err(), WeftError::InvalidState);
        assert_eq!(start(h).unwrap_err(), WeftError::InvalidState);
        tx.send(()).unwrap();
        join(h).unwrap();
        destroy(h).unwrap();
    }

    #[test]
    fn test_run_function_replaceable_before_start() {
        let (tx, rx) = mpsc::channel();
        let h = create("replaced", || panic!("original must not run")).unwrap();
        set_run_function(h, move || tx.send(7).unwrap()).unwrap();
        start(h).unwrap();
        assert_eq!(rx.recv().unwrap(), 7);
        join(h).unwrap();
        destroy(h).unwrap();
    }
}
