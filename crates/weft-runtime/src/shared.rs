//! Reference-counted, generation-checked shared memory table
//!
//! This is the runtime's replacement for "pointer + mutex": any state that
//! crosses a task or thread boundary lives in a table slot and is reached
//! only through an opaque [`ShmHandle`]. The slot's mutual exclusion IS the
//! lock, and the generation stamp turns use-after-free into a reported
//! [`WeftError::InvalidHandle`] instead of memory corruption.
//!
//! Two payload kinds are supported:
//! - raw byte blocks ([`alloc`]) with an optional destructor callback,
//! - typed Rust values ([`wrap`]) retrieved by downcast through the guard.
//!
//! Exclusive access is a [`SharedGuard`] returned by [`acquire`]; dropping
//! the guard ends the exclusivity, so an unmatched unlock cannot be
//! written. Lifetime ownership is separate: [`retain`] / [`release`] move
//! the reference count, and the release that reaches zero runs the
//! destructor and retires the slot under a bumped generation.
//!
//! Acquire/release pairs must not span a scheduler suspension point: an
//! acquire blocks the OS thread, not just the calling task.

use std::any::Any;
use std::cell::UnsafeCell;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::time::Duration;

use weft_core::error::{WeftError, WeftResult};
use weft_core::handle::ShmHandle;
use weft_core::timeout::{is_forever, is_no_wait, TimeMs};
use weft_core::{wdebug, wtrace};

use crate::time::now_ms;

/// Destructor for byte blocks, run exactly once when the refcount hits zero
pub type ByteDtor = Box<dyn FnMut(&mut [u8]) + Send>;

enum Payload {
    Bytes {
        data: Box<[u8]>,
        dtor: Option<ByteDtor>,
    },
    Value(Box<dyn Any + Send>),
}

struct SlotMeta {
    generation: u32,
    refcount: u32,
    busy: bool,
    occupied: bool,
}

/// One table slot. `payload` is only touched by the holder of the `busy`
/// flag (or by table code paths that have excluded all holders), which is
/// what makes the `Sync` impl sound.
struct SlotCell {
    meta: Mutex<SlotMeta>,
    cond: Condvar,
    payload: UnsafeCell<Option<Payload>>,
}

unsafe impl Sync for SlotCell {}

impl SlotCell {
    fn new() -> Self {
        Self {
            meta: Mutex::new(SlotMeta {
                generation: 0,
                refcount: 0,
                busy: false,
                occupied: false,
            }),
            cond: Condvar::new(),
            payload: UnsafeCell::new(None),
        }
    }
}

struct TableInner {
    slots: Vec<Arc<SlotCell>>,
    free: Vec<u32>,
    next_generation: u32,
}

struct SharedTable {
    inner: Mutex<TableInner>,
}

static TABLE: OnceLock<SharedTable> = OnceLock::new();

fn table() -> &'static SharedTable {
    TABLE.get_or_init(|| SharedTable {
        inner: Mutex::new(TableInner {
            slots: Vec::with_capacity(64),
            free: Vec::new(),
            next_generation: 1,
        }),
    })
}

impl SharedTable {
    fn alloc_slot(&self, payload: Payload) -> WeftResult<ShmHandle> {
        let (index, generation, cell) = {
            let mut inner = self.inner.lock().unwrap();
            let index = match inner.free.pop() {
                Some(i) => i,
                None => {
                    // u32::MAX indices are representable, but leave the top
                    // value free so index+generation packing stays unambiguous
                    if inner.slots.len() >= u32::MAX as usize {
                        return Err(WeftError::OutOfMemory);
                    }
                    inner.slots.push(Arc::new(SlotCell::new()));
                    (inner.slots.len() - 1) as u32
                }
            };
            let generation = inner.next_generation;
            inner.next_generation = if generation == u32::MAX {
                1 // generation 0 stays reserved for the invalid handle
            } else {
                generation + 1
            };
            let cell = inner.slots[index as usize].clone();
            (index, generation, cell)
        };

        {
            let mut meta = cell.meta.lock().unwrap();
            meta.generation = generation;
            meta.refcount = 1;
            meta.busy = false;
            meta.occupied = true;
            // No handle has been issued yet, so no other holder can exist
            unsafe {
                *cell.payload.get() = Some(payload);
            }
        }

        let handle = ShmHandle::from_parts(index, generation);
        wtrace!("shared: allocated {:?}", handle);
        Ok(handle)
    }

    fn cell(&self, handle: ShmHandle) -> WeftResult<Arc<SlotCell>> {
        let inner = self.inner.lock().unwrap();
        inner
            .slots
            .get(handle.index() as usize)
            .cloned()
            .ok_or(WeftError::InvalidHandle)
    }

    fn free_slot(&self, index: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.free.push(index);
    }
}

fn validate(meta: &SlotMeta, handle: ShmHandle) -> WeftResult<()> {
    if !meta.occupied || meta.generation != handle.generation() || meta.refcount == 0 {
        return Err(WeftError::InvalidHandle);
    }
    Ok(())
}

/// Allocate a zeroed byte block of `size` bytes, refcount 1.
///
/// The destructor, if any, runs on the block when the last reference is
/// released, before the slot is retired.
pub fn alloc(size: usize, dtor: Option<ByteDtor>) -> WeftResult<ShmHandle> {
    if size == 0 {
        return Err(WeftError::InvalidParam);
    }
    let data = vec![0u8; size].into_boxed_slice();
    table().alloc_slot(Payload::Bytes { data, dtor })
}

/// Wrap a typed value in a shared slot, refcount 1.
///
/// The value is dropped when the last reference is released. Retrieve it
/// with [`SharedGuard::value`] / [`SharedGuard::value_mut`].
pub fn wrap<T: Any + Send>(value: T) -> WeftResult<ShmHandle> {
    table().alloc_slot(Payload::Value(Box::new(value)))
}

/// Obtain exclusive access to the slot behind `handle`.
///
/// Blocks up to `timeout_ms` (sentinels honored: `WAIT_FOREVER`, `NO_WAIT`,
/// zero means "fail immediately if busy") while another guard is live.
/// Fails with `InvalidHandle` if the handle is stale - including the case
/// where the slot is released out from under a queued waiter.
pub fn acquire(handle: ShmHandle, timeout_ms: TimeMs) -> WeftResult<SharedGuard> {
    if !handle.is_valid() {
        return Err(WeftError::InvalidParam);
    }
    let cell = table().cell(handle)?;

    let deadline = if is_forever(timeout_ms) {
        None
    } else if is_no_wait(timeout_ms) || timeout_ms <= 0 {
        Some(now_ms())
    } else {
        Some(now_ms().saturating_add(timeout_ms))
    };

    let mut meta = cell.meta.lock().unwrap();
    loop {
        validate(&meta, handle)?;
        if !meta.busy {
            break;
        }
        match deadline {
            None => {
                meta = cell.cond.wait(meta).unwrap();
            }
            Some(dl) => {
                let remaining = dl - now_ms();
                if remaining <= 0 {
                    return Err(WeftError::Timeout);
                }
                let (g, _) = cell
                    .cond
                    .wait_timeout(meta, Duration::from_millis(remaining as u64))
                    .unwrap();
                meta = g;
            }
        }
    }
    meta.busy = true;
    drop(meta);

    Ok(SharedGuard { cell, handle })
}

/// Add a reference to the allocation (for handing the handle to another
/// long-term owner, e.g. a child thread's argument list).
pub fn retain(handle: ShmHandle) -> WeftResult<()> {
    if !handle.is_valid() {
        return Err(WeftError::InvalidParam);
    }
    let cell = table().cell(handle)?;
    let mut meta = cell.meta.lock().unwrap();
    validate(&meta, handle)?;
    meta.refcount = meta
        .refcount
        .checked_add(1)
        .ok_or(WeftError::OutOfMemory)?;
    Ok(())
}

/// Drop a reference. The release that reaches zero waits out any live
/// guard, runs the destructor, and retires the slot; every outstanding
/// handle to it becomes invalid.
pub fn release(handle: ShmHandle) -> WeftResult<()> {
    if !handle.is_valid() {
        return Err(WeftError::InvalidParam);
    }
    let cell = table().cell(handle)?;

    let payload = {
        let mut meta = cell.meta.lock().unwrap();
        validate(&meta, handle)?;
        meta.refcount -= 1;
        if meta.refcount > 0 {
            return Ok(());
        }
        // Last reference: exclude any in-flight guard before the payload
        // can be destroyed.
        while meta.busy {
            meta = cell.cond.wait(meta).unwrap();
        }
        meta.occupied = false;
        unsafe { (*cell.payload.get()).take() }
    };
    // Queued acquirers revalidate and fail with InvalidHandle
    cell.cond.notify_all();

    if let Some(p) = payload {
        run_dtor(p);
    }
    table().free_slot(handle.index());
    wdebug!("shared: released {:?}", handle);
    Ok(())
}

fn run_dtor(payload: Payload) {
    match payload {
        Payload::Bytes { mut data, dtor } => {
            if let Some(mut f) = dtor {
                f(&mut data);
            }
        }
        Payload::Value(v) => drop(v),
    }
}

/// True if the handle still refers to a live allocation
pub fn is_valid(handle: ShmHandle) -> bool {
    if !handle.is_valid() {
        return false;
    }
    let Ok(cell) = table().cell(handle) else {
        return false;
    };
    let meta = cell.meta.lock().unwrap();
    validate(&meta, handle).is_ok()
}

/// Resize a byte block in place, preserving the handle.
///
/// Contents are preserved up to the smaller of the two sizes; growth is
/// zero-filled. Fails with `InvalidState` on a value slot.
pub fn realloc_bytes(handle: ShmHandle, new_size: usize) -> WeftResult<()> {
    if new_size == 0 {
        return Err(WeftError::InvalidParam);
    }
    let mut guard = acquire(handle, weft_core::timeout::WAIT_FOREVER)?;
    match guard.payload_mut()? {
        Payload::Bytes { data, .. } => {
            let mut grown = vec![0u8; new_size].into_boxed_slice();
            let keep = data.len().min(new_size);
            grown[..keep].copy_from_slice(&data[..keep]);
            *data = grown;
            Ok(())
        }
        Payload::Value(_) => Err(WeftError::InvalidState),
    }
}

/// Exclusive access to one slot's payload.
///
/// Dropping the guard ends the exclusivity and wakes queued acquirers.
/// The reference count is not touched: a guard grants access, not
/// ownership.
pub struct SharedGuard {
    cell: Arc<SlotCell>,
    handle: ShmHandle,
}

impl SharedGuard {
    /// The handle this guard was acquired from
    #[inline]
    pub fn handle(&self) -> ShmHandle {
        self.handle
    }

    fn payload(&self) -> WeftResult<&Payload> {
        // Exclusive while busy; release-to-zero waits for !busy, so the
        // payload cannot disappear under a live guard.
        unsafe { (*self.cell.payload.get()).as_ref() }.ok_or(WeftError::InvalidState)
    }

    fn payload_mut(&mut self) -> WeftResult<&mut Payload> {
        unsafe { (*self.cell.payload.get()).as_mut() }.ok_or(WeftError::InvalidState)
    }

    /// Borrow a byte block payload
    pub fn bytes(&self) -> WeftResult<&[u8]> {
        match self.payload()? {
            Payload::Bytes { data, .. } => Ok(data),
            Payload::Value(_) => Err(WeftError::InvalidState),
        }
    }

    /// Mutably borrow a byte block payload
    pub fn bytes_mut(&mut self) -> WeftResult<&mut [u8]> {
        match self.payload_mut()? {
            Payload::Bytes { data, .. } => Ok(data),
            Payload::Value(_) => Err(WeftError::InvalidState),
        }
    }

    /// Borrow a wrapped value, checked by type
    pub fn value<T: Any>(&self) -> WeftResult<&T> {
        match self.payload()? {
            Payload::Value(v) => v.downcast_ref::<T>().ok_or(WeftError::InvalidParam),
            Payload::Bytes { .. } => Err(WeftError::InvalidState),
        }
    }

    /// Mutably borrow a wrapped value, checked by type
    pub fn value_mut<T: Any>(&mut self) -> WeftResult<&mut T> {
        match self.payload_mut()? {
            Payload::Value(v) => v.downcast_mut::<T>().ok_or(WeftError::InvalidParam),
            Payload::Bytes { .. } => Err(WeftError::InvalidState),
        }
    }
}

impl fmt::Debug for SharedGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The payload is intentionally not shown; formatting must not
        // touch memory that belongs to the guard holder's borrows
        f.debug_struct("SharedGuard")
            .field("handle", &self.handle)
            .finish()
    }
}

impl Drop for SharedGuard {
    fn drop(&mut self) {
        let mut meta = self.cell.meta.lock().unwrap();
        meta.busy = false;
        drop(meta);
        self.cell.cond.notify_all();
    }
}

/// Debug helper: refcounts by live handle (test support, not an API)
#[cfg(test)]
fn ref_count(handle: ShmHandle) -> WeftResult<u32> {
    let cell = table().cell(handle)?;
    let meta = cell.meta.lock().unwrap();
    validate(&meta, handle)?;
    Ok(meta.refcount)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    type TestMap = HashMap<i32, u64>;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use weft_core::timeout::{NO_WAIT, WAIT_FOREVER};

    #[test]
    fn test_alloc_and_byte_access() {
        let h = alloc(16, None).unwrap();
        {
            let mut g = acquire(h, WAIT_FOREVER).unwrap();
            let b = g.bytes_mut().unwrap();
            assert_eq!(b.len(), 16);
            assert!(b.iter().all(|&x| x == 0));
            b[0] = 0xAB;
            b[15] = 0xCD;
        }
        {
            let g = acquire(h, WAIT_FOREVER).unwrap();
            let b = g.bytes().unwrap();
            assert_eq!(b[0], 0xAB);
            assert_eq!(b[15], 0xCD);
        }
        release(h).unwrap();
    }

    #[test]
    fn test_guard_debug_names_its_handle() {
        let h = wrap(3u8).unwrap();
        let g = acquire(h, WAIT_FOREVER).unwrap();
        let text = format!("{:?}", g);
        assert!(text.contains("SharedGuard"));
        assert!(text.contains(&format!("{:?}", h)));
        drop(g);
        release(h).unwrap();
    }

    #[test]
    fn test_round_trip_acquire_release_preserves_state() {
        let h = alloc(8, None).unwrap();
        {
            let mut g = acquire(h, WAIT_FOREVER).unwrap();
            g.bytes_mut().unwrap().copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        }

        let before = ref_count(h).unwrap();
        {
            let _g = acquire(h, WAIT_FOREVER).unwrap();
        }
        assert_eq!(ref_count(h).unwrap(), before);

        let g = acquire(h, WAIT_FOREVER).unwrap();
        assert_eq!(g.bytes().unwrap(), &[1, 2, 3, 4, 5, 6, 7, 8]);
        drop(g);
        release(h).unwrap();
    }

    #[test]
    fn test_generation_safety_after_reuse() {
        let dropped = Arc::new(AtomicBool::new(false));
        let flag = dropped.clone();
        let h = alloc(
            4,
            Some(Box::new(move |_| flag.store(true, Ordering::SeqCst))),
        )
        .unwrap();
        let stale = h;

        release(h).unwrap();
        assert!(dropped.load(Ordering::SeqCst), "destructor must run at zero");

        // The free list is LIFO, so one of these reuses the freed index
        // (other tests share the table, so allocate a few)
        let fresh: Vec<ShmHandle> = (0..8).map(|_| alloc(4, None).unwrap()).collect();
        if let Some(reused) = fresh.iter().find(|f| f.index() == stale.index()) {
            assert_ne!(reused.generation(), stale.generation());
        }

        // The old handle must not reach any new data
        assert_eq!(acquire(stale, NO_WAIT).unwrap_err(), WeftError::InvalidHandle);
        assert!(!is_valid(stale));
        for f in fresh {
            assert!(is_valid(f));
            release(f).unwrap();
        }
    }

    #[test]
    fn test_acquire_timeout_when_busy() {
        let h = wrap(0u64).unwrap();
        let held = acquire(h, WAIT_FOREVER).unwrap();

        let start = now_ms();
        assert_eq!(acquire(h, 40).unwrap_err(), WeftError::Timeout);
        assert!(now_ms() - start >= 35);

        assert_eq!(acquire(h, NO_WAIT).unwrap_err(), WeftError::Timeout);
        assert_eq!(acquire(h, 0).unwrap_err(), WeftError::Timeout);

        drop(held);
        let _g = acquire(h, NO_WAIT).unwrap();
        drop(_g);
        release(h).unwrap();
    }

    #[test]
    fn test_retain_release() {
        let h = wrap(String::from("shared")).unwrap();
        retain(h).unwrap();

        release(h).unwrap();
        // Still alive: retain added a second reference
        assert!(is_valid(h));
        {
            let g = acquire(h, WAIT_FOREVER).unwrap();
            assert_eq!(g.value::<String>().unwrap(), "shared");
        }
        release(h).unwrap();
        assert!(!is_valid(h));
    }

    #[test]
    fn test_double_release_reported() {
        let h = wrap(1u32).unwrap();
        release(h).unwrap();
        assert_eq!(release(h).unwrap_err(), WeftError::InvalidHandle);
    }

    #[test]
    fn test_invalid_handle_rejected() {
        assert_eq!(
            acquire(ShmHandle::INVALID, WAIT_FOREVER).unwrap_err(),
            WeftError::InvalidParam
        );
        // Plausible-looking handle to a slot that was never allocated
        let bogus = ShmHandle::from_parts(0x00FF_FFFF, 7);
        assert_eq!(acquire(bogus, NO_WAIT).unwrap_err(), WeftError::InvalidHandle);
    }

    #[test]
    fn test_wrap_downcast_type_check() {
        let h = wrap(vec![1i32, 2, 3]).unwrap();
        let mut g = acquire(h, WAIT_FOREVER).unwrap();
        assert_eq!(g.value::<Vec<i32>>().unwrap(), &vec![1, 2, 3]);
        assert_eq!(g.value::<String>().unwrap_err(), WeftError::InvalidParam);
        assert_eq!(g.bytes_mut().unwrap_err(), WeftError::InvalidState);
        g.value_mut::<Vec<i32>>().unwrap().push(4);
        drop(g);
        release(h).unwrap();
    }

    #[test]
    fn test_realloc_preserves_handle_and_prefix() {
        let h = alloc(4, None).unwrap();
        {
            let mut g = acquire(h, WAIT_FOREVER).unwrap();
            g.bytes_mut().unwrap().copy_from_slice(&[9, 8, 7, 6]);
        }
        realloc_bytes(h, 8).unwrap();
        {
            let g = acquire(h, WAIT_FOREVER).unwrap();
            assert_eq!(g.bytes().unwrap(), &[9, 8, 7, 6, 0, 0, 0, 0]);
        }
        realloc_bytes(h, 2).unwrap();
        {
            let g = acquire(h, WAIT_FOREVER).unwrap();
            assert_eq!(g.bytes().unwrap(), &[9, 8]);
        }
        release(h).unwrap();
    }

    #[test]
    fn test_contended_acquire_across_threads() {
        let h = wrap(TestMap::new()).unwrap();
        let mut handles = Vec::new();
        for t in 0..4u64 {
            handles.push(std::thread::spawn(move || {
                for i in 0..50u64 {
                    let mut g = acquire(h, WAIT_FOREVER).unwrap();
                    let map = g.value_mut::<TestMap>().unwrap();
                    *map.entry(t as i32).or_insert(0) += i;
                }
            }));
        }
        for th in handles {
            th.join().unwrap();
        }
        let g = acquire(h, WAIT_FOREVER).unwrap();
        let map = g.value::<TestMap>().unwrap();
        assert_eq!(map.len(), 4);
        for v in map.values() {
            assert_eq!(*v, (0..50).sum::<u64>());
        }
        drop(g);
        release(h).unwrap();
    }
}
