//! Per-thread cooperative event loop
//!
//! One loop per OS thread, never shared: the loop itself is `!Send`, and
//! cross-thread requests arrive through a [`LoopHandle`] (lock-free
//! control queue + the owner thread's waker, so a blocked poll returns
//! promptly).
//!
//! A tick is: poll for readiness, resolve ready descriptors, drain the
//! control queue, expire deadlines, then drain a snapshot of the ready
//! queue. The snapshot bounds one tick and keeps dispatch round-robin:
//! a task that yields goes to the tail and runs again next tick at the
//! earliest.

use std::collections::{HashMap, VecDeque};
use std::os::fd::RawFd;
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

use weft_core::error::{WeftError, WeftResult};
use weft_core::id::TaskId;
use weft_core::status::{TaskStatus, WaitOutcome};
use weft_core::timeout::{deadline_for, TimeMs};
use weft_core::{wdebug, werror, wtrace};

use crate::config::EventLoopConfig;
use crate::poller::{Interest, Poller};
use crate::task::{Context, Step, TaskTable, Threadlet};
use crate::time::now_ms;
use crate::tls;
use crate::waker::ThreadWaker;

/// Poller token reserved for the owner thread's waker descriptor
const WAKER_TOKEN: u64 = u64::MAX;

enum Control {
    Stop,
    Wake(TaskId),
    AbortFd(RawFd),
}

/// Cross-thread remote control for an event loop.
///
/// Cheap to clone; valid for the life of the loop. Requests are applied
/// during the owner thread's next tick.
#[derive(Clone)]
pub struct LoopHandle {
    ctl: Arc<ArrayQueue<Control>>,
    waker: Arc<ThreadWaker>,
}

impl LoopHandle {
    /// Ask the loop to leave `run` at the next tick
    pub fn stop(&self) -> WeftResult<()> {
        self.push(Control::Stop)
    }

    /// Move a waiting or idle task to the ready queue
    pub fn wake_task(&self, task: TaskId) -> WeftResult<()> {
        self.push(Control::Wake(task))
    }

    /// Cancel the wait on `fd`: the registration is dropped and the
    /// waiting task resumes with an `Abort` outcome instead of running
    /// out its timeout
    pub fn abort_io(&self, fd: RawFd) -> WeftResult<()> {
        self.push(Control::AbortFd(fd))
    }

    fn push(&self, ctl: Control) -> WeftResult<()> {
        if self.ctl.push(ctl).is_err() {
            return Err(WeftError::WouldBlock);
        }
        self.waker.poke()?;
        Ok(())
    }
}

struct Registration {
    task: TaskId,
    interest: Interest,
    deadline: Option<TimeMs>,
}

pub struct EventLoop {
    config: EventLoopConfig,
    poller: Poller,
    tasks: TaskTable,
    /// At most one live registration per descriptor
    regs: HashMap<RawFd, Registration>,
    ready: VecDeque<(TaskId, WaitOutcome)>,
    ctl: Arc<ArrayQueue<Control>>,
    waker: Arc<ThreadWaker>,
    running: bool,
}

impl EventLoop {
    /// Create a loop owned by the calling thread. The thread's waker
    /// descriptor is registered up front so signals interrupt blocked
    /// polls.
    pub fn new(config: EventLoopConfig) -> WeftResult<Self> {
        config.validate().map_err(|_| WeftError::InvalidParam)?;
        let poller = Poller::new(config.max_events)?;
        let waker = tls::waker()?;
        poller.register(waker.fd(), WAKER_TOKEN, Interest::READ)?;
        let initial_tasks = config.initial_tasks;
        let ctl_capacity = config.ctl_capacity;
        Ok(Self {
            config,
            poller,
            tasks: TaskTable::with_capacity(initial_tasks),
            regs: HashMap::new(),
            ready: VecDeque::new(),
            ctl: Arc::new(ArrayQueue::new(ctl_capacity)),
            waker,
            running: false,
        })
    }

    /// Remote control usable from any thread
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            ctl: self.ctl.clone(),
            waker: self.waker.clone(),
        }
    }

    /// Admit a task; it is resumed from the ready queue on a later tick
    pub fn spawn(&mut self, t: impl Threadlet + 'static) -> TaskId {
        self.admit(Box::new(t))
    }

    fn admit(&mut self, body: Box<dyn Threadlet>) -> TaskId {
        let id = self.tasks.insert(body);
        self.ready.push_back((id, WaitOutcome::Ready));
        wtrace!("loop: admitted task {}", id);
        id
    }

    /// Number of live tasks (ready, waiting or running)
    pub fn live_tasks(&self) -> usize {
        self.tasks.live()
    }

    /// Park `task` until `fd` is ready for `interest` or `timeout_ms`
    /// elapses (`timeout_ms <= 0` or the forever sentinel means no
    /// deadline). At most one waiter per descriptor: a second
    /// registration for a live descriptor is `InvalidState`.
    pub fn register_io(
        &mut self,
        fd: RawFd,
        interest: Interest,
        task: TaskId,
        timeout_ms: TimeMs,
    ) -> WeftResult<()> {
        if self.regs.contains_key(&fd) {
            return Err(WeftError::InvalidState);
        }
        {
            let t = self.tasks.get_mut(task).ok_or(WeftError::NotFound)?;
            t.status = TaskStatus::Waiting;
            t.waiting_fd = Some(fd);
        }
        if let Err(e) = self.poller.register(fd, fd as u64, interest) {
            if let Some(t) = self.tasks.get_mut(task) {
                t.status = TaskStatus::Ready;
                t.waiting_fd = None;
            }
            return Err(e);
        }
        let deadline = deadline_for(now_ms(), timeout_ms);
        self.regs.insert(
            fd,
            Registration {
                task,
                interest,
                deadline,
            },
        );
        wtrace!("loop: task {} waiting on fd {}", task, fd);
        Ok(())
    }

    /// Drop the registration for `fd`. Idempotent; does not wake the
    /// parked task (see [`Self::abort_io`] for that).
    pub fn unregister_io(&mut self, fd: RawFd) -> WeftResult<()> {
        if let Some(reg) = self.regs.remove(&fd) {
            self.poller.unregister(fd)?;
            if let Some(t) = self.tasks.get_mut(reg.task) {
                t.waiting_fd = None;
            }
        }
        Ok(())
    }

    /// Cancel the wait on `fd` and resume its task with `Abort`
    pub fn abort_io(&mut self, fd: RawFd) -> WeftResult<()> {
        if let Some(reg) = self.regs.remove(&fd) {
            self.poller.unregister(fd)?;
            self.resolve(reg.task, WaitOutcome::Abort);
        }
        Ok(())
    }

    /// Move a waiting task to the ready queue (no-op if it is gone or
    /// already queued as ready). Only `Waiting` tasks are moved: a ready
    /// task already holds exactly one queue entry, and admitting a second
    /// would resume it twice in one tick.
    pub fn enqueue_ready(&mut self, task: TaskId) {
        if let Some(t) = self.tasks.get_mut(task) {
            if t.status == TaskStatus::Waiting {
                if let Some(fd) = t.waiting_fd.take() {
                    self.regs.remove(&fd);
                    let _ = self.poller.unregister(fd);
                }
                self.resolve(task, WaitOutcome::Ready);
            }
        }
    }

    fn resolve(&mut self, task: TaskId, outcome: WaitOutcome) {
        if let Some(t) = self.tasks.get_mut(task) {
            t.status = TaskStatus::Ready;
            t.waiting_fd = None;
            self.ready.push_back((task, outcome));
        }
    }

    /// Run ticks until [`stop`](Self::stop) (or a handle's `stop`) is seen
    pub fn run(&mut self) -> WeftResult<()> {
        self.running = true;
        wdebug!("loop: running");
        while self.running {
            self.turn()?;
        }
        wdebug!("loop: stopped");
        Ok(())
    }

    /// Run ticks until every task has finished
    pub fn run_until_idle(&mut self) -> WeftResult<()> {
        self.running = true;
        while self.running && self.tasks.live() > 0 {
            self.turn()?;
        }
        self.running = false;
        Ok(())
    }

    /// Clear the running flag; effective at the current tick boundary
    pub fn stop(&mut self) {
        self.running = false;
    }

    /// One tick. Returns the number of task resumptions performed.
    pub fn turn(&mut self) -> WeftResult<usize> {
        let timeout = self.poll_timeout();

        // 1. Poll and resolve readiness
        let mut hits: Vec<u64> = Vec::new();
        let mut waker_hit = false;
        self.poller.wait(timeout, |ev| {
            if ev.token == WAKER_TOKEN {
                waker_hit = true;
            } else {
                hits.push(ev.token);
            }
        })?;
        if waker_hit {
            // Reset the eventfd; pending signal bits stay up for the
            // thread's own checkpoints
            self.waker.drain();
        }
        for token in hits {
            let fd = token as RawFd;
            if let Some(reg) = self.regs.remove(&fd) {
                self.poller.unregister(fd)?;
                self.resolve(reg.task, WaitOutcome::Ready);
            }
        }

        // 2. Apply cross-thread requests
        while let Some(ctl) = self.ctl.pop() {
            match ctl {
                Control::Stop => self.running = false,
                Control::Wake(task) => self.enqueue_ready(task),
                Control::AbortFd(fd) => self.abort_io(fd)?,
            }
        }

        // 3. Expire I/O deadlines
        let now = now_ms();
        let expired: Vec<RawFd> = self
            .regs
            .iter()
            .filter(|(_, r)| r.deadline.is_some_and(|dl| dl <= now))
            .map(|(&fd, _)| fd)
            .collect();
        for fd in expired {
            if let Some(reg) = self.regs.remove(&fd) {
                self.poller.unregister(fd)?;
                wtrace!("loop: fd {} timed out (task {})", fd, reg.task);
                self.resolve(reg.task, WaitOutcome::Timeout);
            }
        }

        // 4. Drain a snapshot of the ready queue
        let budget = self.ready.len();
        let mut resumed = 0;
        for _ in 0..budget {
            let Some((id, outcome)) = self.ready.pop_front() else {
                break;
            };
            self.dispatch(id, outcome);
            resumed += 1;
        }
        Ok(resumed)
    }

    fn dispatch(&mut self, id: TaskId, outcome: WaitOutcome) {
        // The task body runs with the table intact, so it is moved out
        // for the duration of the resumption
        let Some(mut task) = self.tasks.take(id) else {
            return; // reclaimed since it was queued
        };
        if task.status == TaskStatus::Finished {
            self.tasks.put_back(task);
            self.tasks.remove(id);
            return;
        }
        task.status = TaskStatus::Running;

        let mut cx = Context::new(id);
        let step = task.body.resume(&mut cx, outcome);
        for body in cx.spawned {
            self.admit(body);
        }

        match step {
            Step::Yield => {
                task.status = TaskStatus::Ready;
                self.tasks.put_back(task);
                self.ready.push_back((id, WaitOutcome::Ready));
            }
            Step::Wait {
                fd,
                interest,
                timeout_ms,
            } => {
                task.status = TaskStatus::Waiting;
                self.tasks.put_back(task);
                if let Err(e) = self.register_io(fd, interest, id, timeout_ms) {
                    // The task already suspended; surface the failure as
                    // an aborted wait instead of losing the task
                    werror!("loop: register_io fd {} for task {} failed: {}", fd, id, e);
                    self.resolve(id, WaitOutcome::Abort);
                }
            }
            Step::Finish => {
                wtrace!("loop: task {} finished", id);
                self.tasks.reclaim_taken(id);
            }
        }
    }

    fn poll_timeout(&self) -> TimeMs {
        if !self.ready.is_empty() {
            return 0;
        }
        let mut timeout = self.config.poll_interval_ms;
        let now = now_ms();
        for reg in self.regs.values() {
            if let Some(dl) = reg.deadline {
                timeout = timeout.min((dl - now).max(0));
            }
        }
        timeout
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        for (&fd, _) in self.regs.iter() {
            let _ = self.poller.unregister(fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::{pipe, write};
    use std::os::fd::AsRawFd;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use weft_core::timeout::WAIT_FOREVER;

    #[test]
    fn test_spawn_and_finish() {
        let mut el = EventLoop::new(EventLoopConfig::default()).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let r = ran.clone();
        el.spawn(move |_: &mut Context, _: WaitOutcome| {
            r.fetch_add(1, Ordering::SeqCst);
            Step::Finish
        });
        el.run_until_idle().unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(el.live_tasks(), 0);
    }

    #[test]
    fn test_yield_round_robin_fairness() {
        // Two yielding tasks must interleave: neither runs twice in a row
        let mut el = EventLoop::new(EventLoopConfig::default()).unwrap();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        for name in 0..2u8 {
            let order = order.clone();
            let mut left = 3;
            el.spawn(move |_: &mut Context, _: WaitOutcome| {
                order.lock().unwrap().push(name);
                left -= 1;
                if left == 0 {
                    Step::Finish
                } else {
                    Step::Yield
                }
            });
        }
        el.run_until_idle().unwrap();
        let order = order.lock().unwrap();
        assert_eq!(order.len(), 6);
        for pair in order.windows(2) {
            assert_ne!(pair[0], pair[1], "dispatch was not round-robin: {:?}", *order);
        }
    }

    #[test]
    fn test_wake_of_already_ready_task_is_noop() {
        // A redundant wake_task on a task that is already queued must not
        // add a second queue entry and break round-robin dispatch
        let mut el = EventLoop::new(EventLoopConfig::default()).unwrap();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut first = TaskId::NONE;
        for name in 0..2u8 {
            let order = order.clone();
            let mut left = 3;
            let id = el.spawn(move |_: &mut Context, _: WaitOutcome| {
                order.lock().unwrap().push(name);
                left -= 1;
                if left == 0 {
                    Step::Finish
                } else {
                    Step::Yield
                }
            });
            if name == 0 {
                first = id;
            }
        }
        el.enqueue_ready(first);
        el.run_until_idle().unwrap();
        let order = order.lock().unwrap();
        assert_eq!(order.len(), 6);
        for pair in order.windows(2) {
            assert_ne!(pair[0], pair[1], "redundant wake double-queued: {:?}", *order);
        }
    }

    #[test]
    fn test_stale_wake_misses_reused_task_slot() {
        let mut el = EventLoop::new(EventLoopConfig::default()).unwrap();
        let stale = el.spawn(|_: &mut Context, _: WaitOutcome| Step::Finish);
        el.run_until_idle().unwrap();

        // The next spawn reuses the slot under a new generation
        let (rx, _tx) = pipe().unwrap();
        let fd = rx.as_raw_fd();
        let outcomes = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen = outcomes.clone();
        let mut waited = false;
        let id = el.spawn(move |_: &mut Context, outcome: WaitOutcome| {
            if !waited {
                waited = true;
                return Step::Wait {
                    fd,
                    interest: Interest::READ,
                    timeout_ms: 40,
                };
            }
            seen.lock().unwrap().push(outcome);
            Step::Finish
        });
        assert_eq!(id.index(), stale.index());
        assert_ne!(id, stale);

        el.turn().unwrap();
        // A wake through the dead task's id must not cancel the live wait
        el.enqueue_ready(stale);
        el.run_until_idle().unwrap();
        assert_eq!(outcomes.lock().unwrap().as_slice(), &[WaitOutcome::Timeout]);
    }

    #[test]
    fn test_io_readiness_resumes_task() {
        let mut el = EventLoop::new(EventLoopConfig::default()).unwrap();
        let (rx, tx) = pipe().unwrap();
        let fd = rx.as_raw_fd();
        let outcomes = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen = outcomes.clone();
        let mut waited = false;
        el.spawn(move |_: &mut Context, outcome: WaitOutcome| {
            if !waited {
                waited = true;
                return Step::Wait {
                    fd,
                    interest: Interest::READ,
                    timeout_ms: WAIT_FOREVER,
                };
            }
            seen.lock().unwrap().push(outcome);
            Step::Finish
        });

        // First tick parks the task; the write then makes it ready
        el.turn().unwrap();
        write(&tx, b"!").unwrap();
        el.run_until_idle().unwrap();
        assert_eq!(outcomes.lock().unwrap().as_slice(), &[WaitOutcome::Ready]);
    }

    #[test]
    fn test_io_timeout_outcome() {
        let mut el = EventLoop::new(EventLoopConfig::default()).unwrap();
        let (rx, _tx) = pipe().unwrap();
        let fd = rx.as_raw_fd();
        let outcomes = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen = outcomes.clone();
        let mut waited = false;
        el.spawn(move |_: &mut Context, outcome: WaitOutcome| {
            if !waited {
                waited = true;
                return Step::Wait {
                    fd,
                    interest: Interest::READ,
                    timeout_ms: 30,
                };
            }
            seen.lock().unwrap().push(outcome);
            Step::Finish
        });

        let start = now_ms();
        el.run_until_idle().unwrap();
        assert_eq!(outcomes.lock().unwrap().as_slice(), &[WaitOutcome::Timeout]);
        assert!(now_ms() - start >= 25);

        // Expiry removed the registration: the descriptor is free again
        let t = el.spawn(|_: &mut Context, _: WaitOutcome| Step::Finish);
        el.register_io(fd, Interest::READ, t, WAIT_FOREVER).unwrap();
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut el = EventLoop::new(EventLoopConfig::default()).unwrap();
        let (rx, _tx) = pipe().unwrap();
        let fd = rx.as_raw_fd();
        let a = el.spawn(|_: &mut Context, _: WaitOutcome| Step::Finish);
        let b = el.spawn(|_: &mut Context, _: WaitOutcome| Step::Finish);
        el.register_io(fd, Interest::READ, a, WAIT_FOREVER).unwrap();
        assert_eq!(
            el.register_io(fd, Interest::READ, b, WAIT_FOREVER)
                .unwrap_err(),
            WeftError::InvalidState
        );
        // After unregister, the descriptor is free again
        el.unregister_io(fd).unwrap();
        el.unregister_io(fd).unwrap();
        el.register_io(fd, Interest::READ, b, WAIT_FOREVER).unwrap();
    }

    #[test]
    fn test_abort_io_from_another_thread() {
        let mut el = EventLoop::new(EventLoopConfig::default()).unwrap();
        let (rx, _tx) = pipe().unwrap();
        let fd = rx.as_raw_fd();
        let outcomes = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen = outcomes.clone();
        let mut waited = false;
        el.spawn(move |_: &mut Context, outcome: WaitOutcome| {
            if !waited {
                waited = true;
                return Step::Wait {
                    fd,
                    interest: Interest::READ,
                    // Long enough that only an abort can end the wait fast
                    timeout_ms: 60_000,
                };
            }
            seen.lock().unwrap().push(outcome);
            Step::Finish
        });

        let handle = el.handle();
        let aborter = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(30));
            handle.abort_io(fd).unwrap();
        });

        let start = now_ms();
        el.run_until_idle().unwrap();
        aborter.join().unwrap();
        assert_eq!(outcomes.lock().unwrap().as_slice(), &[WaitOutcome::Abort]);
        assert!(now_ms() - start < 5_000, "abort did not interrupt the wait");
    }

    #[test]
    fn test_stop_interrupts_run_promptly() {
        let mut el = EventLoop::new(
            EventLoopConfig::default().poll_interval_ms(60_000),
        )
        .unwrap();
        let handle = el.handle();
        let stopper = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            handle.stop().unwrap();
        });
        let start = now_ms();
        el.run().unwrap();
        stopper.join().unwrap();
        assert!(now_ms() - start < 5_000, "stop did not interrupt the poll");
    }

    #[test]
    fn test_spawn_from_task_context() {
        let mut el = EventLoop::new(EventLoopConfig::default()).unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        el.spawn(move |cx: &mut Context, _: WaitOutcome| {
            let c2 = c.clone();
            cx.spawn(move |_: &mut Context, _: WaitOutcome| {
                c2.fetch_add(10, Ordering::SeqCst);
                Step::Finish
            });
            c.fetch_add(1, Ordering::SeqCst);
            Step::Finish
        });
        el.run_until_idle().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 11);
    }
}
