//! # weft - cooperative threadlets over readiness I/O
//!
//! Each OS thread owns one event loop; tasks ("threadlets") on a loop run
//! cooperatively, suspending only when they wait for descriptor readiness
//! or yield. State that crosses thread or task boundaries lives in a
//! refcounted, generation-checked shared-memory table and is reached only
//! through opaque handles, so stale access is a reported error rather than
//! corruption.
//!
//! ## Quick start
//!
//! ```ignore
//! use weft::{spawn, run_until_idle, Context, Step, WaitOutcome};
//!
//! fn main() {
//!     spawn(|_cx: &mut Context, _: WaitOutcome| {
//!         println!("hello from a threadlet");
//!         Step::Finish
//!     }).unwrap();
//!     run_until_idle().unwrap();
//! }
//! ```
//!
//! ## Layers
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                    User Code                        │
//! │        spawn(), Step::Wait, os_thread::signal       │
//! └─────────────────────────────────────────────────────┘
//!                          │
//!            ┌─────────────┼──────────────┐
//!            ▼             ▼              ▼
//!      ┌──────────┐  ┌───────────┐  ┌───────────┐
//!      │  Event   │  │ OS thread │  │  Shared   │
//!      │  loop    │  │   layer   │  │  handles  │
//!      └──────────┘  └───────────┘  └───────────┘
//!            │             │
//!            ▼             ▼
//!      ┌──────────┐  ┌───────────┐
//!      │  epoll   │  │  eventfd  │
//!      │ (Poller) │  │  (waker)  │
//!      └──────────┘  └───────────┘
//! ```

// Re-export core types
pub use weft_core::{
    ShmHandle, SignalSet, TaskId, TaskStatus, TimeMs, WaitOutcome, WeftError, WeftResult,
    NO_WAIT, WAIT_FOREVER,
};

// Re-export wlog macros for debug logging
pub use weft_core::{wdebug, werror, winfo, wtrace, wwarn};
pub use weft_core::wlog::{init as init_logging, set_log_level, LogLevel};

// Re-export env utilities
pub use weft_core::env::{env_get, env_get_bool};

// Re-export runtime types
pub use weft_runtime::{
    Context, EventLoop, EventLoopConfig, Interest, LoopHandle, SharedGuard, Step, ThreadWaker,
    Threadlet,
};

pub use weft_runtime::os_thread;
pub use weft_runtime::shared;
pub use weft_runtime::time::now_ms;
pub use weft_runtime::tls;

/// Admit a threadlet on the calling thread's event loop (created on first
/// use)
pub fn spawn(t: impl Threadlet + 'static) -> WeftResult<TaskId> {
    tls::with_event_loop(|el| Ok(el.spawn(t)))
}

/// Run the calling thread's loop until a stop request arrives
pub fn run() -> WeftResult<()> {
    tls::with_event_loop(|el| el.run())
}

/// Run the calling thread's loop until every threadlet has finished
pub fn run_until_idle() -> WeftResult<()> {
    tls::with_event_loop(|el| el.run_until_idle())
}

/// Remote control for the calling thread's loop, usable from any thread
pub fn loop_handle() -> WeftResult<LoopHandle> {
    tls::with_event_loop(|el| Ok(el.handle()))
}
