//! # weft-runtime
//!
//! Runtime half of the weft cooperative scheduler.
//!
//! This crate provides:
//! - The shared-memory handle table (refcounted, generation-checked slots)
//! - Managed OS threads with per-thread wakeup descriptors and signal bits
//! - The per-thread event loop with its readiness multiplexer
//! - Cooperative tasks expressed as resumable state machines

pub mod config;
pub mod event_loop;
pub mod os_thread;
pub mod poller;
pub mod shared;
pub mod task;
pub mod time;
pub mod tls;
pub mod waker;

// Re-exports
pub use config::EventLoopConfig;
pub use event_loop::{EventLoop, LoopHandle};
pub use poller::{Interest, PollEvent, Poller};
pub use shared::SharedGuard;
pub use task::{Context, Step, Threadlet};
pub use waker::ThreadWaker;

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        // epoll + eventfd backend
    } else {
        compile_error!("weft-runtime currently requires Linux (epoll, eventfd)");
    }
}
