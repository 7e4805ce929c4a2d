//! # weft-core
//!
//! Platform-agnostic types for the weft threadlet runtime:
//!
//! - [`handle::ShmHandle`] - generation-stamped shared memory handles
//! - [`id::TaskId`] - threadlet identifiers
//! - [`signal::SignalSet`] - cross-thread signal bitmasks
//! - [`status`] - task lifecycle states and wait outcomes
//! - [`timeout`] - millisecond timeouts with wait-forever / no-wait sentinels
//! - [`error`] - the `WeftError` taxonomy
//! - [`wlog`] - leveled stderr logging macros
//! - [`env`] - environment variable helpers
//!
//! This crate has no platform dependencies; everything that touches the OS
//! lives in `weft-runtime`.

pub mod env;
pub mod error;
pub mod handle;
pub mod id;
pub mod signal;
pub mod status;
pub mod timeout;
pub mod wlog;

pub use error::{WeftError, WeftResult};
pub use handle::ShmHandle;
pub use id::TaskId;
pub use signal::SignalSet;
pub use status::{TaskStatus, WaitOutcome};
pub use timeout::{TimeMs, NO_WAIT, WAIT_FOREVER};
