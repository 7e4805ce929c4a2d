//! Event loop configuration

use weft_core::env::env_get;

/// Configuration for one per-thread event loop
#[derive(Debug, Clone)]
pub struct EventLoopConfig {
    /// Max readiness events drained per poll call
    pub max_events: usize,

    /// Upper bound on one blocking poll when no timer is closer (ms)
    pub poll_interval_ms: i64,

    /// Capacity of the cross-thread control queue
    pub ctl_capacity: usize,

    /// Initial capacity of the task table
    pub initial_tasks: usize,
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        Self {
            max_events: 256,
            poll_interval_ms: 100,
            ctl_capacity: 1024,
            initial_tasks: 64,
        }
    }
}

impl EventLoopConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read overrides from `WEFT_*` environment variables
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_events: env_get("WEFT_MAX_EVENTS", d.max_events),
            poll_interval_ms: env_get("WEFT_POLL_INTERVAL_MS", d.poll_interval_ms),
            ctl_capacity: env_get("WEFT_CTL_CAPACITY", d.ctl_capacity),
            initial_tasks: env_get("WEFT_INITIAL_TASKS", d.initial_tasks),
        }
    }

    pub fn max_events(mut self, n: usize) -> Self {
        self.max_events = n;
        self
    }

    pub fn poll_interval_ms(mut self, ms: i64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    pub fn ctl_capacity(mut self, n: usize) -> Self {
        self.ctl_capacity = n;
        self
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if self.max_events == 0 {
            return Err("max_events must be at least 1");
        }
        if self.poll_interval_ms <= 0 {
            return Err("poll_interval_ms must be positive");
        }
        if self.ctl_capacity == 0 {
            return Err("ctl_capacity must be at least 1");
        }
        Ok(())
    }
}
