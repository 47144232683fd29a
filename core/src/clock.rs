//! Monotonic time sources
//!
//! Every timeout, latency and timestamp in the engine is measured as a
//! [`Duration`] since the clock's origin, never as wall-clock time, so NTP
//! adjustments cannot reopen or close a circuit early.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Monotonic time source used for all breaker, latency and cache math
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Time elapsed since the clock's origin
    fn now(&self) -> Duration;
}

/// Clock backed by the tokio monotonic instant
///
/// Honors `tokio::time::pause()` when used inside a paused runtime.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    start_time: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.start_time.elapsed()
    }
}

/// Hand-driven clock for deterministic tests and simulations
///
/// Time only moves when [`ManualClock::advance`] or [`ManualClock::set`] is called.
#[derive(Debug, Default)]
pub struct ManualClock {
    current: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move time forward by `by`
    pub fn advance(&self, by: Duration) {
        let mut current = self.current.lock();
        *current += by;
    }

    /// Jump to an absolute offset from the origin
    pub fn set(&self, to: Duration) {
        *self.current.lock() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.current.lock()
    }
}
