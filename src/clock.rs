//! Monotonic time source abstraction
//!
//! **Why**: Frame scheduling is all about elapsed time. Injecting the clock
//! instead of calling `Instant::now()` directly makes every timing decision
//! (delays, throttle windows, job timeouts, TTL expiry) deterministic in tests.
//!
//! **Used by**: scheduler, driver, throttle, queue, memo modules

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Monotonic clock. Implementations must never go backwards.
pub trait Clock: Send + Sync + 'static {
    /// Current monotonic instant.
    fn now(&self) -> Instant;
}

/// Wall clock backed by `Instant::now()`. The default for production use.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Manually advanced clock for tests.
///
/// Starts at an arbitrary base instant and only moves when `advance()` is
/// called, so ticks and timeouts can be driven frame by frame.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    /// Move the clock forward by `delta`.
    pub fn advance(&self, delta: Duration) {
        let mut offset = self.offset.lock().unwrap();
        *offset += delta;
    }

    /// Move the clock forward by `ms` milliseconds.
    pub fn advance_ms(&self, ms: u64) {
        self.advance(Duration::from_millis(ms));
    }

    /// Elapsed time since the clock was created.
    pub fn elapsed(&self) -> Duration {
        *self.offset.lock().unwrap()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock().unwrap()
    }
}

/// Shared manual clock plus a matching `Arc<dyn Clock>` handle.
///
/// Convenience for tests: `let (clock, handle) = manual_clock();`
pub fn manual_clock() -> (Arc<ManualClock>, Arc<dyn Clock>) {
    let clock = Arc::new(ManualClock::new());
    let handle: Arc<dyn Clock> = clock.clone();
    (clock, handle)
}
