//! Injectable time.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

/// Source of "now" in unix seconds.
///
/// Staleness arithmetic compares float second stamps; injecting the source
/// lets tests move time without sleeping.
pub trait TimeSource: Send + Sync + 'static {
    /// Current time in seconds since the unix epoch.
    fn now(&self) -> f64;
}

/// The wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl TimeSource for SystemClock {
    fn now(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs_f64())
            .unwrap_or(0.0)
    }
}

/// A hand-driven clock for tests.
#[derive(Debug, Default)]
pub struct ManualClock(Mutex<f64>);

impl ManualClock {
    /// Starts the clock at `now`.
    pub fn starting_at(now: f64) -> Arc<Self> {
        Arc::new(Self(Mutex::new(now)))
    }

    /// Moves the clock forward.
    pub fn advance(&self, seconds: f64) {
        *self.0.lock() += seconds;
    }
}

impl TimeSource for ManualClock {
    fn now(&self) -> f64 {
        *self.0.lock()
    }
}
