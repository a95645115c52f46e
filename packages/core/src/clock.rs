//! Clock abstraction for deadline bookkeeping.
//!
//! The broker stamps pending calls with an enqueue time and checks deadlines
//! against a [`ClockSource`] injected at engine construction, so timeout
//! behavior is deterministic under test. The default implementation
//! ([`SystemClock`]) delegates to `std::time::SystemTime`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Abstraction over the system clock for dependency injection.
///
/// Allows deterministic testing by replacing the real clock with a manual one.
pub trait ClockSource: Send + Sync {
    /// Returns the current time as milliseconds since Unix epoch.
    fn now(&self) -> u64;
}

/// Default clock source that reads the real system time.
#[derive(Debug, Clone)]
pub struct SystemClock;

impl ClockSource for SystemClock {
    fn now(&self) -> u64 {
        #[allow(clippy::cast_possible_truncation)]
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is before Unix epoch")
            .as_millis() as u64;
        millis
    }
}

/// Manually advanced clock for deterministic tests.
///
/// Starts at zero; `advance` moves time forward. Safe to share across tasks.
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicU64,
}

impl ManualClock {
    /// Creates a clock starting at the given epoch-milliseconds value.
    #[must_use]
    pub fn starting_at(millis: u64) -> Self {
        Self {
            millis: AtomicU64::new(millis),
        }
    }

    /// Moves the clock forward by `delta_ms` milliseconds.
    pub fn advance(&self, delta_ms: u64) {
        self.millis.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl ClockSource for ManualClock {
    fn now(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}
