//! Clocks driving the asset monitor.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use strand_core::LogicalTime;

/// Source of "now" for deadline checks
pub trait Clock: Send + Sync {
    /// Current logical time
    fn now(&self) -> LogicalTime;
}

/// Wall clock measured from its creation
#[derive(Debug)]
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    /// Start a clock at zero
    #[must_use]
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> LogicalTime {
        let millis = u64::try_from(self.start.elapsed().as_millis()).unwrap_or(u64::MAX);
        LogicalTime::from_millis(millis)
    }
}

/// Clock advanced explicitly, for reproducible timeout behaviour
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicU64,
}

impl ManualClock {
    /// Start at zero
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Move forward
    pub fn advance(&self, millis: u64) {
        self.millis.fetch_add(millis, Ordering::SeqCst);
    }

    /// Jump to an absolute time
    pub fn set(&self, time: LogicalTime) {
        self.millis.store(time.as_millis(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> LogicalTime {
        LogicalTime::from_millis(self.millis.load(Ordering::SeqCst))
    }
}
