//! Time types for STRAND.
//!
//! Deadlines are expressed in logical milliseconds measured from the start
//! of an office. The asset monitor compares deadlines against whatever the
//! configured clock reports, which makes timeouts reproducible in tests.

use serde::{Deserialize, Serialize};

/// Logical time in milliseconds since the office clock started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogicalTime(u64);

impl LogicalTime {
    /// Create a new logical time at zero
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Create from milliseconds
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Get as milliseconds
    #[must_use]
    pub const fn as_millis(&self) -> u64 {
        self.0
    }

    /// Advance by a number of milliseconds
    pub fn advance(&mut self, millis: u64) {
        self.0 = self.0.saturating_add(millis);
    }

    /// Time a timeout after this one
    #[must_use]
    pub const fn after(&self, timeout: Timeout) -> Self {
        Self(self.0.saturating_add(timeout.as_millis()))
    }

    /// Whether a deadline at `self` has been reached at `now`
    #[must_use]
    pub fn is_reached(&self, now: LogicalTime) -> bool {
        now.0 >= self.0
    }
}

impl Default for LogicalTime {
    fn default() -> Self {
        Self::zero()
    }
}

impl std::fmt::Display for LogicalTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "T+{}ms", self.0)
    }
}

impl From<u64> for LogicalTime {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// A timeout in milliseconds; zero means "wait forever"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Timeout(u64);

impl Timeout {
    /// No deadline
    pub const NONE: Timeout = Timeout(0);

    /// Timeout from milliseconds
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Timeout from seconds
    #[must_use]
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs.saturating_mul(1_000))
    }

    /// Get as milliseconds
    #[must_use]
    pub const fn as_millis(&self) -> u64 {
        self.0
    }

    /// Whether this timeout ever expires
    #[must_use]
    pub const fn is_bounded(&self) -> bool {
        self.0 > 0
    }

    /// Deadline for this timeout starting at `now`, if bounded
    #[must_use]
    pub fn deadline_from(&self, now: LogicalTime) -> Option<LogicalTime> {
        self.is_bounded().then(|| now.after(*self))
    }
}

impl std::fmt::Display for Timeout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_bounded() {
            write!(f, "{}ms", self.0)
        } else {
            write!(f, "unbounded")
        }
    }
}
