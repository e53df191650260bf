//! Asset monitor and runtime metrics.
//!
//! The monitor keeps every pending deadline of every process in one ordered
//! table. A tick removes the entries that are due and hands them back to the
//! office, which posts an expiry to each owning process. Entries only hold a
//! weak reference, so a released process never lingers here.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Weak;
use std::sync::atomic::{AtomicU64, Ordering};
use strand_core::{ContainerKey, LogicalTime, UnitKey};

use crate::process::ProcessCore;

/// Handle of a registered deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeadlineId {
    at: LogicalTime,
    seq: u64,
}

impl DeadlineId {
    /// When the deadline falls due
    #[must_use]
    pub fn at(&self) -> LogicalTime {
        self.at
    }
}

/// What a deadline guards
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlineTarget {
    /// A container sourcing attempt
    Sourcing {
        /// Container
        container: ContainerKey,
        /// Attempt number
        attempt: u64,
    },
    /// An asynchronous operation on a container instance
    Operation {
        /// Container
        container: ContainerKey,
        /// Operation number
        operation: u64,
    },
    /// An asynchronous flow started by a unit
    AsyncFlow {
        /// Owning unit
        unit: UnitKey,
        /// Flow number within the unit
        operation: u64,
    },
}

/// A deadline that fell due
#[derive(Debug, Clone)]
pub struct Expired {
    /// Owning process
    pub process: Weak<ProcessCore>,
    /// What expired
    pub target: DeadlineTarget,
}

/// Central deadline table
#[derive(Debug, Default)]
pub struct AssetMonitor {
    entries: Mutex<BTreeMap<DeadlineId, Expired>>,
    seq: AtomicU64,
}

impl AssetMonitor {
    /// Create an empty monitor
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a deadline
    pub fn register(&self, at: LogicalTime, process: Weak<ProcessCore>, target: DeadlineTarget) -> DeadlineId {
        let id = DeadlineId {
            at,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
        };
        self.entries.lock().insert(id, Expired { process, target });
        id
    }

    /// Drop a deadline that no longer applies
    pub fn cancel(&self, id: DeadlineId) -> bool {
        self.entries.lock().remove(&id).is_some()
    }

    /// Remove and return every entry due at `now`, earliest first
    pub fn take_due(&self, now: LogicalTime) -> Vec<Expired> {
        let mut entries = self.entries.lock();
        let boundary = DeadlineId {
            at: LogicalTime::from_millis(now.as_millis().saturating_add(1)),
            seq: 0,
        };
        let remaining = if now.as_millis() == u64::MAX {
            BTreeMap::new()
        } else {
            entries.split_off(&boundary)
        };
        let due = std::mem::replace(&mut *entries, remaining);
        due.into_values().collect()
    }

    /// Deadlines still registered
    #[must_use]
    pub fn pending(&self) -> usize {
        self.entries.lock().len()
    }

    /// Earliest registered deadline
    #[must_use]
    pub fn next_deadline(&self) -> Option<LogicalTime> {
        self.entries.lock().keys().next().map(DeadlineId::at)
    }
}

/// Runtime counters
#[derive(Debug, Default)]
pub struct RuntimeMetrics {
    processes_started: AtomicU64,
    processes_completed: AtomicU64,
    processes_failed: AtomicU64,
    units_executed: AtomicU64,
    units_failed: AtomicU64,
    units_suppressed: AtomicU64,
    escalations: AtomicU64,
    timeouts: AtomicU64,
    ticks: AtomicU64,
}

macro_rules! counter {
    ($(#[$doc:meta])* $record:ident => $field:ident) => {
        $(#[$doc])*
        pub fn $record(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl RuntimeMetrics {
    /// Create zeroed metrics
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    counter!(
        /// Record a process start
        record_process_started => processes_started
    );
    counter!(
        /// Record a process released with a result
        record_process_completed => processes_completed
    );
    counter!(
        /// Record a process released with a failure
        record_process_failed => processes_failed
    );
    counter!(
        /// Record a unit body run
        record_unit_executed => units_executed
    );
    counter!(
        /// Record a unit ending in failure
        record_unit_failed => units_failed
    );
    counter!(
        /// Record a unit suppressed before it ran
        record_unit_suppressed => units_suppressed
    );
    counter!(
        /// Record an escalation
        record_escalation => escalations
    );
    counter!(
        /// Record an expired deadline
        record_timeout => timeouts
    );
    counter!(
        /// Record a monitor tick
        record_tick => ticks
    );

    /// Consistent-enough copy of the counters
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            processes_started: self.processes_started.load(Ordering::Relaxed),
            processes_completed: self.processes_completed.load(Ordering::Relaxed),
            processes_failed: self.processes_failed.load(Ordering::Relaxed),
            units_executed: self.units_executed.load(Ordering::Relaxed),
            units_failed: self.units_failed.load(Ordering::Relaxed),
            units_suppressed: self.units_suppressed.load(Ordering::Relaxed),
            escalations: self.escalations.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            ticks: self.ticks.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time metrics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Processes submitted
    pub processes_started: u64,
    /// Processes released successfully
    pub processes_completed: u64,
    /// Processes released with a failure
    pub processes_failed: u64,
    /// Unit bodies run
    pub units_executed: u64,
    /// Units that failed
    pub units_failed: u64,
    /// Units suppressed by escalation
    pub units_suppressed: u64,
    /// Escalations raised
    pub escalations: u64,
    /// Deadlines expired
    pub timeouts: u64,
    /// Monitor ticks
    pub ticks: u64,
}

impl MetricsSnapshot {
    /// Processes submitted but not yet released
    #[must_use]
    pub fn active_processes(&self) -> u64 {
        self.processes_started
            .saturating_sub(self.processes_completed + self.processes_failed)
    }

    /// Share of executed units that did not fail (0.0 - 1.0)
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        if self.units_executed == 0 {
            return 1.0;
        }
        self.units_executed.saturating_sub(self.units_failed) as f64 / self.units_executed as f64
    }

    /// Share of executed units that failed (0.0 - 1.0)
    #[must_use]
    pub fn failure_rate(&self) -> f64 {
        if self.units_executed == 0 {
            return 0.0;
        }
        self.units_failed as f64 / self.units_executed as f64
    }
}
