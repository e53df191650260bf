//! Resource container state machine.
//!
//! A container manages one instance of one resource inside a scope. It does
//! no I/O: the process layer asks it what to do (source, wait, fail) and
//! performs the resulting work outside the process lock.
//!
//! ```text
//! UNSOURCED -> SOURCING -> READY <-> ASYNC_OPERATION_PENDING
//!                 |          |
//!                 v          v
//!               FAILED    RECYCLING -> UNLOADED
//! ```
//!
//! Every sourcing attempt carries a number. Answers and expiries for an
//! older attempt are ignored, which is what makes a provide that arrives
//! after a timeout harmless.

use indexmap::IndexMap;
use std::sync::Arc;
use strand_core::{ContainerKey, Timeout, UnitKey};
use strand_plan::{Capabilities, ResourceTemplate, Scope};

use crate::error::Failure;
use crate::monitor::DeadlineId;
use crate::pool::{Instance, PooledInstance};

/// Container state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    /// Nothing requested yet
    Unsourced,
    /// Source invoked (or waiting for prerequisites)
    Sourcing,
    /// Instance available
    Ready,
    /// Instance busy with an asynchronous operation
    AsyncOperationPending,
    /// Instance being handed back
    Recycling,
    /// Scope ended
    Unloaded,
    /// Sourcing or an operation failed
    Failed,
}

/// Something parked on a container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Waiter {
    /// A unit waiting for its dependency
    Unit(UnitKey),
    /// A container waiting for its prerequisite
    Container(ContainerKey),
}

/// Outcome of asking a container for its instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    /// Caller must invoke the source for this attempt
    Source {
        /// Attempt number
        attempt: u64,
    },
    /// Served from the pool
    Pooled,
    /// Already sourcing, ready or busy; nothing to do
    InFlight,
    /// Container cannot serve any more
    Closed,
}

/// Whether a dependent can proceed
#[derive(Debug, Clone, PartialEq)]
pub enum Readiness {
    /// Instance is available
    Ready,
    /// Dependent was parked
    Parked,
    /// Container failed
    Failed(Failure),
}

/// A state change that releases waiters
#[derive(Debug, Default)]
pub struct Resolution {
    /// Waiters to wake (or fail)
    pub waiters: Vec<Waiter>,
    /// Failure to deliver, if the container failed
    pub failure: Option<Failure>,
    /// Deadlines that no longer apply
    pub cancelled: Vec<DeadlineId>,
}

/// What to do with the instance of a released container
#[derive(Debug)]
pub struct Release {
    /// Instance with its reuse count
    pub instance: PooledInstance,
    /// Whether it may be offered back to the pool
    pub reusable: bool,
}

/// One resource instance inside a scope
#[derive(Debug)]
pub struct Container {
    key: ContainerKey,
    name: Arc<str>,
    scope: Scope,
    capabilities: Capabilities,
    timeout: Timeout,
    prerequisites: Vec<ContainerKey>,
    state: ContainerState,
    instance: Option<Instance>,
    reuse_count: u64,
    attempt: u64,
    sourcing_deadline: Option<DeadlineId>,
    awaiting_prerequisites: usize,
    operations: IndexMap<u64, Option<DeadlineId>>,
    waiters: Vec<Waiter>,
    failure: Option<Failure>,
    invalidated: bool,
}

impl Container {
    /// Create an unsourced container for a resource
    #[must_use]
    pub fn new(key: ContainerKey, template: &ResourceTemplate) -> Self {
        Self {
            key,
            name: Arc::from(template.name.as_str()),
            scope: template.scope,
            capabilities: template.capabilities(),
            timeout: template.timeout,
            prerequisites: Vec::new(),
            state: ContainerState::Unsourced,
            instance: None,
            reuse_count: 0,
            attempt: 0,
            sourcing_deadline: None,
            awaiting_prerequisites: 0,
            operations: IndexMap::new(),
            waiters: Vec::new(),
            failure: None,
            invalidated: false,
        }
    }

    /// Container key
    #[must_use]
    pub fn key(&self) -> ContainerKey {
        self.key
    }

    /// Resource name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Scope of the resource
    #[must_use]
    pub fn scope(&self) -> Scope {
        self.scope
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> ContainerState {
        self.state
    }

    /// Configured sourcing timeout
    #[must_use]
    pub fn timeout(&self) -> Timeout {
        self.timeout
    }

    /// Current sourcing attempt number
    #[must_use]
    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    /// Times the held instance was reused from a pool
    #[must_use]
    pub fn reuse_count(&self) -> u64 {
        self.reuse_count
    }

    /// Instance, only while ready
    #[must_use]
    pub fn instance(&self) -> Option<&Instance> {
        match self.state {
            ContainerState::Ready => self.instance.as_ref(),
            _ => None,
        }
    }

    /// Prerequisite containers
    #[must_use]
    pub fn prerequisites(&self) -> &[ContainerKey] {
        &self.prerequisites
    }

    /// Record the prerequisite containers
    pub fn set_prerequisites(&mut self, prerequisites: Vec<ContainerKey>) {
        self.prerequisites = prerequisites;
    }

    /// Ask for the instance
    ///
    /// With a pool, an idle instance is taken before falling back to the source.
    pub fn request(&mut self, pooled: Option<PooledInstance>) -> Request {
        match self.state {
            ContainerState::Unsourced => {
                if let Some(pooled) = pooled {
                    self.instance = Some(pooled.instance);
                    self.reuse_count = pooled.reuse_count + 1;
                    self.state = ContainerState::Ready;
                    return Request::Pooled;
                }
                self.attempt += 1;
                self.state = ContainerState::Sourcing;
                Request::Source {
                    attempt: self.attempt,
                }
            }
            ContainerState::Sourcing | ContainerState::Ready | ContainerState::AsyncOperationPending => {
                Request::InFlight
            }
            ContainerState::Failed | ContainerState::Recycling | ContainerState::Unloaded => Request::Closed,
        }
    }

    /// Note the deadline registered for the current attempt
    pub fn set_sourcing_deadline(&mut self, deadline: DeadlineId) {
        self.sourcing_deadline = Some(deadline);
    }

    /// Note how many prerequisites must become ready before sourcing
    pub fn await_prerequisites(&mut self, count: usize) {
        self.awaiting_prerequisites = count;
    }

    /// A prerequisite became ready; true when the source can now be invoked
    pub fn prerequisite_ready(&mut self) -> bool {
        if self.state != ContainerState::Sourcing || self.awaiting_prerequisites == 0 {
            return false;
        }
        self.awaiting_prerequisites -= 1;
        self.awaiting_prerequisites == 0
    }

    /// Check readiness for a dependent, parking it if needed
    pub fn await_ready(&mut self, waiter: Waiter) -> Readiness {
        match self.state {
            ContainerState::Ready => Readiness::Ready,
            ContainerState::Unsourced | ContainerState::Sourcing | ContainerState::AsyncOperationPending => {
                self.waiters.push(waiter);
                Readiness::Parked
            }
            ContainerState::Failed => Readiness::Failed(self.stored_failure()),
            ContainerState::Recycling | ContainerState::Unloaded => Readiness::Failed(Failure::DependencyResolution {
                resource: self.name.to_string(),
                reason: "container already unloaded".to_string(),
            }),
        }
    }

    /// Source answered synchronously that it will provide later
    ///
    /// Synchronous-only resources fail here.
    pub fn pending(&mut self, attempt: u64) -> Option<Resolution> {
        if !self.is_current(attempt) || self.capabilities.supports_async {
            return None;
        }
        self.fail_with(Failure::DependencyResolution {
            resource: self.name.to_string(),
            reason: "source answered asynchronously for a synchronous resource".to_string(),
        })
    }

    /// Instance provided for an attempt
    pub fn provide(&mut self, attempt: u64, instance: Instance) -> Option<Resolution> {
        if !self.is_current(attempt) {
            return None;
        }
        self.instance = Some(instance);
        self.reuse_count = 0;
        self.state = ContainerState::Ready;
        Some(Resolution {
            waiters: std::mem::take(&mut self.waiters),
            failure: None,
            cancelled: self.sourcing_deadline.take().into_iter().collect(),
        })
    }

    /// Source failed for an attempt
    pub fn fail(&mut self, attempt: u64, cause: &Failure) -> Option<Resolution> {
        if !self.is_current(attempt) {
            return None;
        }
        let failure = match cause {
            Failure::DependencyResolution { .. } | Failure::DependencyTimeout { .. } => cause.clone(),
            other => Failure::DependencyResolution {
                resource: self.name.to_string(),
                reason: other.to_string(),
            },
        };
        self.fail_with(failure)
    }

    /// Sourcing deadline expired for an attempt
    pub fn expire(&mut self, attempt: u64) -> Option<Resolution> {
        if !self.is_current(attempt) {
            return None;
        }
        self.sourcing_deadline = None;
        self.fail_with(Failure::DependencyTimeout {
            resource: self.name.to_string(),
            timeout: self.timeout,
        })
    }

    /// A prerequisite failed before this container could be sourced
    pub fn prerequisite_failed(&mut self, cause: &Failure) -> Option<Resolution> {
        if self.state != ContainerState::Sourcing && self.state != ContainerState::Unsourced {
            return None;
        }
        self.fail_with(Failure::DependencyResolution {
            resource: self.name.to_string(),
            reason: format!("prerequisite failed: {}", cause),
        })
    }

    /// Start an asynchronous operation on the instance
    pub fn begin_operation(&mut self, operation: u64) -> bool {
        match self.state {
            ContainerState::Ready | ContainerState::AsyncOperationPending => {
                self.state = ContainerState::AsyncOperationPending;
                self.operations.insert(operation, None);
                true
            }
            _ => false,
        }
    }

    /// Note the deadline registered for an operation
    pub fn set_operation_deadline(&mut self, operation: u64, deadline: DeadlineId) {
        if let Some(slot) = self.operations.get_mut(&operation) {
            *slot = Some(deadline);
        }
    }

    /// Operations still outstanding
    #[must_use]
    pub fn pending_operations(&self) -> usize {
        self.operations.len()
    }

    /// Operation finished; dependents are released when none remain
    pub fn complete_operation(&mut self, operation: u64, result: Result<(), Failure>) -> Option<Resolution> {
        let deadline = self.operations.shift_remove(&operation)?;
        if self.state != ContainerState::AsyncOperationPending {
            return None;
        }
        let mut resolution = match result {
            Err(cause) => self.fail_with(cause)?,
            Ok(()) if self.operations.is_empty() => {
                self.state = ContainerState::Ready;
                Resolution {
                    waiters: std::mem::take(&mut self.waiters),
                    ..Resolution::default()
                }
            }
            Ok(()) => Resolution::default(),
        };
        resolution.cancelled.extend(deadline);
        Some(resolution)
    }

    /// Operation deadline expired
    pub fn expire_operation(&mut self, operation: u64, timeout: Timeout) -> Option<Resolution> {
        self.operations.shift_remove(&operation)?;
        if self.state != ContainerState::AsyncOperationPending {
            return None;
        }
        self.fail_with(Failure::AsynchronousOperationTimeout {
            operation: format!("{} operation {}", self.name, operation),
            timeout,
        })
    }

    /// Mark the instance unfit for reuse
    pub fn invalidate(&mut self) {
        self.invalidated = true;
    }

    /// Whether the instance was invalidated
    #[must_use]
    pub fn is_invalidated(&self) -> bool {
        self.invalidated
    }

    /// Scope ended: hand the instance back
    ///
    /// Returns the instance to recycle and every deadline still registered.
    pub fn release(&mut self) -> (Option<Release>, Vec<DeadlineId>) {
        let mut cancelled: Vec<DeadlineId> = self.sourcing_deadline.take().into_iter().collect();
        cancelled.extend(self.operations.drain(..).filter_map(|(_, d)| d));

        let reusable = self.state == ContainerState::Ready && !self.invalidated;
        let release = self.instance.take().map(|instance| Release {
            instance: PooledInstance {
                instance,
                reuse_count: self.reuse_count,
            },
            reusable: reusable && self.capabilities.supports_pooling,
        });
        self.state = ContainerState::Recycling;
        (release, cancelled)
    }

    /// Finish unloading
    pub fn unload(&mut self) {
        self.waiters.clear();
        self.state = ContainerState::Unloaded;
    }

    fn is_current(&self, attempt: u64) -> bool {
        self.state == ContainerState::Sourcing && self.attempt == attempt
    }

    fn stored_failure(&self) -> Failure {
        self.failure.clone().unwrap_or_else(|| Failure::DependencyResolution {
            resource: self.name.to_string(),
            reason: "container failed".to_string(),
        })
    }

    fn fail_with(&mut self, failure: Failure) -> Option<Resolution> {
        self.state = ContainerState::Failed;
        self.failure = Some(failure.clone());
        let mut cancelled: Vec<DeadlineId> = self.sourcing_deadline.take().into_iter().collect();
        cancelled.extend(self.operations.drain(..).filter_map(|(_, d)| d));
        Some(Resolution {
            waiters: std::mem::take(&mut self.waiters),
            failure: Some(failure),
            cancelled,
        })
    }
}
