//! Resource sources.
//!
//! A source produces instances for one resource. It may answer at once or
//! hand back [`Sourcing::Pending`] and finish later through the
//! [`SourceCompletion`] it was given. Late answers (after a timeout or after
//! the container went away) are ignored.

use std::sync::{Arc, Weak};
use strand_core::ContainerKey;

use crate::error::Failure;
use crate::pool::Instance;
use crate::process::{Message, ProcessCore};

/// Immediate answer of a source
pub enum Sourcing {
    /// Instance available now
    Ready(Instance),
    /// Instance will be provided through the completion handle
    Pending,
}

impl std::fmt::Debug for Sourcing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ready(_) => write!(f, "Ready(..)"),
            Self::Pending => write!(f, "Pending"),
        }
    }
}

/// Whether a released instance may go back to its pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recycle {
    /// Return to the pool
    Reuse,
    /// Drop it
    Discard,
}

/// Request handed to a source
pub struct SourceRequest {
    /// Resource being sourced
    pub resource: String,
    /// Prerequisite instances, in declaration order
    pub prerequisites: Vec<(String, Instance)>,
    /// Handle for finishing asynchronously
    pub completion: SourceCompletion,
}

impl SourceRequest {
    /// Prerequisite instance by name, downcast to `T`
    #[must_use]
    pub fn prerequisite<T: Send + Sync + 'static>(&self, name: &str) -> Option<Arc<T>> {
        self.prerequisites
            .iter()
            .find(|(n, _)| n == name)
            .and_then(|(_, instance)| Arc::clone(instance).downcast::<T>().ok())
    }
}

/// Handle used by a source to finish a pending request
#[derive(Clone)]
pub struct SourceCompletion {
    process: Weak<ProcessCore>,
    container: ContainerKey,
    attempt: u64,
}

impl SourceCompletion {
    pub(crate) fn new(process: Weak<ProcessCore>, container: ContainerKey, attempt: u64) -> Self {
        Self {
            process,
            container,
            attempt,
        }
    }

    /// Provide the instance
    pub fn provide(&self, instance: Instance) {
        self.deliver(Message::Provided {
            container: self.container,
            attempt: self.attempt,
            instance,
        });
    }

    /// Signal that sourcing failed
    pub fn fail(&self, failure: Failure) {
        self.deliver(Message::SourceFailed {
            container: self.container,
            attempt: self.attempt,
            failure,
        });
    }

    /// Whether the owning process has already been released
    #[must_use]
    pub fn is_abandoned(&self) -> bool {
        self.process.strong_count() == 0
    }

    fn deliver(&self, message: Message) {
        match self.process.upgrade() {
            Some(process) => process.deliver(message),
            None => tracing::debug!(container = %self.container, "late source answer dropped"),
        }
    }
}

/// Produces instances of one resource
pub trait ResourceSource: Send + Sync {
    /// Start sourcing an instance
    ///
    /// # Errors
    ///
    /// Returns the failure that dependents of the resource will see
    fn source(&self, request: SourceRequest) -> Result<Sourcing, Failure>;

    /// Decide whether a released instance is fit for reuse
    fn recycle(&self, _instance: &Instance) -> Recycle {
        Recycle::Reuse
    }

    /// Object handed to administration functions that administer this resource
    fn extension(&self, instance: &Instance) -> Option<Instance> {
        Some(Arc::clone(instance))
    }
}

impl<F> ResourceSource for F
where
    F: Fn(SourceRequest) -> Result<Sourcing, Failure> + Send + Sync,
{
    fn source(&self, request: SourceRequest) -> Result<Sourcing, Failure> {
        self(request)
    }
}

/// Source that builds every instance synchronously from a constructor
pub struct ConstructSource<F> {
    construct: F,
}

impl<F, T> ConstructSource<F>
where
    F: Fn() -> T + Send + Sync,
    T: Send + Sync + 'static,
{
    /// Wrap a constructor
    pub fn new(construct: F) -> Self {
        Self { construct }
    }
}

impl<F, T> ResourceSource for ConstructSource<F>
where
    F: Fn() -> T + Send + Sync,
    T: Send + Sync + 'static,
{
    fn source(&self, _request: SourceRequest) -> Result<Sourcing, Failure> {
        Ok(Sourcing::Ready(Arc::new((self.construct)())))
    }
}
