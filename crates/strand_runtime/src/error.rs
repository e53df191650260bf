//! Failure taxonomy and runtime errors.
//!
//! [`Failure`] is what an execution unit can end with; it always travels
//! through the escalation procedure. [`RuntimeError`] is returned by the
//! office API itself (bad graph, unknown function, stopped team) and never
//! enters a process.

use serde_json::{Value, json};
use strand_core::{CoreError, FailureClass, Timeout};
use strand_plan::ValidationError;

use crate::team::TeamError;

/// Class of dependency timeouts
pub const DEPENDENCY_TIMEOUT: &str = "strand.dependency.timeout";
/// Class of dependency resolution failures
pub const DEPENDENCY_RESOLUTION: &str = "strand.dependency.resolution";
/// Class of asynchronous operation timeouts
pub const ASYNC_TIMEOUT: &str = "strand.async.timeout";
/// Class of failures nobody handled
pub const UNHANDLED: &str = "strand.escalation.unhandled";
/// Class of panics raised by a function body or source
pub const PANIC: &str = "strand.panic";
/// Class reported by flows discarded without a failure of their own
pub const DISCARDED: &str = "strand.flow.discarded";
/// Class raised when a team refuses a unit
pub const TEAM_REJECTED: &str = "strand.team.rejected";

/// Result of a function body
pub type UnitResult = Result<Value, Failure>;

/// A failure raised by or injected into an execution unit
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Failure {
    /// A resource container deadline expired
    #[error("dependency {resource} timed out after {timeout}")]
    DependencyTimeout {
        /// Resource name
        resource: String,
        /// Configured timeout
        timeout: Timeout,
    },

    /// The source of a resource signalled failure
    #[error("dependency {resource} could not be resolved: {reason}")]
    DependencyResolution {
        /// Resource name
        resource: String,
        /// Source message
        reason: String,
    },

    /// An asynchronous operation did not complete in time
    #[error("asynchronous operation {operation} timed out after {timeout}")]
    AsynchronousOperationTimeout {
        /// Operation description
        operation: String,
        /// Configured timeout
        timeout: Timeout,
    },

    /// No handler matched; carries the failure that reached the process root
    #[error("no escalation handler for: {cause}")]
    EscalationHandlerNotFound {
        /// Unhandled failure
        cause: Box<Failure>,
    },

    /// The function body raised
    #[error("{function} failed [{class}]: {message}")]
    FunctionExecution {
        /// Function that raised (filled in by the runtime)
        function: String,
        /// Failure class used for handler matching
        class: FailureClass,
        /// Message
        message: String,
    },
}

impl Failure {
    /// Raise an application failure of the given class
    #[must_use]
    pub fn raise(class: impl Into<FailureClass>, message: impl Into<String>) -> Self {
        Self::FunctionExecution {
            function: String::new(),
            class: class.into(),
            message: message.into(),
        }
    }

    /// Class used for handler matching
    #[must_use]
    pub fn class(&self) -> FailureClass {
        match self {
            Self::DependencyTimeout { .. } => FailureClass::new(DEPENDENCY_TIMEOUT),
            Self::DependencyResolution { .. } => FailureClass::new(DEPENDENCY_RESOLUTION),
            Self::AsynchronousOperationTimeout { .. } => FailureClass::new(ASYNC_TIMEOUT),
            Self::EscalationHandlerNotFound { .. } => FailureClass::new(UNHANDLED),
            Self::FunctionExecution { class, .. } => class.clone(),
        }
    }

    /// Innermost failure, unwrapping unhandled-escalation wrappers
    #[must_use]
    pub fn root_cause(&self) -> &Failure {
        match self {
            Self::EscalationHandlerNotFound { cause } => cause.root_cause(),
            other => other,
        }
    }

    /// Attribute a function failure to the function that raised it
    #[must_use]
    pub(crate) fn attributed_to(self, name: &str) -> Self {
        match self {
            Self::FunctionExecution {
                function,
                class,
                message,
            } if function.is_empty() => Self::FunctionExecution {
                function: name.to_string(),
                class,
                message,
            },
            other => other,
        }
    }

    /// JSON description handed to escalation handlers as their parameter
    #[must_use]
    pub fn to_value(&self) -> Value {
        json!({
            "class": self.class().as_str(),
            "message": self.to_string(),
        })
    }
}

/// Errors returned by the office API
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// The graph failed validation
    #[error("invalid office graph: {}", summarize(.0))]
    InvalidGraph(Vec<ValidationError>),

    /// The graph has no function of that name
    #[error("unknown function: {name}")]
    UnknownFunction {
        /// Requested function
        name: String,
    },

    /// A function template has no body bound
    #[error("no body bound for function {name}")]
    UnboundFunction {
        /// Function name
        name: String,
    },

    /// A resource template has no source bound
    #[error("no source {source_key} bound for resource {resource}")]
    UnboundSource {
        /// Resource name
        resource: String,
        /// Source key it expects
        source_key: String,
    },

    /// A team could not be started or used
    #[error(transparent)]
    Team(#[from] TeamError),

    /// Core error (configuration loading)
    #[error(transparent)]
    Core(#[from] CoreError),

    /// The office has been shut down
    #[error("office is shut down")]
    ShutDown,
}

fn summarize(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
