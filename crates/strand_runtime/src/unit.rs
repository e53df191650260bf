//! Execution units and the context their bodies run with.
//!
//! A unit is one invocation of a function (or of an administration step)
//! inside a flow. Its body runs outside the process lock and talks to the
//! runtime only through [`UnitContext`]: reading dependencies, choosing what
//! comes next, spawning flows and starting asynchronous work. Spawns and
//! continuations are collected and applied when the body returns.

use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::thread::ThreadId;
use strand_core::{ContainerKey, FlowKey, ProcessId, ThreadKey, Timeout, UnitKey};

use crate::administration::{Step, UnitKind};
use crate::error::{Failure, UnitResult};
use crate::flow::FlowOptions;
use crate::monitor::DeadlineId;
use crate::pool::Instance;
use crate::process::{Effects, Message, ProcessCore};
use crate::source::ResourceSource;
use crate::team::WorkerContext;

/// Class raised when a body refers to a function the office does not know
pub const UNKNOWN_FUNCTION: &str = "strand.function.unknown";
/// Class raised when a parameter cannot be decoded
pub const BAD_PARAMETER: &str = "strand.parameter";

/// Lifecycle of an execution unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitPhase {
    /// Created, dependencies not yet checked
    Created,
    /// Parked on at least one container
    AwaitingDependencies,
    /// Dispatched to its team
    Runnable,
    /// Body executing
    Running,
    /// Body returned; waiting for blocking flows or asynchronous work
    Suspended,
    /// Finished successfully
    Complete,
    /// Finished with a failure
    Escalated,
    /// Dropped before running because its flow was discarded
    Suppressed,
}

/// Function body
pub trait UnitFunction: Send + Sync {
    /// Run the body
    ///
    /// # Errors
    ///
    /// The returned failure is escalated
    fn execute(&self, ctx: &mut UnitContext<'_>) -> UnitResult;
}

impl<F> UnitFunction for F
where
    F: Fn(&mut UnitContext<'_>) -> UnitResult + Send + Sync,
{
    fn execute(&self, ctx: &mut UnitContext<'_>) -> UnitResult {
        self(ctx)
    }
}

/// Runtime record of a unit
#[derive(Debug)]
pub(crate) struct UnitState {
    pub(crate) key: UnitKey,
    pub(crate) flow: FlowKey,
    pub(crate) thread: ThreadKey,
    pub(crate) kind: UnitKind,
    pub(crate) function: Arc<str>,
    pub(crate) administered: Option<Arc<str>>,
    pub(crate) phase: UnitPhase,
    pub(crate) parameter: Value,
    pub(crate) dependencies: Vec<(String, ContainerKey)>,
    /// Unit-scoped containers released with the unit
    pub(crate) owned: Vec<ContainerKey>,
    pub(crate) awaiting: usize,
    pub(crate) continuation: VecDeque<Step>,
    pub(crate) mainline: bool,
    pub(crate) next: Option<(String, Value)>,
    pub(crate) blocking_children: usize,
    pub(crate) async_flows: IndexMap<u64, Option<DeadlineId>>,
    pub(crate) async_failure: Option<Failure>,
    pub(crate) result: Option<Value>,
}

impl UnitState {
    pub(crate) fn new(key: UnitKey, flow: FlowKey, thread: ThreadKey, kind: UnitKind, function: Arc<str>) -> Self {
        Self {
            key,
            flow,
            thread,
            kind,
            function,
            administered: None,
            phase: UnitPhase::Created,
            parameter: Value::Null,
            dependencies: Vec::new(),
            owned: Vec::new(),
            awaiting: 0,
            continuation: VecDeque::new(),
            mainline: false,
            next: None,
            blocking_children: 0,
            async_flows: IndexMap::new(),
            async_failure: None,
            result: None,
        }
    }

    /// Not yet started, so it can be suppressed
    pub(crate) fn is_pending(&self) -> bool {
        matches!(
            self.phase,
            UnitPhase::Created | UnitPhase::AwaitingDependencies | UnitPhase::Runnable
        )
    }

    /// Body has returned and nothing is outstanding
    pub(crate) fn is_settled(&self) -> bool {
        self.blocking_children == 0 && self.async_flows.is_empty()
    }
}

/// Everything a body needs, captured under the process lock
pub(crate) struct Invocation {
    pub(crate) body: Arc<dyn UnitFunction>,
    pub(crate) function: Arc<str>,
    pub(crate) kind: UnitKind,
    pub(crate) administered: Option<Arc<str>>,
    pub(crate) parameter: Value,
    pub(crate) dependencies: Vec<(String, ContainerKey, Instance)>,
    pub(crate) extensions: Vec<(Arc<dyn ResourceSource>, Instance)>,
    pub(crate) failure: Option<Failure>,
}

/// Work requested by a body, applied when it returns
pub(crate) enum UnitRequest {
    Next { function: String, parameter: Value },
    Parallel { function: String, parameter: Value },
    Flow { function: String, parameter: Value, options: FlowOptions },
    Invalidate(ContainerKey),
}

/// Handle completing an asynchronous flow started by a unit
///
/// The unit does not complete until every such flow is completed, failed
/// or timed out.
#[derive(Debug)]
pub struct AsynchronousFlow {
    process: Weak<ProcessCore>,
    unit: UnitKey,
    operation: u64,
}

impl AsynchronousFlow {
    /// The asynchronous work succeeded
    pub fn complete(self) {
        self.finish(Ok(()));
    }

    /// The asynchronous work failed; the unit escalates `failure`
    pub fn fail(self, failure: Failure) {
        self.finish(Err(failure));
    }

    fn finish(self, result: Result<(), Failure>) {
        if let Some(process) = self.process.upgrade() {
            process.deliver(Message::AsyncFlowCompleted {
                unit: self.unit,
                operation: self.operation,
                result,
            });
        }
    }
}

/// Handle completing an asynchronous operation on a dependency instance
///
/// While outstanding, units that have not started yet and depend on the
/// same container are parked.
#[derive(Debug)]
pub struct ContainerOperation {
    process: Weak<ProcessCore>,
    container: ContainerKey,
    operation: u64,
}

impl ContainerOperation {
    /// The operation succeeded; parked dependents may proceed
    pub fn complete(self) {
        self.finish(Ok(()));
    }

    /// The operation failed; the container fails and parked dependents with it
    pub fn fail(self, failure: Failure) {
        self.finish(Err(failure));
    }

    fn finish(self, result: Result<(), Failure>) {
        if let Some(process) = self.process.upgrade() {
            process.deliver(Message::OperationCompleted {
                container: self.container,
                operation: self.operation,
                result,
            });
        }
    }
}

/// Context handed to a running body
pub struct UnitContext<'a> {
    process: &'a Arc<ProcessCore>,
    unit: UnitKey,
    worker: &'a WorkerContext,
    invocation: Invocation,
    requests: Vec<UnitRequest>,
    effects: Effects,
}

impl<'a> UnitContext<'a> {
    pub(crate) fn new(
        process: &'a Arc<ProcessCore>,
        unit: UnitKey,
        worker: &'a WorkerContext,
        invocation: Invocation,
    ) -> Self {
        Self {
            process,
            unit,
            worker,
            invocation,
            requests: Vec::new(),
            effects: Effects::default(),
        }
    }

    /// Owning process
    #[must_use]
    pub fn process_id(&self) -> ProcessId {
        self.process.id()
    }

    /// Function this unit invokes
    #[must_use]
    pub fn function(&self) -> &str {
        &self.invocation.function
    }

    /// Function, duty or governance
    #[must_use]
    pub fn kind(&self) -> UnitKind {
        self.invocation.kind
    }

    /// For administration steps, the function being administered
    #[must_use]
    pub fn administered(&self) -> Option<&str> {
        self.invocation.administered.as_deref()
    }

    /// Input parameter
    #[must_use]
    pub fn parameter(&self) -> &Value {
        &self.invocation.parameter
    }

    /// Input parameter decoded as `T`
    ///
    /// # Errors
    ///
    /// Returns a `strand.parameter` failure if the value does not decode
    pub fn parameter_as<T: DeserializeOwned>(&self) -> Result<T, Failure> {
        serde_json::from_value(self.invocation.parameter.clone())
            .map_err(|e| Failure::raise(BAD_PARAMETER, e.to_string()))
    }

    /// Failure being handled, when running in an escalation handler flow
    #[must_use]
    pub fn failure(&self) -> Option<&Failure> {
        self.invocation.failure.as_ref()
    }

    /// Number of dependencies
    #[must_use]
    pub fn dependency_count(&self) -> usize {
        self.invocation.dependencies.len()
    }

    /// Dependency by declaration index
    ///
    /// # Errors
    ///
    /// Returns a resolution failure if the index is out of range or the
    /// instance is not a `T`
    pub fn dependency<T: Send + Sync + 'static>(&self, index: usize) -> Result<Arc<T>, Failure> {
        let (name, _, instance) = self.invocation.dependencies.get(index).ok_or_else(|| {
            Failure::DependencyResolution {
                resource: format!("#{}", index),
                reason: format!("{} declares {} dependencies", self.function(), self.dependency_count()),
            }
        })?;
        downcast(name, instance)
    }

    /// Dependency by resource name
    ///
    /// # Errors
    ///
    /// Returns a resolution failure if the unit has no such dependency or
    /// the instance is not a `T`
    pub fn dependency_named<T: Send + Sync + 'static>(&self, name: &str) -> Result<Arc<T>, Failure> {
        let (name, _, instance) = self
            .invocation
            .dependencies
            .iter()
            .find(|(n, _, _)| n == name)
            .ok_or_else(|| Failure::DependencyResolution {
                resource: name.to_string(),
                reason: format!("not a dependency of {}", self.function()),
            })?;
        downcast(name, instance)
    }

    /// Extension interfaces of administered resources, in declaration order
    #[must_use]
    pub fn extensions(&self) -> Vec<Instance> {
        self.invocation
            .extensions
            .iter()
            .filter_map(|(source, instance)| source.extension(instance))
            .collect()
    }

    /// Extension interface by index, downcast to `T`
    #[must_use]
    pub fn extension<T: Send + Sync + 'static>(&self, index: usize) -> Option<Arc<T>> {
        let (source, instance) = self.invocation.extensions.get(index)?;
        source.extension(instance)?.downcast::<T>().ok()
    }

    /// Worker running this body
    #[must_use]
    pub fn worker(&self) -> &WorkerContext {
        self.worker
    }

    /// OS thread running this body
    #[must_use]
    pub fn current_thread(&self) -> ThreadId {
        self.worker.thread()
    }

    /// Continue the flow with `function` instead of the template's `next`
    ///
    /// # Errors
    ///
    /// Returns a failure if the office has no such function
    pub fn next(&mut self, function: &str, parameter: Value) -> Result<(), Failure> {
        self.check_function(function)?;
        self.requests.retain(|r| !matches!(r, UnitRequest::Next { .. }));
        self.requests.push(UnitRequest::Next {
            function: function.to_string(),
            parameter,
        });
        Ok(())
    }

    /// Start `function` alongside this unit in the same flow
    ///
    /// # Errors
    ///
    /// Returns a failure if the office has no such function
    pub fn parallel(&mut self, function: &str, parameter: Value) -> Result<(), Failure> {
        self.check_function(function)?;
        self.requests.push(UnitRequest::Parallel {
            function: function.to_string(),
            parameter,
        });
        Ok(())
    }

    /// Start `function` as a new flow
    ///
    /// # Errors
    ///
    /// Returns a failure if the office has no such function
    pub fn spawn_flow(&mut self, function: &str, parameter: Value, options: FlowOptions) -> Result<(), Failure> {
        self.check_function(function)?;
        self.requests.push(UnitRequest::Flow {
            function: function.to_string(),
            parameter,
            options,
        });
        Ok(())
    }

    /// Start asynchronous work this unit must wait for
    ///
    /// The timeout is the function's `async_timeout` or the office default.
    pub fn create_asynchronous_flow(&mut self) -> AsynchronousFlow {
        let operation = self.process.next_operation();
        let effects = self.process.post(Message::AsyncFlowStarted {
            unit: self.unit,
            operation,
        });
        self.effects.merge(effects);
        AsynchronousFlow {
            process: Arc::downgrade(self.process),
            unit: self.unit,
            operation,
        }
    }

    /// Start an asynchronous operation on dependency `index`
    ///
    /// # Errors
    ///
    /// Returns a resolution failure if the index is out of range
    pub fn begin_operation(&mut self, index: usize) -> Result<ContainerOperation, Failure> {
        let container = self.container(index)?;
        let operation = self.process.next_operation();
        let effects = self.process.post(Message::OperationStarted { container, operation });
        self.effects.merge(effects);
        Ok(ContainerOperation {
            process: Arc::downgrade(self.process),
            container,
            operation,
        })
    }

    /// Mark dependency `index` unfit for reuse; it is discarded on release
    ///
    /// # Errors
    ///
    /// Returns a resolution failure if the index is out of range
    pub fn invalidate(&mut self, index: usize) -> Result<(), Failure> {
        let container = self.container(index)?;
        self.requests.push(UnitRequest::Invalidate(container));
        Ok(())
    }

    /// Default timeout applied to asynchronous flows of this unit
    #[must_use]
    pub fn async_timeout(&self) -> Timeout {
        self.process.runtime().async_timeout(&self.invocation.function)
    }

    pub(crate) fn finish(self) -> (Vec<UnitRequest>, Effects) {
        (self.requests, self.effects)
    }

    fn container(&self, index: usize) -> Result<ContainerKey, Failure> {
        self.invocation
            .dependencies
            .get(index)
            .map(|(_, key, _)| *key)
            .ok_or_else(|| Failure::DependencyResolution {
                resource: format!("#{}", index),
                reason: format!("{} declares {} dependencies", self.function(), self.dependency_count()),
            })
    }

    fn check_function(&self, function: &str) -> Result<(), Failure> {
        if self.process.runtime().graph.function(function).is_some() {
            Ok(())
        } else {
            Err(Failure::raise(UNKNOWN_FUNCTION, format!("no function named {}", function)))
        }
    }
}

fn downcast<T: Send + Sync + 'static>(name: &str, instance: &Instance) -> Result<Arc<T>, Failure> {
    Arc::clone(instance)
        .downcast::<T>()
        .map_err(|_| Failure::DependencyResolution {
            resource: name.to_string(),
            reason: format!("instance is not a {}", std::any::type_name::<T>()),
        })
}
