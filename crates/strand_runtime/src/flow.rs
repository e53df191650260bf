//! Flows: ordered chains of execution units within a thread.

use indexmap::IndexSet;
use serde_json::Value;
use strand_core::{FailureClass, FlowKey, ThreadKey, UnitKey};
use strand_plan::EscalationMapping;

use crate::error::Failure;

/// What a flow ended with: its last main-line value or its failure
pub type FlowOutcome = Result<Value, Failure>;

/// Invoked once when a flow completes
pub type FlowCallback = Box<dyn FnOnce(FlowOutcome) + Send>;

/// How a spawned flow runs
#[derive(Default)]
pub struct FlowOptions {
    pub(crate) new_thread: bool,
    pub(crate) thread_local_aware: Option<bool>,
    pub(crate) blocking: bool,
    pub(crate) escalations: Vec<EscalationMapping>,
    pub(crate) callback: Option<FlowCallback>,
}

impl FlowOptions {
    /// Same thread, non-blocking, no handlers, no callback
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the flow in a new thread context
    #[must_use]
    pub fn in_new_thread(mut self) -> Self {
        self.new_thread = true;
        self
    }

    /// Thread-local awareness of the new thread context
    #[must_use]
    pub fn thread_local_aware(mut self, aware: bool) -> Self {
        self.thread_local_aware = Some(aware);
        self
    }

    /// Suspend the spawning unit until this flow completes
    #[must_use]
    pub fn blocking(mut self) -> Self {
        self.blocking = true;
        self
    }

    /// Handle failures of `class` raised in this flow or flows it spawns with `handler`
    #[must_use]
    pub fn handle(mut self, class: impl Into<FailureClass>, handler: impl Into<String>) -> Self {
        self.escalations.push(EscalationMapping::new(class, handler));
        self
    }

    /// Callback fired once with the flow outcome
    #[must_use]
    pub fn on_complete(mut self, callback: impl FnOnce(FlowOutcome) + Send + 'static) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }
}

impl std::fmt::Debug for FlowOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowOptions")
            .field("new_thread", &self.new_thread)
            .field("thread_local_aware", &self.thread_local_aware)
            .field("blocking", &self.blocking)
            .field("escalations", &self.escalations)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

/// Runtime record of a flow
pub(crate) struct FlowState {
    pub(crate) key: FlowKey,
    pub(crate) thread: ThreadKey,
    pub(crate) units: IndexSet<UnitKey>,
    pub(crate) active: usize,
    pub(crate) escalations: Vec<EscalationMapping>,
    /// Handlers of the enclosing flows, nearest first
    pub(crate) outer: Vec<EscalationMapping>,
    /// Enclosing flows, outermost first
    pub(crate) lineage: Vec<FlowKey>,
    /// Handlers already used by the escalation this flow belongs to
    pub(crate) excluded: Vec<String>,
    pub(crate) callback: Option<FlowCallback>,
    /// Unit suspended until this flow completes
    pub(crate) parent: Option<UnitKey>,
    /// Failure this flow was started to handle
    pub(crate) handling: Option<Failure>,
    pub(crate) result: Option<Value>,
    pub(crate) failure: Option<Failure>,
    pub(crate) discarded: bool,
    /// Failure that discarded this flow
    pub(crate) cause: Option<Failure>,
}

impl FlowState {
    pub(crate) fn new(key: FlowKey, thread: ThreadKey) -> Self {
        Self {
            key,
            thread,
            units: IndexSet::new(),
            active: 0,
            escalations: Vec::new(),
            outer: Vec::new(),
            lineage: Vec::new(),
            excluded: Vec::new(),
            callback: None,
            parent: None,
            handling: None,
            result: None,
            failure: None,
            discarded: false,
            cause: None,
        }
    }

    /// Nest this flow inside `enclosing`
    pub(crate) fn inherit(&mut self, enclosing: &FlowState) {
        self.outer = enclosing.handler_chain();
        self.lineage = enclosing.lineage.clone();
        self.lineage.push(enclosing.key);
        self.excluded = enclosing.excluded.clone();
    }

    /// Take the place of `failing`, which escalated to `handler`
    pub(crate) fn succeed(&mut self, failing: &FlowState, handler: &str) {
        self.outer = failing.handler_chain();
        self.lineage = failing.lineage.clone();
        self.excluded = failing.excluded.clone();
        self.excluded.push(handler.to_string());
    }

    /// Flow-level handlers in lookup order
    pub(crate) fn handler_chain(&self) -> Vec<EscalationMapping> {
        self.escalations.iter().chain(&self.outer).cloned().collect()
    }

    pub(crate) fn descends_from(&self, flow: FlowKey) -> bool {
        self.lineage.contains(&flow)
    }

    /// Outcome once no unit is active; `fallback` explains a discard without a failure of its own
    pub(crate) fn outcome(&mut self, fallback: impl FnOnce() -> Failure) -> FlowOutcome {
        match (self.failure.clone(), self.discarded) {
            (Some(failure), _) => Err(failure),
            (None, true) => Err(fallback()),
            (None, false) => Ok(self.result.take().unwrap_or(Value::Null)),
        }
    }
}
