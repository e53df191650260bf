//! Thread contexts.

use indexmap::{IndexMap, IndexSet};
use serde_json::Value;
use std::thread::ThreadId;
use strand_core::{ContainerKey, FlowKey, ThreadKey};

/// Escalation level of a thread context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EscalationLevel {
    /// Normal execution
    #[default]
    None,
    /// A failure was raised; its handler has not started yet
    Escalating,
    /// The handler flow is running
    EscalationHandling,
}

/// Runtime record of a thread context
#[derive(Debug)]
pub(crate) struct ThreadState {
    pub(crate) key: ThreadKey,
    pub(crate) thread_local_aware: bool,
    /// Worker that last ran a unit of this thread
    pub(crate) last_worker: Option<ThreadId>,
    pub(crate) flows: IndexSet<FlowKey>,
    /// Thread-scoped containers by resource name
    pub(crate) containers: IndexMap<String, ContainerKey>,
    pub(crate) level: EscalationLevel,
    /// Handler flows that have not completed yet
    pub(crate) handlers: IndexSet<FlowKey>,
    /// Flow whose value becomes the thread's result
    pub(crate) entry_flow: Option<FlowKey>,
    pub(crate) result: Option<Value>,
}

impl ThreadState {
    pub(crate) fn new(key: ThreadKey, thread_local_aware: bool) -> Self {
        Self {
            key,
            thread_local_aware,
            last_worker: None,
            flows: IndexSet::new(),
            containers: IndexMap::new(),
            level: EscalationLevel::None,
            handlers: IndexSet::new(),
            entry_flow: None,
            result: None,
        }
    }

    /// Worker a new unit of this thread should prefer
    pub(crate) fn affinity(&self) -> Option<ThreadId> {
        if self.thread_local_aware {
            self.last_worker
        } else {
            None
        }
    }

    /// Enter an escalation handled by `flow`
    pub(crate) fn begin_escalation(&mut self, flow: FlowKey) {
        self.handlers.insert(flow);
        self.level = EscalationLevel::Escalating;
    }

    /// A unit of `flow` is about to run
    pub(crate) fn start_handling(&mut self, flow: FlowKey) {
        if self.level == EscalationLevel::Escalating && self.handlers.contains(&flow) {
            self.level = EscalationLevel::EscalationHandling;
        }
    }

    /// Forget a completed flow as a handler; true if it was one.
    /// The level drops back to `None` once no handler is outstanding.
    pub(crate) fn end_escalation(&mut self, flow: FlowKey) -> bool {
        if !self.handlers.shift_remove(&flow) {
            return false;
        }
        if self.handlers.is_empty() {
            self.level = EscalationLevel::None;
        }
        true
    }

    /// Whether the thread has nothing left to run
    pub(crate) fn is_idle(&self) -> bool {
        self.flows.is_empty() && self.level == EscalationLevel::None
    }
}
