//! Processes: the lock, the inbox and the effects performed outside both.
//!
//! All state of a process sits behind one mutex. Anything arriving from
//! outside a transition (a source answering, an operation finishing, a
//! deadline expiring) is pushed onto the process inbox first; whoever holds
//! the lock drains the inbox before letting go, so a poster never blocks on
//! a busy process. Transitions never call user code. They record
//! [`Effects`] instead (dispatches, source invocations, callbacks), which
//! are performed after the lock is released. Pass-through units are run
//! from that same work list rather than recursively, so long synchronous
//! chains do not grow the stack.

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use serde_json::Value;
use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::ThreadId;
use std::time::{Duration, Instant};
use strand_core::{ContainerKey, FailureClass, ProcessId, UnitKey};
use strand_plan::EscalationMapping;
use tracing::{debug, warn};

use crate::container::Release;
use crate::error::{Failure, PANIC};
use crate::flow::{FlowCallback, FlowOutcome};
use crate::monitor::DeadlineTarget;
use crate::office::Runtime;
use crate::pool::{Instance, InstancePool};
use crate::source::{Recycle, ResourceSource, SourceCompletion, SourceRequest, Sourcing};
use crate::state::ProcessState;
use crate::team::{Job, Team, WorkerContext};
use crate::unit::UnitContext;

/// Final result of a process
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessOutcome {
    /// Process
    pub process: ProcessId,
    /// Value of the entry thread, or the failure nobody handled
    pub result: Result<Value, Failure>,
}

impl ProcessOutcome {
    /// Whether the process completed without an unhandled failure
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// Result value, if successful
    #[must_use]
    pub fn value(&self) -> Option<&Value> {
        self.result.as_ref().ok()
    }

    /// Failure, if the process failed
    #[must_use]
    pub fn failure(&self) -> Option<&Failure> {
        self.result.as_ref().err()
    }
}

/// Invoked once when a process is released
pub type ProcessCallback = Box<dyn FnOnce(ProcessOutcome) + Send>;

/// Options for submitting a process
#[derive(Default)]
pub struct ProcessOptions {
    pub(crate) thread_local_aware: Option<bool>,
    pub(crate) escalations: Vec<EscalationMapping>,
    pub(crate) callback: Option<ProcessCallback>,
}

impl ProcessOptions {
    /// Office defaults, no handlers, no callback
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Thread-local awareness of the entry thread
    #[must_use]
    pub fn thread_local_aware(mut self, aware: bool) -> Self {
        self.thread_local_aware = Some(aware);
        self
    }

    /// Handle failures of `class` raised anywhere in the process with `handler`
    #[must_use]
    pub fn handle(mut self, class: impl Into<FailureClass>, handler: impl Into<String>) -> Self {
        self.escalations.push(EscalationMapping::new(class, handler));
        self
    }

    /// Callback fired once when the process is released
    #[must_use]
    pub fn on_complete(mut self, callback: impl FnOnce(ProcessOutcome) + Send + 'static) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }
}

impl std::fmt::Debug for ProcessOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessOptions")
            .field("thread_local_aware", &self.thread_local_aware)
            .field("escalations", &self.escalations)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

/// Counts of live entities in a process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProcessSnapshot {
    /// Live thread contexts
    pub threads: usize,
    /// Live flows
    pub flows: usize,
    /// Live units
    pub units: usize,
    /// Containers not yet released
    pub containers: usize,
    /// Whether any thread is escalating
    pub escalating: bool,
    /// Whether the process was released
    pub released: bool,
}

/// Input posted to a process from outside its lock
pub(crate) enum Message {
    Provided {
        container: ContainerKey,
        attempt: u64,
        instance: Instance,
    },
    SourceFailed {
        container: ContainerKey,
        attempt: u64,
        failure: Failure,
    },
    SourcePending {
        container: ContainerKey,
        attempt: u64,
    },
    OperationStarted {
        container: ContainerKey,
        operation: u64,
    },
    OperationCompleted {
        container: ContainerKey,
        operation: u64,
        result: Result<(), Failure>,
    },
    AsyncFlowStarted {
        unit: UnitKey,
        operation: u64,
    },
    AsyncFlowCompleted {
        unit: UnitKey,
        operation: u64,
        result: Result<(), Failure>,
    },
    Expired(DeadlineTarget),
    Rejected {
        unit: UnitKey,
        reason: String,
    },
}

/// A unit ready to be handed to its team
pub(crate) struct Dispatch {
    pub(crate) unit: UnitKey,
    pub(crate) team: Arc<dyn Team>,
    pub(crate) affinity: Option<ThreadId>,
}

/// A source invocation for one sourcing attempt
pub(crate) struct SourceCall {
    pub(crate) container: ContainerKey,
    pub(crate) attempt: u64,
    pub(crate) resource: String,
    pub(crate) source: Arc<dyn ResourceSource>,
    pub(crate) prerequisites: Vec<(String, Instance)>,
}

impl SourceCall {
    fn invoke(self, process: Weak<ProcessCore>) -> Message {
        let Self {
            container,
            attempt,
            resource,
            source,
            prerequisites,
        } = self;
        let request = SourceRequest {
            resource: resource.clone(),
            prerequisites,
            completion: SourceCompletion::new(process, container, attempt),
        };
        match panic::catch_unwind(AssertUnwindSafe(|| source.source(request))) {
            Ok(Ok(Sourcing::Ready(instance))) => Message::Provided {
                container,
                attempt,
                instance,
            },
            Ok(Ok(Sourcing::Pending)) => Message::SourcePending { container, attempt },
            Ok(Err(failure)) => Message::SourceFailed {
                container,
                attempt,
                failure,
            },
            Err(payload) => Message::SourceFailed {
                container,
                attempt,
                failure: Failure::raise(PANIC, format!("source for {} panicked: {}", resource, panic_message(&payload))),
            },
        }
    }
}

/// An instance handed back at the end of its scope
pub(crate) struct RecycleCall {
    pub(crate) resource: String,
    pub(crate) source: Arc<dyn ResourceSource>,
    pub(crate) pool: Option<Arc<dyn InstancePool>>,
    pub(crate) release: Release,
}

impl RecycleCall {
    fn run(self) {
        let Release { instance, reusable } = self.release;
        let Some(pool) = self.pool else {
            return;
        };
        if reusable && self.source.recycle(&instance.instance) == Recycle::Reuse {
            debug!(resource = %self.resource, reuse_count = instance.reuse_count, "instance returned to pool");
            pool.release(instance);
        } else {
            debug!(resource = %self.resource, "instance discarded");
            pool.discard(instance);
        }
    }
}

/// Process release, delivered once
pub(crate) struct Completion {
    pub(crate) outcome: ProcessOutcome,
    pub(crate) callback: Option<ProcessCallback>,
}

/// Work recorded by transitions, performed after the lock is released
#[derive(Default)]
pub(crate) struct Effects {
    pub(crate) dispatches: Vec<Dispatch>,
    pub(crate) sources: Vec<SourceCall>,
    pub(crate) recycles: Vec<RecycleCall>,
    pub(crate) callbacks: Vec<(FlowCallback, FlowOutcome)>,
    pub(crate) completion: Option<Completion>,
}

impl Effects {
    pub(crate) fn merge(&mut self, other: Effects) {
        self.dispatches.extend(other.dispatches);
        self.sources.extend(other.sources);
        self.recycles.extend(other.recycles);
        self.callbacks.extend(other.callbacks);
        if other.completion.is_some() {
            self.completion = other.completion;
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.dispatches.is_empty()
            && self.sources.is_empty()
            && self.recycles.is_empty()
            && self.callbacks.is_empty()
            && self.completion.is_none()
    }
}

/// Set once when the process is released
#[derive(Default)]
struct Latch {
    outcome: Mutex<Option<ProcessOutcome>>,
    released: Condvar,
}

impl Latch {
    fn set(&self, outcome: ProcessOutcome) {
        let mut slot = self.outcome.lock();
        if slot.is_none() {
            *slot = Some(outcome);
            self.released.notify_all();
        }
    }

    fn get(&self) -> Option<ProcessOutcome> {
        self.outcome.lock().clone()
    }

    fn wait(&self) -> ProcessOutcome {
        let mut slot = self.outcome.lock();
        loop {
            if let Some(outcome) = slot.as_ref() {
                return outcome.clone();
            }
            self.released.wait(&mut slot);
        }
    }

    fn wait_for(&self, timeout: Duration) -> Option<ProcessOutcome> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.outcome.lock();
        while slot.is_none() {
            if self.released.wait_until(&mut slot, deadline).timed_out() {
                break;
            }
        }
        slot.clone()
    }
}

/// Shared core of one process
pub struct ProcessCore {
    id: ProcessId,
    runtime: Arc<Runtime>,
    state: Mutex<ProcessState>,
    inbox: Sender<Message>,
    pending: Receiver<Message>,
    operations: AtomicU64,
    latch: Latch,
}

impl std::fmt::Debug for ProcessCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessCore")
            .field("id", &self.id)
            .field("released", &self.latch.get().is_some())
            .finish_non_exhaustive()
    }
}

impl ProcessCore {
    pub(crate) fn new(runtime: Arc<Runtime>) -> Arc<Self> {
        let id = ProcessId::new();
        let (inbox, pending) = channel::unbounded();
        Arc::new_cyclic(|this| Self {
            id,
            state: Mutex::new(ProcessState::new(id, Arc::clone(&runtime), this.clone())),
            runtime,
            inbox,
            pending,
            operations: AtomicU64::new(1),
            latch: Latch::default(),
        })
    }

    /// Process id
    #[must_use]
    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub(crate) fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub(crate) fn next_operation(&self) -> u64 {
        self.operations.fetch_add(1, Ordering::Relaxed)
    }

    /// Run a transition under the lock; returns the effects it produced
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut ProcessState) -> R) -> (R, Effects) {
        let mut state = self.state.lock();
        self.drain(&mut state);
        let result = f(&mut state);
        self.drain(&mut state);
        let mut effects = state.take_effects();
        drop(state);
        if !self.pending.is_empty() {
            effects.merge(self.pump());
        }
        (result, effects)
    }

    /// Post a message without performing the resulting effects
    pub(crate) fn post(&self, message: Message) -> Effects {
        if self.inbox.send(message).is_err() {
            return Effects::default();
        }
        self.pump()
    }

    /// Post a message and perform whatever it causes
    pub(crate) fn deliver(self: &Arc<Self>, message: Message) {
        let effects = self.post(message);
        self.perform(effects);
    }

    // Whoever gets the lock drains the inbox; a busy holder picks our message up
    fn pump(&self) -> Effects {
        let mut effects = Effects::default();
        loop {
            let Some(mut state) = self.state.try_lock() else {
                break;
            };
            self.drain(&mut state);
            effects.merge(state.take_effects());
            drop(state);
            if self.pending.is_empty() {
                break;
            }
        }
        effects
    }

    fn drain(&self, state: &mut ProcessState) {
        while let Ok(message) = self.pending.try_recv() {
            state.apply(message);
        }
    }

    /// Perform effects until none are left
    pub(crate) fn perform(self: &Arc<Self>, effects: Effects) {
        let mut work = VecDeque::from([effects]);
        while let Some(batch) = work.pop_front() {
            if batch.is_empty() {
                continue;
            }
            let Effects {
                dispatches,
                sources,
                recycles,
                callbacks,
                completion,
            } = batch;

            for call in recycles {
                call.run();
            }
            for (callback, outcome) in callbacks {
                callback(outcome);
            }
            for call in sources {
                let message = call.invoke(Arc::downgrade(self));
                work.push_back(self.post(message));
            }
            for dispatch in dispatches {
                if let Some(effects) = self.dispatch(dispatch) {
                    work.push_back(effects);
                }
            }
            if let Some(completion) = completion {
                self.complete(completion);
            }
        }
    }

    fn dispatch(self: &Arc<Self>, dispatch: Dispatch) -> Option<Effects> {
        let Dispatch { unit, team, affinity } = dispatch;
        if team.is_pass_through() {
            let worker = WorkerContext::current(&Arc::from(team.name()));
            return Some(self.run_unit(unit, &worker));
        }

        let process = Arc::clone(self);
        let job = Job::new(move |worker| {
            let effects = process.run_unit(unit, worker);
            process.perform(effects);
        })
        .with_affinity(affinity);

        match team.assign(job) {
            Ok(()) => None,
            Err(e) => {
                warn!(process = %self.id, unit = %unit, error = %e, "team rejected unit");
                Some(self.post(Message::Rejected {
                    unit,
                    reason: e.to_string(),
                }))
            }
        }
    }

    /// Run one unit body on the current thread
    pub(crate) fn run_unit(self: &Arc<Self>, unit: UnitKey, worker: &WorkerContext) -> Effects {
        let (invocation, mut effects) = self.with_state(|state| state.begin_unit(unit, worker.thread()));
        let Some(invocation) = invocation else {
            return effects;
        };

        let body = Arc::clone(&invocation.body);
        let function = Arc::clone(&invocation.function);
        let span = tracing::debug_span!("unit", process = %self.id, unit = %unit, function = %function);
        let _guard = span.enter();

        let mut ctx = UnitContext::new(self, unit, worker, invocation);
        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| body.execute(&mut ctx))) {
            Ok(outcome) => outcome,
            Err(payload) => Err(Failure::raise(PANIC, panic_message(&payload))),
        };
        let outcome = outcome.map_err(|failure| failure.attributed_to(&function));
        let (requests, posted) = ctx.finish();
        effects.merge(posted);

        let ((), finished) = self.with_state(|state| state.finish_unit(unit, outcome, requests));
        effects.merge(finished);
        effects
    }

    fn complete(&self, completion: Completion) {
        let Completion { outcome, callback } = completion;
        if let Some(callback) = callback {
            callback(outcome.clone());
        }
        self.latch.set(outcome);
    }
}

fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic".to_string()
    }
}

/// Handle to a submitted process
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    core: Arc<ProcessCore>,
}

impl ProcessHandle {
    pub(crate) fn new(core: Arc<ProcessCore>) -> Self {
        Self { core }
    }

    /// Process id
    #[must_use]
    pub fn id(&self) -> ProcessId {
        self.core.id
    }

    /// Whether the process has been released
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.core.latch.get().is_some()
    }

    /// Outcome, once released
    #[must_use]
    pub fn outcome(&self) -> Option<ProcessOutcome> {
        self.core.latch.get()
    }

    /// Block until the process is released
    ///
    /// Must not be called from a worker of a team the process needs.
    #[must_use]
    pub fn wait(&self) -> ProcessOutcome {
        self.core.latch.wait()
    }

    /// Block until released or `timeout` elapses
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> Option<ProcessOutcome> {
        self.core.latch.wait_for(timeout)
    }

    /// Live entity counts
    #[must_use]
    pub fn snapshot(&self) -> ProcessSnapshot {
        let (snapshot, effects) = self.core.with_state(|state| state.snapshot());
        self.core.perform(effects);
        snapshot
    }
}
