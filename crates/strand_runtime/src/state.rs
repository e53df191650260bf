//! Process state and its transitions.
//!
//! Everything here runs under the process lock and nothing here calls user
//! code: work for the outside world is appended to [`Effects`]. Threads,
//! flows, units and containers live in arena tables keyed by small typed
//! keys; entities refer to each other only through those keys, so a stale
//! reference (a waiter whose unit was suppressed, an expiry for a released
//! container) is simply a failed lookup.
//!
//! Counting rules:
//! - a flow counts its units that have not finished; a continuation is
//!   created before its predecessor is counted down, so a flow never
//!   reaches zero in the middle of a chain
//! - a thread finishes when it has no flows and is not escalating
//! - the process is released when its last thread finishes

use indexmap::IndexMap;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::thread::ThreadId;
use strand_core::{ContainerKey, FlowKey, KeyAllocator, ProcessId, ThreadKey, UnitKey};
use strand_plan::{EscalationMapping, Scope};
use tracing::{debug, error, info, trace, warn};

use crate::administration::{self, Step, StepAction, UnitKind};
use crate::container::{Container, ContainerState, Readiness, Request, Resolution, Waiter};
use crate::error::{DISCARDED, Failure, TEAM_REJECTED, UnitResult};
use crate::escalation;
use crate::flow::{FlowCallback, FlowOptions, FlowState};
use crate::monitor::DeadlineTarget;
use crate::office::Runtime;
use crate::process::{
    Completion, Dispatch, Effects, Message, ProcessCallback, ProcessCore, ProcessOptions, ProcessOutcome,
    ProcessSnapshot, RecycleCall, SourceCall,
};
use crate::thread::{EscalationLevel, ThreadState};
use crate::unit::{Invocation, UNKNOWN_FUNCTION, UnitPhase, UnitRequest, UnitState};

fn unloaded(resource: &str) -> Failure {
    Failure::DependencyResolution {
        resource: resource.to_string(),
        reason: "container no longer available".to_string(),
    }
}

/// Where a new flow sits relative to existing ones
enum Placement<'a> {
    Root,
    /// Spawned by a unit of this flow
    Nested(FlowKey),
    /// Handles the failure of this flow with the named handler
    Replacing(FlowKey, &'a str),
}

/// Mutable state of one process
pub(crate) struct ProcessState {
    id: ProcessId,
    runtime: Arc<Runtime>,
    this: Weak<ProcessCore>,
    keys: KeyAllocator,
    threads: IndexMap<ThreadKey, ThreadState>,
    flows: IndexMap<FlowKey, FlowState>,
    units: IndexMap<UnitKey, UnitState>,
    containers: IndexMap<ContainerKey, Container>,
    process_scope: IndexMap<String, ContainerKey>,
    entry_thread: Option<ThreadKey>,
    result: Option<Value>,
    terminal: Option<Failure>,
    released: bool,
    callback: Option<ProcessCallback>,
    effects: Effects,
}

impl ProcessState {
    pub(crate) fn new(id: ProcessId, runtime: Arc<Runtime>, this: Weak<ProcessCore>) -> Self {
        Self {
            id,
            runtime,
            this,
            keys: KeyAllocator::new(),
            threads: IndexMap::new(),
            flows: IndexMap::new(),
            units: IndexMap::new(),
            containers: IndexMap::new(),
            process_scope: IndexMap::new(),
            entry_thread: None,
            result: None,
            terminal: None,
            released: false,
            callback: None,
            effects: Effects::default(),
        }
    }

    pub(crate) fn take_effects(&mut self) -> Effects {
        std::mem::take(&mut self.effects)
    }

    pub(crate) fn snapshot(&self) -> ProcessSnapshot {
        ProcessSnapshot {
            threads: self.threads.len(),
            flows: self.flows.len(),
            units: self.units.len(),
            containers: self.containers.len(),
            escalating: self.threads.values().any(|t| t.level != EscalationLevel::None),
            released: self.released,
        }
    }

    /// Create the entry thread and flow and start `function`
    pub(crate) fn start(&mut self, function: &str, parameter: Value, options: ProcessOptions) {
        let ProcessOptions {
            thread_local_aware,
            escalations,
            callback,
        } = options;
        self.callback = callback;

        let thread = self.new_thread(thread_local_aware);
        self.entry_thread = Some(thread);
        let flow = self.new_flow(thread, escalations, None, None, None, Placement::Root);
        if let Some(t) = self.threads.get_mut(&thread) {
            t.entry_flow = Some(flow);
        }

        info!(process = %self.id, function, "process started");
        let steps = administration::expand(&self.runtime.graph, function, Some(parameter));
        self.start_chain(flow, steps, Value::Null, true);
    }

    // ---- entity creation ----

    fn new_thread(&mut self, thread_local_aware: Option<bool>) -> ThreadKey {
        let key = self.keys.thread();
        let aware = thread_local_aware.unwrap_or(self.runtime.config.thread_local_aware);
        self.threads.insert(key, ThreadState::new(key, aware));
        trace!(process = %self.id, thread = %key, "thread created");
        key
    }

    fn new_flow(
        &mut self,
        thread: ThreadKey,
        escalations: Vec<EscalationMapping>,
        callback: Option<FlowCallback>,
        parent: Option<UnitKey>,
        handling: Option<Failure>,
        placement: Placement<'_>,
    ) -> FlowKey {
        let key = self.keys.flow();
        let mut flow = FlowState::new(key, thread);
        match placement {
            Placement::Root => {}
            Placement::Nested(enclosing) => {
                if let Some(enclosing) = self.flows.get(&enclosing) {
                    flow.inherit(enclosing);
                }
            }
            Placement::Replacing(failing, handler) => {
                if let Some(failing) = self.flows.get(&failing) {
                    flow.succeed(failing, handler);
                }
            }
        }
        flow.escalations = escalations;
        flow.callback = callback;
        flow.parent = parent;
        flow.handling = handling;
        self.flows.insert(key, flow);
        if let Some(t) = self.threads.get_mut(&thread) {
            t.flows.insert(key);
        }
        trace!(process = %self.id, thread = %thread, flow = %key, "flow created");
        key
    }

    fn start_chain(&mut self, flow: FlowKey, mut steps: VecDeque<Step>, carried: Value, mainline: bool) {
        let Some(step) = steps.pop_front() else {
            return;
        };
        let parameter = step.parameter.unwrap_or(carried);
        self.create_unit(flow, step.action, parameter, steps, mainline);
    }

    fn create_unit(
        &mut self,
        flow: FlowKey,
        action: StepAction,
        parameter: Value,
        continuation: VecDeque<Step>,
        mainline: bool,
    ) {
        let Some(thread) = self.flows.get(&flow).map(|f| f.thread) else {
            return;
        };
        let key = self.keys.unit();
        let (kind, function, administered, dependencies) = match action {
            StepAction::Invoke(function) => {
                let dependencies = self
                    .runtime
                    .graph
                    .function(&function)
                    .map(|t| t.dependencies.clone())
                    .unwrap_or_default();
                (UnitKind::Function, function, None, dependencies)
            }
            StepAction::Administer {
                kind,
                function,
                extensions,
                administered,
            } => (kind, function, Some(administered), extensions),
        };

        let mut unit = UnitState::new(key, flow, thread, kind, function);
        unit.administered = administered;
        unit.parameter = parameter;
        unit.continuation = continuation;
        unit.mainline = mainline;
        trace!(process = %self.id, flow = %flow, unit = %key, function = %unit.function, "unit created");
        self.units.insert(key, unit);

        if let Some(f) = self.flows.get_mut(&flow) {
            f.units.insert(key);
            f.active += 1;
        }
        self.bind_dependencies(key, &dependencies);
    }

    // ---- dependencies ----

    fn bind_dependencies(&mut self, unit: UnitKey, names: &[String]) {
        let mut bound = Vec::with_capacity(names.len());
        let mut awaiting = 0;
        let mut failure = None;

        for name in names {
            let container = match self.container_for(unit, name) {
                Ok(container) => container,
                Err(f) => {
                    failure = Some(f);
                    break;
                }
            };
            bound.push((name.clone(), container));
            self.request(container);
            let readiness = match self.containers.get_mut(&container) {
                Some(c) => c.await_ready(Waiter::Unit(unit)),
                None => Readiness::Failed(unloaded(name)),
            };
            match readiness {
                Readiness::Ready => {}
                Readiness::Parked => awaiting += 1,
                Readiness::Failed(f) => {
                    failure = Some(f);
                    break;
                }
            }
        }

        if let Some(state) = self.units.get_mut(&unit) {
            state.dependencies = bound;
            state.awaiting = awaiting;
            if awaiting > 0 {
                state.phase = UnitPhase::AwaitingDependencies;
            }
        }
        match failure {
            Some(f) => self.fail_unit(unit, f),
            None if awaiting == 0 => self.make_runnable(unit),
            None => {}
        }
    }

    /// Container serving `name` for `unit`, created in the right scope if needed
    fn container_for(&mut self, unit: UnitKey, name: &str) -> Result<ContainerKey, Failure> {
        let template = self
            .runtime
            .graph
            .resource(name)
            .cloned()
            .ok_or_else(|| Failure::DependencyResolution {
                resource: name.to_string(),
                reason: "unknown resource".to_string(),
            })?;
        let thread = self.units.get(&unit).map(|u| u.thread).ok_or_else(|| unloaded(name))?;

        let existing = match template.scope {
            Scope::Process => self.process_scope.get(name).copied(),
            Scope::Thread => self.threads.get(&thread).and_then(|t| t.containers.get(name).copied()),
            Scope::Unit => self.units.get(&unit).and_then(|u| {
                u.owned
                    .iter()
                    .copied()
                    .find(|k| self.containers.get(k).is_some_and(|c| c.name() == name))
            }),
        };
        if let Some(key) = existing {
            return Ok(key);
        }

        let prerequisites = template
            .depends_on
            .iter()
            .map(|p| self.container_for(unit, p))
            .collect::<Result<Vec<_>, _>>()?;

        let key = self.keys.container();
        let mut container = Container::new(key, &template);
        container.set_prerequisites(prerequisites);
        self.containers.insert(key, container);

        match template.scope {
            Scope::Process => {
                self.process_scope.insert(name.to_string(), key);
            }
            Scope::Thread => {
                if let Some(t) = self.threads.get_mut(&thread) {
                    t.containers.insert(name.to_string(), key);
                }
            }
            Scope::Unit => {
                if let Some(u) = self.units.get_mut(&unit) {
                    u.owned.push(key);
                }
            }
        }
        trace!(process = %self.id, container = %key, resource = name, scope = %template.scope, "container created");
        Ok(key)
    }

    /// Ask a container for its instance, starting a sourcing attempt if needed
    fn request(&mut self, key: ContainerKey) {
        let Some(container) = self.containers.get_mut(&key) else {
            return;
        };
        let pooled = if container.state() == ContainerState::Unsourced {
            self.runtime.pools.get(container.name()).and_then(|pool| pool.acquire())
        } else {
            None
        };

        match container.request(pooled) {
            Request::Source { attempt } => {
                if let Some(at) = container.timeout().deadline_from(self.runtime.clock.now()) {
                    let target = DeadlineTarget::Sourcing { container: key, attempt };
                    let deadline = self.runtime.monitor.register(at, self.this.clone(), target);
                    container.set_sourcing_deadline(deadline);
                }
                debug!(process = %self.id, resource = container.name(), attempt, "sourcing");
                let prerequisites = container.prerequisites().to_vec();
                self.gather_prerequisites(key, prerequisites);
            }
            Request::Pooled => {
                debug!(process = %self.id, resource = container.name(), reuse_count = container.reuse_count(), "instance taken from pool");
            }
            Request::InFlight | Request::Closed => {}
        }
    }

    fn gather_prerequisites(&mut self, key: ContainerKey, prerequisites: Vec<ContainerKey>) {
        let mut waiting = 0;
        for prerequisite in prerequisites {
            self.request(prerequisite);
            let readiness = match self.containers.get_mut(&prerequisite) {
                Some(p) => p.await_ready(Waiter::Container(key)),
                None => Readiness::Failed(unloaded("prerequisite")),
            };
            match readiness {
                Readiness::Ready => {}
                Readiness::Parked => waiting += 1,
                Readiness::Failed(f) => {
                    let resolution = self.containers.get_mut(&key).and_then(|c| c.prerequisite_failed(&f));
                    self.resolve(resolution);
                    return;
                }
            }
        }

        if waiting == 0 {
            self.schedule_source(key);
        } else if let Some(c) = self.containers.get_mut(&key) {
            c.await_prerequisites(waiting);
        }
    }

    fn schedule_source(&mut self, key: ContainerKey) {
        let Some(container) = self.containers.get(&key) else {
            return;
        };
        let resource = container.name().to_string();
        let attempt = container.attempt();
        let prerequisites = container
            .prerequisites()
            .iter()
            .filter_map(|p| self.containers.get(p))
            .filter_map(|p| p.instance().map(|i| (p.name().to_string(), Arc::clone(i))))
            .collect();

        let Some(source) = self.runtime.sources.get(&resource).cloned() else {
            let failure = Failure::DependencyResolution {
                resource: resource.clone(),
                reason: "no source bound".to_string(),
            };
            let resolution = self.containers.get_mut(&key).and_then(|c| c.fail(attempt, &failure));
            self.resolve(resolution);
            return;
        };

        self.effects.sources.push(SourceCall {
            container: key,
            attempt,
            resource,
            source,
            prerequisites,
        });
    }

    /// Wake or fail whatever a container state change released
    fn resolve(&mut self, resolution: Option<Resolution>) {
        let Some(Resolution {
            waiters,
            failure,
            cancelled,
        }) = resolution
        else {
            return;
        };
        for deadline in cancelled {
            self.runtime.monitor.cancel(deadline);
        }

        for waiter in waiters {
            match (waiter, &failure) {
                (Waiter::Unit(unit), None) => self.dependency_ready(unit),
                (Waiter::Unit(unit), Some(f)) => self.dependency_failed(unit, f.clone()),
                (Waiter::Container(key), None) => {
                    if self.containers.get_mut(&key).is_some_and(|c| c.prerequisite_ready()) {
                        self.schedule_source(key);
                    }
                }
                (Waiter::Container(key), Some(f)) => {
                    let resolution = self.containers.get_mut(&key).and_then(|c| c.prerequisite_failed(f));
                    self.resolve(resolution);
                }
            }
        }
    }

    fn dependency_ready(&mut self, unit: UnitKey) {
        let Some(state) = self.units.get_mut(&unit) else {
            return;
        };
        if state.phase != UnitPhase::AwaitingDependencies {
            return;
        }
        state.awaiting = state.awaiting.saturating_sub(1);
        if state.awaiting == 0 {
            self.make_runnable(unit);
        }
    }

    fn dependency_failed(&mut self, unit: UnitKey, failure: Failure) {
        if self.units.get(&unit).is_some_and(UnitState::is_pending) {
            self.fail_unit(unit, failure);
        }
    }

    fn make_runnable(&mut self, unit: UnitKey) {
        let Some(state) = self.units.get_mut(&unit) else {
            return;
        };
        state.phase = UnitPhase::Runnable;
        let team = self.runtime.team_for(&state.function);
        let affinity = self.threads.get(&state.thread).and_then(ThreadState::affinity);
        self.effects.dispatches.push(Dispatch { unit, team, affinity });
    }

    // ---- running ----

    /// Move a runnable unit to running and capture what its body needs
    ///
    /// Returns `None` if the unit was suppressed, or had to park again
    /// because a dependency became busy after it was dispatched.
    pub(crate) fn begin_unit(&mut self, unit: UnitKey, worker: ThreadId) -> Option<Invocation> {
        let state = self.units.get(&unit)?;
        if state.phase != UnitPhase::Runnable {
            return None;
        }

        let dependencies = state.dependencies.clone();
        let mut instances = Vec::with_capacity(dependencies.len());
        let mut parked = 0;
        for (name, key) in dependencies {
            let readiness = match self.containers.get_mut(&key) {
                Some(c) => c.await_ready(Waiter::Unit(unit)),
                None => Readiness::Failed(unloaded(&name)),
            };
            match readiness {
                Readiness::Ready => {
                    if let Some(instance) = self.containers.get(&key).and_then(Container::instance) {
                        let instance = Arc::clone(instance);
                        instances.push((name, key, instance));
                    }
                }
                Readiness::Parked => parked += 1,
                Readiness::Failed(f) => {
                    self.fail_unit(unit, f);
                    return None;
                }
            }
        }

        let state = self.units.get_mut(&unit)?;
        if parked > 0 {
            debug!(process = %self.id, unit = %unit, parked, "dependency busy, unit parked again");
            state.awaiting = parked;
            state.phase = UnitPhase::AwaitingDependencies;
            return None;
        }

        let Some(body) = self.runtime.bodies.get(&*state.function).cloned() else {
            let failure = Failure::raise(UNKNOWN_FUNCTION, format!("no body bound for {}", state.function));
            self.fail_unit(unit, failure);
            return None;
        };

        state.phase = UnitPhase::Running;
        let (thread, flow, kind) = (state.thread, state.flow, state.kind);
        let function = Arc::clone(&state.function);
        let administered = state.administered.clone();
        let parameter = state.parameter.clone();

        if let Some(t) = self.threads.get_mut(&thread) {
            t.last_worker = Some(worker);
            t.start_handling(flow);
        }

        let extensions = match kind {
            UnitKind::Function => Vec::new(),
            UnitKind::Duty | UnitKind::Governance => instances
                .iter()
                .filter_map(|(name, _, instance)| {
                    self.runtime
                        .sources
                        .get(name.as_str())
                        .map(|source| (Arc::clone(source), Arc::clone(instance)))
                })
                .collect(),
        };
        let failure = self.flows.get(&flow).and_then(|f| f.handling.clone());
        self.runtime.metrics.record_unit_executed();

        Some(Invocation {
            body,
            function,
            kind,
            administered,
            parameter,
            dependencies: instances,
            extensions,
            failure,
        })
    }

    /// Apply the outcome of a body and whatever it requested
    pub(crate) fn finish_unit(&mut self, unit: UnitKey, outcome: UnitResult, requests: Vec<UnitRequest>) {
        let Some(state) = self.units.get_mut(&unit) else {
            return;
        };
        if state.phase != UnitPhase::Running {
            return;
        }
        let outcome = match (outcome, state.async_failure.take()) {
            (Ok(_), Some(failure)) => Err(failure),
            (outcome, _) => outcome,
        };
        let (flow, kind) = (state.flow, state.kind);
        let proceed = outcome.is_ok() && self.flows.get(&flow).is_some_and(|f| !f.discarded);

        for request in requests {
            match request {
                UnitRequest::Invalidate(key) => {
                    if let Some(c) = self.containers.get_mut(&key) {
                        c.invalidate();
                    }
                }
                _ if !proceed => {
                    debug!(process = %self.id, unit = %unit, "request dropped");
                }
                UnitRequest::Next { function, parameter } => {
                    if let Some(state) = self.units.get_mut(&unit) {
                        state.next = Some((function, parameter));
                    }
                }
                UnitRequest::Parallel { function, parameter } => {
                    let steps = administration::expand(&self.runtime.graph, &function, Some(parameter));
                    self.start_chain(flow, steps, Value::Null, false);
                }
                UnitRequest::Flow {
                    function,
                    parameter,
                    options,
                } => self.spawn_flow(unit, &function, parameter, options),
            }
        }

        match outcome {
            Err(failure) => self.fail_unit(unit, failure),
            Ok(value) => {
                let Some(state) = self.units.get_mut(&unit) else {
                    return;
                };
                state.result = Some(match kind {
                    UnitKind::Function => value,
                    UnitKind::Duty | UnitKind::Governance => state.parameter.clone(),
                });
                if state.is_settled() {
                    self.complete_unit(unit);
                } else {
                    state.phase = UnitPhase::Suspended;
                    trace!(process = %self.id, unit = %unit, "unit suspended");
                }
            }
        }
    }

    fn spawn_flow(&mut self, parent: UnitKey, function: &str, parameter: Value, options: FlowOptions) {
        let FlowOptions {
            new_thread,
            thread_local_aware,
            blocking,
            escalations,
            callback,
        } = options;
        let Some((parent_thread, parent_flow)) = self.units.get(&parent).map(|u| (u.thread, u.flow)) else {
            return;
        };

        let thread = if new_thread {
            self.new_thread(thread_local_aware)
        } else {
            parent_thread
        };
        let flow = self.new_flow(
            thread,
            escalations,
            callback,
            blocking.then_some(parent),
            None,
            Placement::Nested(parent_flow),
        );
        if new_thread {
            if let Some(t) = self.threads.get_mut(&thread) {
                t.entry_flow = Some(flow);
            }
        }
        if blocking {
            if let Some(u) = self.units.get_mut(&parent) {
                u.blocking_children += 1;
            }
        }
        debug!(process = %self.id, parent = %parent, flow = %flow, function, new_thread, blocking, "flow spawned");

        let steps = administration::expand(&self.runtime.graph, function, Some(parameter));
        self.start_chain(flow, steps, Value::Null, true);
    }

    fn check_suspended(&mut self, unit: UnitKey) {
        let Some(state) = self.units.get_mut(&unit) else {
            return;
        };
        if state.phase != UnitPhase::Suspended {
            return;
        }
        if let Some(failure) = state.async_failure.take() {
            self.fail_unit(unit, failure);
        } else if state.is_settled() {
            self.complete_unit(unit);
        }
    }

    fn complete_unit(&mut self, unit: UnitKey) {
        let Some(mut state) = self.units.shift_remove(&unit) else {
            return;
        };
        state.phase = UnitPhase::Complete;
        self.release_containers(std::mem::take(&mut state.owned));

        let flow = state.flow;
        let discarded = match self.flows.get_mut(&flow) {
            Some(f) => {
                f.units.shift_remove(&unit);
                f.discarded
            }
            None => true,
        };

        if !discarded {
            let value = state.result.take().unwrap_or(Value::Null);
            let mut steps = match state.kind {
                UnitKind::Function => {
                    administration::continuation(&self.runtime.graph, &state.function, state.next.take())
                }
                UnitKind::Duty | UnitKind::Governance => VecDeque::new(),
            };
            steps.extend(std::mem::take(&mut state.continuation));

            if steps.is_empty() {
                if state.mainline {
                    if let Some(f) = self.flows.get_mut(&flow) {
                        f.result = Some(value);
                    }
                }
            } else {
                self.start_chain(flow, steps, value, state.mainline);
            }
        }
        trace!(process = %self.id, unit = %unit, function = %state.function, "unit complete");
        self.flow_unit_done(flow);
    }

    fn fail_unit(&mut self, unit: UnitKey, failure: Failure) {
        let Some(mut state) = self.units.shift_remove(&unit) else {
            return;
        };
        state.phase = UnitPhase::Escalated;
        self.runtime.metrics.record_unit_failed();
        warn!(
            process = %self.id,
            unit = %unit,
            function = %state.function,
            class = %failure.class(),
            error = %failure,
            "unit failed"
        );

        self.release_containers(std::mem::take(&mut state.owned));
        for (_, deadline) in state.async_flows.drain(..) {
            if let Some(deadline) = deadline {
                self.runtime.monitor.cancel(deadline);
            }
        }
        if let Some(f) = self.flows.get_mut(&state.flow) {
            f.units.shift_remove(&unit);
        }

        let handlers = self
            .runtime
            .graph
            .function(&state.function)
            .map(|t| t.escalations.clone())
            .unwrap_or_default();
        self.escalate(state.thread, state.flow, &handlers, failure);
        self.flow_unit_done(state.flow);
    }

    fn suppress_unit(&mut self, unit: UnitKey) {
        let Some(mut state) = self.units.shift_remove(&unit) else {
            return;
        };
        state.phase = UnitPhase::Suppressed;
        self.runtime.metrics.record_unit_suppressed();
        self.release_containers(std::mem::take(&mut state.owned));
        if let Some(f) = self.flows.get_mut(&state.flow) {
            f.units.shift_remove(&unit);
            f.active = f.active.saturating_sub(1);
        }
        trace!(process = %self.id, unit = %unit, function = %state.function, "unit suppressed");
    }

    // ---- flows and threads ----

    fn flow_unit_done(&mut self, flow: FlowKey) {
        let Some(state) = self.flows.get_mut(&flow) else {
            return;
        };
        state.active = state.active.saturating_sub(1);
        if state.active == 0 {
            self.complete_flow(flow);
        }
    }

    fn discard_flow(&mut self, flow: FlowKey) {
        let Some(state) = self.flows.get_mut(&flow) else {
            return;
        };
        if state.discarded {
            return;
        }
        state.discarded = true;
        let pending: Vec<UnitKey> = state
            .units
            .iter()
            .copied()
            .filter(|u| self.units.get(u).is_some_and(UnitState::is_pending))
            .collect();
        debug!(process = %self.id, flow = %flow, suppressed = pending.len(), "flow discarded");

        for unit in pending {
            self.suppress_unit(unit);
        }
        if self.flows.get(&flow).is_some_and(|f| f.active == 0) {
            self.complete_flow(flow);
        }
    }

    /// Discard `flow` and the flows nested under it on the same thread
    fn discard_subtree(&mut self, thread: ThreadKey, flow: FlowKey, cause: &Failure) {
        let flows: Vec<FlowKey> = self
            .threads
            .get(&thread)
            .map(|t| {
                t.flows
                    .iter()
                    .copied()
                    .filter(|f| *f == flow || self.flows.get(f).is_some_and(|s| s.descends_from(flow)))
                    .collect()
            })
            .unwrap_or_default();
        for key in flows {
            if let Some(f) = self.flows.get_mut(&key) {
                f.cause.get_or_insert_with(|| cause.clone());
            }
            self.discard_flow(key);
        }
    }

    fn discard_thread_flows(&mut self, thread: ThreadKey) {
        let flows: Vec<FlowKey> = self
            .threads
            .get(&thread)
            .map(|t| t.flows.iter().copied().collect())
            .unwrap_or_default();
        for flow in flows {
            self.discard_flow(flow);
        }
    }

    fn complete_flow(&mut self, flow: FlowKey) {
        let Some(mut state) = self.flows.shift_remove(&flow) else {
            return;
        };
        let thread = state.thread;
        let cause = state.cause.take().or_else(|| self.terminal.clone());
        let outcome = state.outcome(|| cause.unwrap_or_else(|| Failure::raise(DISCARDED, "flow discarded")));
        debug!(process = %self.id, flow = %flow, ok = outcome.is_ok(), "flow complete");

        if let Some(callback) = state.callback.take() {
            self.effects.callbacks.push((callback, outcome.clone()));
        }

        if let Some(parent) = state.parent {
            if let Some(p) = self.units.get_mut(&parent) {
                p.blocking_children = p.blocking_children.saturating_sub(1);
            }
            self.check_suspended(parent);
        }

        if let Some(t) = self.threads.get_mut(&thread) {
            t.flows.shift_remove(&flow);
            if t.end_escalation(flow) {
                info!(process = %self.id, thread = %thread, ok = outcome.is_ok(), "escalation handled");
            }
            if t.entry_flow == Some(flow) {
                if let Ok(value) = &outcome {
                    t.result = Some(value.clone());
                    if self.entry_thread == Some(thread) {
                        self.result = Some(value.clone());
                    }
                }
            }
        }
        self.check_thread(thread);
    }

    fn check_thread(&mut self, thread: ThreadKey) {
        if !self.threads.get(&thread).is_some_and(ThreadState::is_idle) {
            return;
        }
        let Some(state) = self.threads.shift_remove(&thread) else {
            return;
        };
        self.release_containers(state.containers.into_values().collect());
        debug!(process = %self.id, thread = %thread, "thread finished");

        if self.threads.is_empty() {
            self.release();
        }
    }

    // ---- escalation ----

    /// Route a unit failure to a handler flow that takes the failing flow's place.
    /// Flow-level handlers are searched from the failing flow outward through the
    /// flows that spawned it. Only the failing flow and its nested flows on the
    /// same thread are discarded; a blocking parent waits for the handler instead.
    fn escalate(&mut self, thread: ThreadKey, flow: FlowKey, handlers: &[EscalationMapping], failure: Failure) {
        let Some(flow_state) = self.flows.get_mut(&flow) else {
            return;
        };
        flow_state.failure = Some(failure.clone());
        if flow_state.discarded || self.terminal.is_some() {
            debug!(process = %self.id, class = %failure.class(), "failure superseded by earlier escalation");
            return;
        }
        self.runtime.metrics.record_escalation();

        let flow_handlers = flow_state.handler_chain();
        let exclude = flow_state.excluded.clone();
        let parent = flow_state.parent;
        let class = failure.class();
        let choice = escalation::select_handler(&class, handlers, &flow_handlers, &self.runtime.graph, &exclude);

        match choice {
            Some(choice) => {
                info!(
                    process = %self.id,
                    thread = %thread,
                    class = %class,
                    handler = %choice.handler,
                    scope = ?choice.scope,
                    "escalating"
                );
                let handler_flow = self.new_flow(
                    thread,
                    Vec::new(),
                    None,
                    parent,
                    Some(failure.clone()),
                    Placement::Replacing(flow, &choice.handler),
                );
                if let Some(p) = parent.and_then(|unit| self.units.get_mut(&unit)) {
                    p.blocking_children += 1;
                }
                if let Some(t) = self.threads.get_mut(&thread) {
                    t.begin_escalation(handler_flow);
                    if t.entry_flow == Some(flow) {
                        t.entry_flow = Some(handler_flow);
                    }
                }
                self.discard_subtree(thread, flow, &failure);
                let steps = administration::expand(&self.runtime.graph, &choice.handler, Some(failure.to_value()));
                self.start_chain(handler_flow, steps, Value::Null, true);
            }
            None => self.fail_process(failure),
        }
    }

    fn fail_process(&mut self, failure: Failure) {
        if self.terminal.is_some() {
            return;
        }
        error!(process = %self.id, class = %failure.class(), error = %failure, "no escalation handler, failing process");
        self.terminal = Some(Failure::EscalationHandlerNotFound {
            cause: Box::new(failure),
        });
        let threads: Vec<ThreadKey> = self.threads.keys().copied().collect();
        for thread in threads {
            self.discard_thread_flows(thread);
        }
    }

    // ---- release ----

    fn release_containers(&mut self, keys: Vec<ContainerKey>) {
        for key in keys {
            let Some(mut container) = self.containers.shift_remove(&key) else {
                continue;
            };
            let (release, cancelled) = container.release();
            for deadline in cancelled {
                self.runtime.monitor.cancel(deadline);
            }
            if let Some(release) = release {
                if let Some(source) = self.runtime.sources.get(container.name()).cloned() {
                    self.effects.recycles.push(RecycleCall {
                        resource: container.name().to_string(),
                        source,
                        pool: self.runtime.pools.get(container.name()).cloned(),
                        release,
                    });
                }
            }
            container.unload();
            trace!(process = %self.id, container = %key, resource = container.name(), "container unloaded");
        }
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let scoped: Vec<ContainerKey> = self.process_scope.drain(..).map(|(_, key)| key).collect();
        self.release_containers(scoped);
        let leftovers: Vec<ContainerKey> = self.containers.keys().copied().collect();
        self.release_containers(leftovers);

        let result = match &self.terminal {
            Some(failure) => {
                self.runtime.metrics.record_process_failed();
                Err(failure.clone())
            }
            None => {
                self.runtime.metrics.record_process_completed();
                Ok(self.result.take().unwrap_or(Value::Null))
            }
        };
        info!(process = %self.id, ok = result.is_ok(), "process released");

        self.effects.completion = Some(Completion {
            outcome: ProcessOutcome {
                process: self.id,
                result,
            },
            callback: self.callback.take(),
        });
    }

    // ---- messages ----

    pub(crate) fn apply(&mut self, message: Message) {
        if self.released {
            trace!(process = %self.id, "message after release ignored");
            return;
        }
        match message {
            Message::Provided {
                container,
                attempt,
                instance,
            } => {
                let resolution = self.containers.get_mut(&container).and_then(|c| c.provide(attempt, instance));
                if resolution.is_none() {
                    debug!(process = %self.id, container = %container, attempt, "stale provide ignored");
                }
                self.resolve(resolution);
            }
            Message::SourceFailed {
                container,
                attempt,
                failure,
            } => {
                let resolution = self.containers.get_mut(&container).and_then(|c| c.fail(attempt, &failure));
                self.resolve(resolution);
            }
            Message::SourcePending { container, attempt } => {
                let resolution = self.containers.get_mut(&container).and_then(|c| c.pending(attempt));
                self.resolve(resolution);
            }
            Message::OperationStarted { container, operation } => self.start_operation(container, operation),
            Message::OperationCompleted {
                container,
                operation,
                result,
            } => {
                let resolution = self
                    .containers
                    .get_mut(&container)
                    .and_then(|c| c.complete_operation(operation, result));
                self.resolve(resolution);
            }
            Message::AsyncFlowStarted { unit, operation } => self.start_async_flow(unit, operation),
            Message::AsyncFlowCompleted {
                unit,
                operation,
                result,
            } => self.complete_async_flow(unit, operation, result),
            Message::Expired(target) => self.expire(target),
            Message::Rejected { unit, reason } => {
                if self.units.get(&unit).is_some_and(|u| u.phase == UnitPhase::Runnable) {
                    self.fail_unit(unit, Failure::raise(TEAM_REJECTED, reason));
                }
            }
        }
    }

    fn operation_timeout(&self, container: &Container) -> strand_core::Timeout {
        if container.timeout().is_bounded() {
            container.timeout()
        } else {
            self.runtime.config.default_async_timeout
        }
    }

    fn start_operation(&mut self, key: ContainerKey, operation: u64) {
        let Some(container) = self.containers.get(&key) else {
            return;
        };
        let timeout = self.operation_timeout(container);
        let now = self.runtime.clock.now();
        let Some(container) = self.containers.get_mut(&key) else {
            return;
        };
        if !container.begin_operation(operation) {
            debug!(process = %self.id, container = %key, "operation on unavailable container ignored");
            return;
        }
        if let Some(at) = timeout.deadline_from(now) {
            let target = DeadlineTarget::Operation { container: key, operation };
            let deadline = self.runtime.monitor.register(at, self.this.clone(), target);
            container.set_operation_deadline(operation, deadline);
        }
    }

    fn start_async_flow(&mut self, unit: UnitKey, operation: u64) {
        let Some(state) = self.units.get_mut(&unit) else {
            return;
        };
        if !matches!(state.phase, UnitPhase::Running | UnitPhase::Suspended) {
            return;
        }
        let timeout = self.runtime.async_timeout(&state.function);
        let deadline = timeout.deadline_from(self.runtime.clock.now()).map(|at| {
            let target = DeadlineTarget::AsyncFlow { unit, operation };
            self.runtime.monitor.register(at, self.this.clone(), target)
        });
        state.async_flows.insert(operation, deadline);
    }

    fn complete_async_flow(&mut self, unit: UnitKey, operation: u64, result: Result<(), Failure>) {
        let Some(state) = self.units.get_mut(&unit) else {
            return;
        };
        let Some(deadline) = state.async_flows.shift_remove(&operation) else {
            debug!(process = %self.id, unit = %unit, operation, "late asynchronous flow completion ignored");
            return;
        };
        if let Some(deadline) = deadline {
            self.runtime.monitor.cancel(deadline);
        }
        if let Err(failure) = result {
            state.async_failure.get_or_insert(failure);
        }
        self.check_suspended(unit);
    }

    fn expire(&mut self, target: DeadlineTarget) {
        match target {
            DeadlineTarget::Sourcing { container, attempt } => {
                let resolution = self.containers.get_mut(&container).and_then(|c| c.expire(attempt));
                if resolution.is_some() {
                    self.runtime.metrics.record_timeout();
                    warn!(process = %self.id, container = %container, attempt, "dependency timed out");
                }
                self.resolve(resolution);
            }
            DeadlineTarget::Operation { container, operation } => {
                let Some(timeout) = self.containers.get(&container).map(|c| self.operation_timeout(c)) else {
                    return;
                };
                let resolution = self
                    .containers
                    .get_mut(&container)
                    .and_then(|c| c.expire_operation(operation, timeout));
                if resolution.is_some() {
                    self.runtime.metrics.record_timeout();
                    warn!(process = %self.id, container = %container, operation, "asynchronous operation timed out");
                }
                self.resolve(resolution);
            }
            DeadlineTarget::AsyncFlow { unit, operation } => {
                let Some(state) = self.units.get_mut(&unit) else {
                    return;
                };
                if state.async_flows.shift_remove(&operation).is_none() {
                    return;
                }
                self.runtime.metrics.record_timeout();
                let timeout = self.runtime.async_timeout(&state.function);
                warn!(process = %self.id, unit = %unit, operation, "asynchronous flow timed out");
                state.async_failure.get_or_insert(Failure::AsynchronousOperationTimeout {
                    operation: format!("{} asynchronous flow {}", state.function, operation),
                    timeout,
                });
                self.check_suspended(unit);
            }
        }
    }
}
