//! Office: the assembled runtime.
//!
//! An office combines a validated graph with the function bodies,
//! resource sources, pools and teams bound to it, plus the asset monitor
//! that expires deadlines. Processes are submitted to an office and share
//! its teams; nothing else is shared between them.

use indexmap::IndexMap;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use strand_core::{LogicalTime, Timeout};
use strand_plan::{OfficeGraph, TeamKind, Validator};
use tracing::{debug, info, trace};

use crate::clock::{Clock, SystemClock};
use crate::config::RuntimeConfig;
use crate::error::{RuntimeError, UnitResult};
use crate::monitor::{AssetMonitor, MetricsSnapshot, RuntimeMetrics};
use crate::pool::{IdlePool, InstancePool};
use crate::process::{Message, ProcessCore, ProcessHandle, ProcessOptions};
use crate::source::{ResourceSource, SourceRequest, Sourcing};
use crate::team::{DedicatedTeam, PassThroughTeam, SharedTeam, Team};
use crate::unit::{UnitContext, UnitFunction};

/// Name of the team used when neither the function nor the config names one
pub const DEFAULT_TEAM: &str = "default";

/// Everything a process needs from its office
pub(crate) struct Runtime {
    pub(crate) graph: OfficeGraph,
    pub(crate) bodies: IndexMap<String, Arc<dyn UnitFunction>>,
    /// Sources by resource name
    pub(crate) sources: IndexMap<String, Arc<dyn ResourceSource>>,
    /// Pools by resource name
    pub(crate) pools: IndexMap<String, Arc<dyn InstancePool>>,
    pub(crate) teams: IndexMap<String, Arc<dyn Team>>,
    pub(crate) default_team: Arc<dyn Team>,
    pub(crate) monitor: AssetMonitor,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) config: RuntimeConfig,
    pub(crate) metrics: RuntimeMetrics,
    shut_down: AtomicBool,
}

impl Runtime {
    /// Team that runs `function`
    pub(crate) fn team_for(&self, function: &str) -> Arc<dyn Team> {
        self.graph
            .function(function)
            .and_then(|t| t.team.as_deref())
            .and_then(|name| self.teams.get(name))
            .map_or_else(|| Arc::clone(&self.default_team), Arc::clone)
    }

    /// Asynchronous flow timeout for `function`
    pub(crate) fn async_timeout(&self, function: &str) -> Timeout {
        self.graph
            .function(function)
            .and_then(|t| t.async_timeout)
            .unwrap_or(self.config.default_async_timeout)
    }
}

/// Builder binding implementations to a graph
pub struct OfficeBuilder {
    graph: OfficeGraph,
    config: RuntimeConfig,
    clock: Option<Arc<dyn Clock>>,
    bodies: IndexMap<String, Arc<dyn UnitFunction>>,
    sources: IndexMap<String, Arc<dyn ResourceSource>>,
    pools: IndexMap<String, Arc<dyn InstancePool>>,
    teams: IndexMap<String, Arc<dyn Team>>,
}

impl OfficeBuilder {
    /// Start from a graph
    #[must_use]
    pub fn new(graph: OfficeGraph) -> Self {
        Self {
            graph,
            config: RuntimeConfig::default(),
            clock: None,
            bodies: IndexMap::new(),
            sources: IndexMap::new(),
            pools: IndexMap::new(),
            teams: IndexMap::new(),
        }
    }

    /// Set the runtime configuration
    #[must_use]
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the clock deadlines are measured against
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Bind a body to a function name
    #[must_use]
    pub fn function<F>(self, name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&mut UnitContext<'_>) -> UnitResult + Send + Sync + 'static,
    {
        self.function_impl(name, Arc::new(body))
    }

    /// Bind a body object to a function name
    #[must_use]
    pub fn function_impl(mut self, name: impl Into<String>, body: Arc<dyn UnitFunction>) -> Self {
        self.bodies.insert(name.into(), body);
        self
    }

    /// Bind a source to a source key
    #[must_use]
    pub fn source(mut self, key: impl Into<String>, source: impl ResourceSource + 'static) -> Self {
        self.sources.insert(key.into(), Arc::new(source));
        self
    }

    /// Bind a source closure to a source key
    #[must_use]
    pub fn source_fn<F>(self, key: impl Into<String>, source: F) -> Self
    where
        F: Fn(SourceRequest) -> Result<Sourcing, crate::error::Failure> + Send + Sync + 'static,
    {
        self.source(key, source)
    }

    /// Use a custom pool for a resource instead of the one its template describes
    #[must_use]
    pub fn pool(mut self, resource: impl Into<String>, pool: Arc<dyn InstancePool>) -> Self {
        self.pools.insert(resource.into(), pool);
        self
    }

    /// Use a custom team instead of the one its template describes
    #[must_use]
    pub fn team(mut self, name: impl Into<String>, team: Arc<dyn Team>) -> Self {
        self.teams.insert(name.into(), team);
        self
    }

    /// Validate, bind and start the teams
    ///
    /// # Errors
    ///
    /// Returns error if the graph is invalid, a function or resource is
    /// left unbound, or a team fails to start
    pub fn build(self) -> Result<Office, RuntimeError> {
        let Self {
            graph,
            config,
            clock,
            bodies,
            sources: bound_sources,
            pools: mut custom_pools,
            teams: mut custom_teams,
        } = self;

        Validator::new()
            .with_max_team_threads(config.max_team_threads)
            .validate(&graph)
            .map_err(RuntimeError::InvalidGraph)?;

        if let Some(unbound) = graph.functions().find(|f| !bodies.contains_key(&f.name)) {
            return Err(RuntimeError::UnboundFunction {
                name: unbound.name.clone(),
            });
        }

        let mut sources = IndexMap::new();
        let mut pools = IndexMap::new();
        for resource in graph.resources() {
            let key = resource.source_key();
            let source = bound_sources.get(key).ok_or_else(|| RuntimeError::UnboundSource {
                resource: resource.name.clone(),
                source_key: key.to_string(),
            })?;
            sources.insert(resource.name.clone(), Arc::clone(source));

            let pool = match (custom_pools.shift_remove(&resource.name), &resource.pool) {
                (Some(pool), _) => Some(pool),
                (None, Some(template)) => Some(Arc::new(IdlePool::new(template.max_idle)) as Arc<dyn InstancePool>),
                (None, None) => None,
            };
            if let Some(pool) = pool {
                pools.insert(resource.name.clone(), pool);
            }
        }

        let teams = build_teams(&graph, &mut custom_teams)?;
        let default_team = match config.default_team.as_deref() {
            Some(name) => teams
                .get(name)
                .cloned()
                .ok_or_else(|| RuntimeError::InvalidGraph(vec![strand_plan::ValidationError::UnknownTeam {
                    owner: "config".to_string(),
                    team: name.to_string(),
                }]))?,
            None => Arc::new(PassThroughTeam::new(DEFAULT_TEAM)) as Arc<dyn Team>,
        };

        for team in teams.values() {
            team.start()?;
        }
        default_team.start()?;

        info!(
            functions = graph.function_count(),
            resources = graph.resource_count(),
            teams = teams.len(),
            "office built"
        );

        let runtime = Runtime {
            graph,
            bodies,
            sources,
            pools,
            teams,
            default_team,
            monitor: AssetMonitor::new(),
            clock: clock.unwrap_or_else(|| Arc::new(SystemClock::new())),
            config,
            metrics: RuntimeMetrics::new(),
            shut_down: AtomicBool::new(false),
        };
        Ok(Office {
            runtime: Arc::new(runtime),
        })
    }
}

impl std::fmt::Debug for OfficeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfficeBuilder")
            .field("functions", &self.bodies.keys().collect::<Vec<_>>())
            .field("sources", &self.sources.keys().collect::<Vec<_>>())
            .field("teams", &self.teams.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

// Shared teams resolve against the others, so they are built last
fn build_teams(
    graph: &OfficeGraph,
    custom: &mut IndexMap<String, Arc<dyn Team>>,
) -> Result<IndexMap<String, Arc<dyn Team>>, RuntimeError> {
    let mut teams: IndexMap<String, Arc<dyn Team>> = IndexMap::new();
    for template in graph.teams() {
        let team: Arc<dyn Team> = match (custom.shift_remove(&template.name), &template.kind) {
            (Some(team), _) => team,
            (None, TeamKind::PassThrough) => Arc::new(PassThroughTeam::new(template.name.as_str())),
            (None, TeamKind::Dedicated { threads }) => Arc::new(DedicatedTeam::new(template.name.as_str(), *threads)),
            (None, TeamKind::Shared { .. }) => continue,
        };
        teams.insert(template.name.clone(), team);
    }

    for template in graph.teams() {
        if let TeamKind::Shared { team: target } = &template.kind {
            if teams.contains_key(&template.name) {
                continue;
            }
            let target = teams.get(target).cloned().ok_or_else(|| {
                RuntimeError::InvalidGraph(vec![strand_plan::ValidationError::UnknownTeam {
                    owner: template.name.clone(),
                    team: target.clone(),
                }])
            })?;
            teams.insert(template.name.clone(), Arc::new(SharedTeam::new(template.name.as_str(), target)));
        }
    }

    // Custom teams not named by the graph stay usable as `default_team`
    teams.extend(custom.drain(..));
    Ok(teams)
}

/// Entry point: submits processes and drives the asset monitor
#[derive(Clone)]
pub struct Office {
    runtime: Arc<Runtime>,
}

impl Office {
    /// Start building an office over `graph`
    #[must_use]
    pub fn builder(graph: OfficeGraph) -> OfficeBuilder {
        OfficeBuilder::new(graph)
    }

    /// Start a process running `function` with `parameter`
    ///
    /// # Errors
    ///
    /// Returns error if the function is unknown or the office is shut down
    pub fn submit(&self, function: &str, parameter: Value) -> Result<ProcessHandle, RuntimeError> {
        self.submit_with(function, parameter, ProcessOptions::default())
    }

    /// Start a process with explicit options
    ///
    /// Units on pass-through teams run on the calling thread before this
    /// returns.
    ///
    /// # Errors
    ///
    /// Returns error if the function is unknown or the office is shut down
    pub fn submit_with(
        &self,
        function: &str,
        parameter: Value,
        options: ProcessOptions,
    ) -> Result<ProcessHandle, RuntimeError> {
        if self.runtime.shut_down.load(Ordering::SeqCst) {
            return Err(RuntimeError::ShutDown);
        }
        if self.runtime.graph.function(function).is_none() {
            return Err(RuntimeError::UnknownFunction {
                name: function.to_string(),
            });
        }

        self.runtime.metrics.record_process_started();
        let core = ProcessCore::new(Arc::clone(&self.runtime));
        let ((), effects) = core.with_state(|state| state.start(function, parameter, options));
        let handle = ProcessHandle::new(Arc::clone(&core));
        core.perform(effects);
        Ok(handle)
    }

    /// Expire every deadline due now
    ///
    /// Returns the number of deadlines fired.
    pub fn tick(&self) -> usize {
        self.tick_at(self.runtime.clock.now())
    }

    /// Expire every deadline due at `now`
    pub fn tick_at(&self, now: LogicalTime) -> usize {
        self.runtime.metrics.record_tick();
        let due = self.runtime.monitor.take_due(now);
        let mut fired = 0;
        for expired in due {
            match expired.process.upgrade() {
                Some(process) => {
                    fired += 1;
                    process.deliver(Message::Expired(expired.target));
                }
                None => trace!(target = ?expired.target, "deadline of a dropped process skipped"),
            }
        }
        if fired > 0 {
            debug!(now = %now, fired, "deadlines expired");
        }
        fired
    }

    /// Deadlines still registered
    #[must_use]
    pub fn pending_deadlines(&self) -> usize {
        self.runtime.monitor.pending()
    }

    /// Earliest registered deadline
    #[must_use]
    pub fn next_deadline(&self) -> Option<LogicalTime> {
        self.runtime.monitor.next_deadline()
    }

    /// Current time on the office clock
    #[must_use]
    pub fn now(&self) -> LogicalTime {
        self.runtime.clock.now()
    }

    /// Team by name
    #[must_use]
    pub fn team(&self, name: &str) -> Option<Arc<dyn Team>> {
        self.runtime.teams.get(name).cloned()
    }

    /// Graph this office runs
    #[must_use]
    pub fn graph(&self) -> &OfficeGraph {
        &self.runtime.graph
    }

    /// Runtime configuration
    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.runtime.config
    }

    /// Counter snapshot
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.runtime.metrics.snapshot()
    }

    /// Stop every team and refuse new processes
    ///
    /// Units dispatched afterwards to a dedicated team fail with a
    /// rejection failure.
    pub fn shutdown(&self) {
        if self.runtime.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        for team in self.runtime.teams.values() {
            team.stop();
        }
        self.runtime.default_team.stop();
        info!("office shut down");
    }

    /// Whether `shutdown` was called
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.runtime.shut_down.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Office {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Office")
            .field("functions", &self.runtime.graph.function_count())
            .field("teams", &self.runtime.teams.keys().collect::<Vec<_>>())
            .field("pending_deadlines", &self.runtime.monitor.pending())
            .finish_non_exhaustive()
    }
}

/// Call [`Office::tick`] every `period` on the current tokio runtime
///
/// The task runs until it is aborted or the office is shut down.
#[must_use]
pub fn spawn_ticker(office: Office, period: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            if office.is_shut_down() {
                debug!("ticker stopped");
                break;
            }
            office.tick();
        }
    })
}
