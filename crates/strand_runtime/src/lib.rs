//! STRAND Runtime
//!
//! Execution core: turns an office graph into live processes. A process
//! owns thread contexts, thread contexts own flows, flows own execution
//! units. Units park on resource containers, run on teams, spawn further
//! units and escalate failures to handler flows until every flow is done
//! and the process is released.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod administration;
pub mod clock;
pub mod config;
pub mod container;
pub mod error;
pub mod escalation;
pub mod flow;
pub mod monitor;
pub mod office;
pub mod pool;
pub mod process;
pub mod source;
mod state;
pub mod team;
pub mod thread;
pub mod unit;

pub use administration::UnitKind;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::RuntimeConfig;
pub use container::{Container, ContainerState};
pub use error::{Failure, RuntimeError, UnitResult};
pub use escalation::{HandlerChoice, HandlerScope, select_handler};
pub use flow::{FlowCallback, FlowOptions, FlowOutcome};
pub use monitor::{AssetMonitor, DeadlineId, DeadlineTarget, MetricsSnapshot, RuntimeMetrics};
pub use office::{DEFAULT_TEAM, Office, OfficeBuilder, spawn_ticker};
pub use pool::{IdlePool, Instance, InstancePool, PooledInstance};
pub use process::{ProcessHandle, ProcessOptions, ProcessOutcome, ProcessSnapshot};
pub use source::{ConstructSource, Recycle, ResourceSource, SourceCompletion, SourceRequest, Sourcing};
pub use team::{DedicatedTeam, Job, PassThroughTeam, SharedTeam, Team, TeamError, WorkerContext};
pub use thread::EscalationLevel;
pub use unit::{AsynchronousFlow, ContainerOperation, UnitContext, UnitFunction, UnitPhase};
