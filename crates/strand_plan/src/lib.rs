//! STRAND Planner
//!
//! The immutable metadata graph consumed by the runtime: function
//! templates, resource templates, teams and the escalation procedure.
//! Graphs are assembled in code or loaded from JSON and validated once
//! before an office is built from them.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod function;
pub mod graph;
pub mod resource;
pub mod team;
pub mod validate;

pub use function::{AdministrationKind, AdministrationTemplate, EscalationMapping, FunctionTemplate};
pub use graph::{GraphDocument, OfficeGraph, OfficeGraphBuilder};
pub use resource::{Capabilities, PoolTemplate, ResourceTemplate, Scope};
pub use team::{TeamKind, TeamTemplate};
pub use validate::{ValidationError, Validator};
