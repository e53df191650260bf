//! STRAND Core Types
//!
//! Pure types shared by the planner and the runtime: identifiers,
//! logical time, failure classes and the core error type.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod class;
pub mod error;
pub mod id;
pub mod time;

// Re-exports
pub use class::FailureClass;
pub use error::{CoreError, CoreResult};
pub use id::{ContainerKey, FlowKey, KeyAllocator, ProcessId, ThreadKey, UnitKey};
pub use time::{LogicalTime, Timeout};
