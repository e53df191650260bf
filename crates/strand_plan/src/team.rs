//! Team (worker pool) descriptors.

use serde::{Deserialize, Serialize};

/// Concurrency strategy of a team
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TeamKind {
    /// Runs units synchronously on the caller's thread
    #[default]
    PassThrough,
    /// Owns a fixed number of worker threads
    Dedicated {
        /// Worker thread count
        threads: usize,
    },
    /// Runs on the workers of another team
    Shared {
        /// Team whose workers are shared
        team: String,
    },
}

/// Named team descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamTemplate {
    /// Team name
    pub name: String,
    /// Strategy
    #[serde(flatten)]
    pub kind: TeamKind,
}

impl TeamTemplate {
    /// Pass-through team
    #[must_use]
    pub fn pass_through(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: TeamKind::PassThrough,
        }
    }

    /// Team with dedicated worker threads
    #[must_use]
    pub fn dedicated(name: impl Into<String>, threads: usize) -> Self {
        Self {
            name: name.into(),
            kind: TeamKind::Dedicated { threads },
        }
    }

    /// Team sharing another team's workers
    #[must_use]
    pub fn shared(name: impl Into<String>, team: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: TeamKind::Shared { team: team.into() },
        }
    }
}
