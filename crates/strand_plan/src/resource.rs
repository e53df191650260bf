//! Resource templates: how a dependency is sourced, scoped and pooled.

use serde::{Deserialize, Serialize};
use strand_core::Timeout;

/// Lifetime of a resource container
///
/// Ordered from narrowest to broadest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// One container per execution unit
    Unit,
    /// One container per thread context
    Thread,
    /// One container per process
    #[default]
    Process,
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unit => write!(f, "unit"),
            Self::Thread => write!(f, "thread"),
            Self::Process => write!(f, "process"),
        }
    }
}

/// Pool settings for a resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolTemplate {
    /// Maximum idle instances kept for reuse
    pub max_idle: usize,
}

impl Default for PoolTemplate {
    fn default() -> Self {
        Self { max_idle: 16 }
    }
}

/// Orthogonal container capabilities, resolved once per template
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    /// Source may answer later through `provide`/`fail`
    pub supports_async: bool,
    /// Instances are taken from and returned to a pool
    pub supports_pooling: bool,
    /// Other resources must be ready before sourcing
    pub depends_on_others: bool,
}

/// Template for a resource container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceTemplate {
    /// Bound name used by functions
    pub name: String,
    /// Key of the source bound at office build time (defaults to the name)
    #[serde(default)]
    pub source: Option<String>,
    /// Container scope
    #[serde(default)]
    pub scope: Scope,
    /// Whether the source may answer asynchronously
    #[serde(default)]
    pub asynchronous: bool,
    /// Pool settings
    #[serde(default)]
    pub pool: Option<PoolTemplate>,
    /// Deadline for sourcing and asynchronous operations
    #[serde(default)]
    pub timeout: Timeout,
    /// Resources that must be ready before this one is sourced
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl ResourceTemplate {
    /// Create a synchronous, process-scoped, unpooled resource
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: None,
            scope: Scope::Process,
            asynchronous: false,
            pool: None,
            timeout: Timeout::NONE,
            depends_on: Vec::new(),
        }
    }

    /// Bind to a differently named source
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Set the scope
    #[must_use]
    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    /// Allow asynchronous sourcing
    #[must_use]
    pub fn asynchronous(mut self) -> Self {
        self.asynchronous = true;
        self
    }

    /// Enable pooling
    #[must_use]
    pub fn with_pool(mut self, pool: PoolTemplate) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Set the sourcing / operation timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Timeout) -> Self {
        self.timeout = timeout;
        self
    }

    /// Add a prerequisite resource
    #[must_use]
    pub fn depends_on(mut self, resource: impl Into<String>) -> Self {
        self.depends_on.push(resource.into());
        self
    }

    /// Source key this resource is bound to
    #[must_use]
    pub fn source_key(&self) -> &str {
        self.source.as_deref().unwrap_or(&self.name)
    }

    /// Capabilities implied by this template
    #[must_use]
    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_async: self.asynchronous,
            supports_pooling: self.pool.is_some(),
            depends_on_others: !self.depends_on.is_empty(),
        }
    }
}
