//! The office graph: every template the runtime needs, indexed by name.
//!
//! The graph is built once (in code or from a JSON document) and is
//! immutable afterwards. The runtime only ever reads it.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::Path;
use strand_core::{CoreError, CoreResult, FailureClass};

use crate::function::{EscalationMapping, FunctionTemplate};
use crate::resource::ResourceTemplate;
use crate::team::TeamTemplate;

/// Serialized form of an office graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct GraphDocument {
    /// Function templates
    #[serde(default)]
    pub functions: Vec<FunctionTemplate>,
    /// Resource templates
    #[serde(default)]
    pub resources: Vec<ResourceTemplate>,
    /// Teams
    #[serde(default)]
    pub teams: Vec<TeamTemplate>,
    /// Process-level escalation procedure
    #[serde(default)]
    pub escalations: Vec<EscalationMapping>,
    /// Process-wide default handler
    #[serde(default)]
    pub default_handler: Option<String>,
}

/// Immutable metadata graph
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OfficeGraph {
    functions: IndexMap<String, FunctionTemplate>,
    resources: IndexMap<String, ResourceTemplate>,
    teams: IndexMap<String, TeamTemplate>,
    escalations: Vec<EscalationMapping>,
    default_handler: Option<String>,
}

impl OfficeGraph {
    /// Start building a graph
    #[must_use]
    pub fn builder() -> OfficeGraphBuilder {
        OfficeGraphBuilder::default()
    }

    /// Build a graph from its document form
    ///
    /// # Errors
    ///
    /// Returns error if two templates of the same kind share a name
    pub fn from_document(document: GraphDocument) -> CoreResult<Self> {
        let mut builder = Self::builder();
        for function in document.functions {
            builder = builder.function(function);
        }
        for resource in document.resources {
            builder = builder.resource(resource);
        }
        for team in document.teams {
            builder = builder.team(team);
        }
        for mapping in document.escalations {
            builder = builder.escalation(mapping.class, mapping.handler);
        }
        if let Some(handler) = document.default_handler {
            builder = builder.default_handler(handler);
        }
        builder.build()
    }

    /// Parse a graph from JSON
    ///
    /// # Errors
    ///
    /// Returns error on malformed JSON or duplicate names
    pub fn from_json(json: &str) -> CoreResult<Self> {
        let document: GraphDocument = serde_json::from_str(json)?;
        Self::from_document(document)
    }

    /// Load a graph from a JSON file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed
    pub fn from_json_file(path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| CoreError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        tracing::debug!(path = %path.display(), bytes = json.len(), "loading office graph");
        Self::from_json(&json)
    }

    /// Document form of this graph
    #[must_use]
    pub fn to_document(&self) -> GraphDocument {
        GraphDocument {
            functions: self.functions.values().cloned().collect(),
            resources: self.resources.values().cloned().collect(),
            teams: self.teams.values().cloned().collect(),
            escalations: self.escalations.clone(),
            default_handler: self.default_handler.clone(),
        }
    }

    /// Get a function template
    #[must_use]
    pub fn function(&self, name: &str) -> Option<&FunctionTemplate> {
        self.functions.get(name)
    }

    /// Get a resource template
    #[must_use]
    pub fn resource(&self, name: &str) -> Option<&ResourceTemplate> {
        self.resources.get(name)
    }

    /// Get a team template
    #[must_use]
    pub fn team(&self, name: &str) -> Option<&TeamTemplate> {
        self.teams.get(name)
    }

    /// All function templates in declaration order
    pub fn functions(&self) -> impl Iterator<Item = &FunctionTemplate> {
        self.functions.values()
    }

    /// All resource templates in declaration order
    pub fn resources(&self) -> impl Iterator<Item = &ResourceTemplate> {
        self.resources.values()
    }

    /// All team templates in declaration order
    pub fn teams(&self) -> impl Iterator<Item = &TeamTemplate> {
        self.teams.values()
    }

    /// Process-level escalation procedure
    #[must_use]
    pub fn escalations(&self) -> &[EscalationMapping] {
        &self.escalations
    }

    /// Process-wide default handler
    #[must_use]
    pub fn default_handler(&self) -> Option<&str> {
        self.default_handler.as_deref()
    }

    /// Number of function templates
    #[must_use]
    pub fn function_count(&self) -> usize {
        self.functions.len()
    }

    /// Number of resource templates
    #[must_use]
    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    /// Check if graph has no functions
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

/// Incremental graph builder
#[derive(Debug, Default)]
pub struct OfficeGraphBuilder {
    functions: Vec<FunctionTemplate>,
    resources: Vec<ResourceTemplate>,
    teams: Vec<TeamTemplate>,
    escalations: Vec<EscalationMapping>,
    default_handler: Option<String>,
}

impl OfficeGraphBuilder {
    /// Add a function template
    #[must_use]
    pub fn function(mut self, template: FunctionTemplate) -> Self {
        self.functions.push(template);
        self
    }

    /// Add a resource template
    #[must_use]
    pub fn resource(mut self, template: ResourceTemplate) -> Self {
        self.resources.push(template);
        self
    }

    /// Add a team
    #[must_use]
    pub fn team(mut self, template: TeamTemplate) -> Self {
        self.teams.push(template);
        self
    }

    /// Append to the process-level escalation procedure
    #[must_use]
    pub fn escalation(mut self, class: impl Into<FailureClass>, handler: impl Into<String>) -> Self {
        self.escalations.push(EscalationMapping::new(class, handler));
        self
    }

    /// Set the process-wide default handler
    #[must_use]
    pub fn default_handler(mut self, handler: impl Into<String>) -> Self {
        self.default_handler = Some(handler.into());
        self
    }

    /// Assemble the graph
    ///
    /// # Errors
    ///
    /// Returns error if two templates of the same kind share a name
    pub fn build(self) -> CoreResult<OfficeGraph> {
        Ok(OfficeGraph {
            functions: index_unique("Function", self.functions, |f| &f.name)?,
            resources: index_unique("Resource", self.resources, |r| &r.name)?,
            teams: index_unique("Team", self.teams, |t| &t.name)?,
            escalations: self.escalations,
            default_handler: self.default_handler,
        })
    }
}

fn index_unique<T>(
    kind: &str,
    items: Vec<T>,
    name: impl Fn(&T) -> &String,
) -> CoreResult<IndexMap<String, T>> {
    let mut indexed = IndexMap::with_capacity(items.len());
    for item in items {
        let key = name(&item).clone();
        if indexed.contains_key(&key) {
            return Err(CoreError::AlreadyExists {
                kind: kind.to_string(),
                id: key,
            });
        }
        indexed.insert(key, item);
    }
    Ok(indexed)
}
