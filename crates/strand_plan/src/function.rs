//! Function templates and the wiring between them.

use serde::{Deserialize, Serialize};
use strand_core::{FailureClass, Timeout};

/// Maps a failure class to the function that handles it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationMapping {
    /// Class caught by this mapping (and every class nested beneath it)
    #[serde(default)]
    pub class: FailureClass,
    /// Function started as the handling flow
    pub handler: String,
}

impl EscalationMapping {
    /// Create a mapping
    #[must_use]
    pub fn new(class: impl Into<FailureClass>, handler: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            handler: handler.into(),
        }
    }
}

/// Kind of administrative step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AdministrationKind {
    /// Administration duty
    #[default]
    Duty,
    /// Governance activity
    Governance,
}

/// An administrative step run around a function
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdministrationTemplate {
    /// Duty or governance
    #[serde(default)]
    pub kind: AdministrationKind,
    /// Function implementing the step
    pub function: String,
    /// Resources whose extension interfaces the step receives
    #[serde(default)]
    pub extensions: Vec<String>,
}

impl AdministrationTemplate {
    /// Create a duty
    #[must_use]
    pub fn duty(function: impl Into<String>) -> Self {
        Self {
            kind: AdministrationKind::Duty,
            function: function.into(),
            extensions: Vec::new(),
        }
    }

    /// Create a governance activity
    #[must_use]
    pub fn governance(function: impl Into<String>) -> Self {
        Self {
            kind: AdministrationKind::Governance,
            function: function.into(),
            extensions: Vec::new(),
        }
    }

    /// Administer the extension interface of a resource
    #[must_use]
    pub fn over(mut self, resource: impl Into<String>) -> Self {
        self.extensions.push(resource.into());
        self
    }
}

/// Template for an execution unit that invokes a function
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionTemplate {
    /// Function name; also the key its body is bound under
    pub name: String,
    /// Team that runs the function (default team when absent)
    #[serde(default)]
    pub team: Option<String>,
    /// Resource names, in dependency-index order
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Sequential continuation
    #[serde(default)]
    pub next: Option<String>,
    /// Unit-level escalation handlers, in declaration order
    #[serde(default)]
    pub escalations: Vec<EscalationMapping>,
    /// Steps run before the function
    #[serde(default)]
    pub pre_administration: Vec<AdministrationTemplate>,
    /// Steps run after the function
    #[serde(default)]
    pub post_administration: Vec<AdministrationTemplate>,
    /// Deadline for asynchronous sub-operations (runtime default when absent)
    #[serde(default)]
    pub async_timeout: Option<Timeout>,
}

impl FunctionTemplate {
    /// Create a template with no wiring
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            team: None,
            dependencies: Vec::new(),
            next: None,
            escalations: Vec::new(),
            pre_administration: Vec::new(),
            post_administration: Vec::new(),
            async_timeout: None,
        }
    }

    /// Run on a named team
    #[must_use]
    pub fn on_team(mut self, team: impl Into<String>) -> Self {
        self.team = Some(team.into());
        self
    }

    /// Add a dependency
    #[must_use]
    pub fn depends_on(mut self, resource: impl Into<String>) -> Self {
        self.dependencies.push(resource.into());
        self
    }

    /// Set the sequential continuation
    #[must_use]
    pub fn then(mut self, next: impl Into<String>) -> Self {
        self.next = Some(next.into());
        self
    }

    /// Add a unit-level handler
    #[must_use]
    pub fn handle(mut self, class: impl Into<FailureClass>, handler: impl Into<String>) -> Self {
        self.escalations.push(EscalationMapping::new(class, handler));
        self
    }

    /// Add a pre-administration step
    #[must_use]
    pub fn before(mut self, step: AdministrationTemplate) -> Self {
        self.pre_administration.push(step);
        self
    }

    /// Add a post-administration step
    #[must_use]
    pub fn after(mut self, step: AdministrationTemplate) -> Self {
        self.post_administration.push(step);
        self
    }

    /// Set the asynchronous sub-operation timeout
    #[must_use]
    pub fn with_async_timeout(mut self, timeout: Timeout) -> Self {
        self.async_timeout = Some(timeout);
        self
    }

    /// Index of a dependency by name
    #[must_use]
    pub fn dependency_index(&self, resource: &str) -> Option<usize> {
        self.dependencies.iter().position(|d| d == resource)
    }

    /// Every function this template refers to
    pub fn referenced_functions(&self) -> impl Iterator<Item = &str> {
        self.next
            .iter()
            .map(String::as_str)
            .chain(self.escalations.iter().map(|m| m.handler.as_str()))
            .chain(self.pre_administration.iter().map(|a| a.function.as_str()))
            .chain(self.post_administration.iter().map(|a| a.function.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_template_builder() {
        let template = FunctionTemplate::new("checkout")
            .on_team("io")
            .depends_on("db")
            .depends_on("cache")
            .then("confirm")
            .handle("app.payment", "refund");

        assert_eq!(template.team.as_deref(), Some("io"));
        assert_eq!(template.dependency_index("cache"), Some(1));
        assert_eq!(template.dependency_index("missing"), None);
        assert_eq!(template.escalations[0].class.as_str(), "app.payment");
    }

    #[test]
    fn test_referenced_functions() {
        let template = FunctionTemplate::new("f")
            .then("g")
            .handle("x", "h")
            .before(AdministrationTemplate::duty("audit"))
            .after(AdministrationTemplate::governance("commit"));

        let refs: Vec<&str> = template.referenced_functions().collect();
        assert_eq!(refs, vec!["g", "h", "audit", "commit"]);
    }

    #[test]
    fn test_function_from_json() {
        let template: FunctionTemplate = serde_json::from_str(
            r#"{
                "name": "load",
                "dependencies": ["db"],
                "escalations": [{"class": "strand.dependency", "handler": "fallback"}],
                "pre_administration": [{"kind": "governance", "function": "tx", "extensions": ["db"]}]
            }"#,
        )
        .unwrap();

        assert_eq!(template.dependencies, vec!["db"]);
        assert_eq!(template.pre_administration[0].kind, AdministrationKind::Governance);
        assert!(template.next.is_none());
    }
}
