//! Office graph validator.
//!
//! Catches dangling references, broken team wiring, scope inversions and
//! prerequisite cycles before any process is started.

use crate::graph::OfficeGraph;
use crate::team::TeamKind;
use indexmap::IndexSet;

/// Validation error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// A function refers to a function that does not exist
    #[error("{owner} refers to unknown function {function}")]
    UnknownFunction {
        /// Referring template (or "office")
        owner: String,
        /// Missing function
        function: String,
    },
    /// A function or resource refers to a resource that does not exist
    #[error("{owner} refers to unknown resource {resource}")]
    UnknownResource {
        /// Referring template
        owner: String,
        /// Missing resource
        resource: String,
    },
    /// A function or team refers to a team that does not exist
    #[error("{owner} refers to unknown team {team}")]
    UnknownTeam {
        /// Referring template
        owner: String,
        /// Missing team
        team: String,
    },
    /// Invalid team settings
    #[error("Invalid team {team}: {reason}")]
    InvalidTeam {
        /// Team name
        team: String,
        /// What is wrong with it
        reason: String,
    },
    /// Prerequisite cycle between resources
    #[error("Resource prerequisite cycle: {resources:?}")]
    Cycle {
        /// Resources on the cycle
        resources: Vec<String>,
    },
    /// A resource depends on one with a narrower scope
    #[error("Resource {resource} ({scope}) cannot depend on narrower {prerequisite} ({prerequisite_scope})")]
    ScopeInversion {
        /// Dependent resource
        resource: String,
        /// Its scope
        scope: String,
        /// Prerequisite resource
        prerequisite: String,
        /// Prerequisite scope
        prerequisite_scope: String,
    },
}

/// Validator for office graphs
pub struct Validator {
    /// Maximum worker threads a single dedicated team may request (0 = no limit)
    pub max_team_threads: usize,
}

impl Validator {
    /// Create a new validator
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_team_threads: 0,
        }
    }

    /// Set the per-team thread limit
    #[must_use]
    pub fn with_max_team_threads(mut self, max: usize) -> Self {
        self.max_team_threads = max;
        self
    }

    /// Validate a graph
    ///
    /// # Errors
    ///
    /// Returns every problem found
    pub fn validate(&self, graph: &OfficeGraph) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        self.check_functions(graph, &mut errors);
        self.check_office_handlers(graph, &mut errors);
        self.check_teams(graph, &mut errors);
        self.check_resources(graph, &mut errors);

        if let Err(e) = self.check_cycles(graph) {
            errors.push(e);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn check_functions(&self, graph: &OfficeGraph, errors: &mut Vec<ValidationError>) {
        for function in graph.functions() {
            for referenced in function.referenced_functions() {
                if graph.function(referenced).is_none() {
                    errors.push(ValidationError::UnknownFunction {
                        owner: function.name.clone(),
                        function: referenced.to_string(),
                    });
                }
            }

            let administered = function
                .pre_administration
                .iter()
                .chain(&function.post_administration)
                .flat_map(|a| a.extensions.iter());
            for resource in function.dependencies.iter().chain(administered) {
                if graph.resource(resource).is_none() {
                    errors.push(ValidationError::UnknownResource {
                        owner: function.name.clone(),
                        resource: resource.clone(),
                    });
                }
            }

            if let Some(team) = &function.team {
                if graph.team(team).is_none() {
                    errors.push(ValidationError::UnknownTeam {
                        owner: function.name.clone(),
                        team: team.clone(),
                    });
                }
            }
        }
    }

    fn check_office_handlers(&self, graph: &OfficeGraph, errors: &mut Vec<ValidationError>) {
        let handlers = graph
            .escalations()
            .iter()
            .map(|m| m.handler.as_str())
            .chain(graph.default_handler());
        for handler in handlers {
            if graph.function(handler).is_none() {
                errors.push(ValidationError::UnknownFunction {
                    owner: "office".to_string(),
                    function: handler.to_string(),
                });
            }
        }
    }

    fn check_teams(&self, graph: &OfficeGraph, errors: &mut Vec<ValidationError>) {
        for team in graph.teams() {
            match &team.kind {
                TeamKind::PassThrough => {}
                TeamKind::Dedicated { threads } => {
                    if *threads == 0 {
                        errors.push(ValidationError::InvalidTeam {
                            team: team.name.clone(),
                            reason: "dedicated team needs at least one thread".to_string(),
                        });
                    } else if self.max_team_threads > 0 && *threads > self.max_team_threads {
                        errors.push(ValidationError::InvalidTeam {
                            team: team.name.clone(),
                            reason: format!("{} threads exceeds limit {}", threads, self.max_team_threads),
                        });
                    }
                }
                TeamKind::Shared { team: target } => match graph.team(target) {
                    None => errors.push(ValidationError::UnknownTeam {
                        owner: team.name.clone(),
                        team: target.clone(),
                    }),
                    Some(t) if matches!(t.kind, TeamKind::Shared { .. }) => {
                        errors.push(ValidationError::InvalidTeam {
                            team: team.name.clone(),
                            reason: format!("shares {} which is itself shared", target),
                        });
                    }
                    Some(_) => {}
                },
            }
        }
    }

    fn check_resources(&self, graph: &OfficeGraph, errors: &mut Vec<ValidationError>) {
        for resource in graph.resources() {
            for prerequisite in &resource.depends_on {
                match graph.resource(prerequisite) {
                    None => errors.push(ValidationError::UnknownResource {
                        owner: resource.name.clone(),
                        resource: prerequisite.clone(),
                    }),
                    Some(p) if p.scope < resource.scope => {
                        errors.push(ValidationError::ScopeInversion {
                            resource: resource.name.clone(),
                            scope: resource.scope.to_string(),
                            prerequisite: p.name.clone(),
                            prerequisite_scope: p.scope.to_string(),
                        });
                    }
                    Some(_) => {}
                }
            }
        }
    }

    /// Check for cycles between resource prerequisites
    fn check_cycles(&self, graph: &OfficeGraph) -> Result<(), ValidationError> {
        let mut visited = IndexSet::new();
        let mut rec_stack = IndexSet::new();

        for resource in graph.resources() {
            if self.dfs_cycle(&resource.name, graph, &mut visited, &mut rec_stack) {
                return Err(ValidationError::Cycle {
                    resources: rec_stack.iter().cloned().collect(),
                });
            }
        }

        Ok(())
    }

    /// DFS cycle detection
    fn dfs_cycle(
        &self,
        name: &str,
        graph: &OfficeGraph,
        visited: &mut IndexSet<String>,
        rec_stack: &mut IndexSet<String>,
    ) -> bool {
        if rec_stack.contains(name) {
            return true;
        }
        if visited.contains(name) {
            return false;
        }

        visited.insert(name.to_string());
        rec_stack.insert(name.to_string());

        if let Some(resource) = graph.resource(name) {
            for prerequisite in &resource.depends_on {
                if self.dfs_cycle(prerequisite, graph, visited, rec_stack) {
                    return true;
                }
            }
        }

        rec_stack.shift_remove(name);
        false
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
    }
}
