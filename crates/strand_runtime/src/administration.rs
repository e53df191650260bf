//! Step expansion: administration duties, governance and `next` chaining.
//!
//! Invoking a function is a queue of steps: its pre-administration, the
//! function itself, then (once it completes) its post-administration and
//! whatever comes next. Administration steps pass their input parameter
//! through unchanged.

use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use strand_plan::{AdministrationKind, AdministrationTemplate, OfficeGraph};

/// Kind of execution unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitKind {
    /// Invokes a function
    Function,
    /// Administration duty around a function
    Duty,
    /// Governance activity around a function
    Governance,
}

impl From<AdministrationKind> for UnitKind {
    fn from(kind: AdministrationKind) -> Self {
        match kind {
            AdministrationKind::Duty => Self::Duty,
            AdministrationKind::Governance => Self::Governance,
        }
    }
}

/// What a step runs
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum StepAction {
    Invoke(Arc<str>),
    Administer {
        kind: UnitKind,
        function: Arc<str>,
        extensions: Vec<String>,
        administered: Arc<str>,
    },
}

impl StepAction {
    pub(crate) fn function(&self) -> &Arc<str> {
        match self {
            Self::Invoke(function) | Self::Administer { function, .. } => function,
        }
    }
}

/// A pending step; `parameter` overrides the value carried from the previous step
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Step {
    pub(crate) action: StepAction,
    pub(crate) parameter: Option<Value>,
}

fn administer(template: &AdministrationTemplate, administered: &Arc<str>) -> Step {
    Step {
        action: StepAction::Administer {
            kind: template.kind.into(),
            function: Arc::from(template.function.as_str()),
            extensions: template.extensions.clone(),
            administered: Arc::clone(administered),
        },
        parameter: None,
    }
}

/// Steps that invoke `function`: pre-administration, then the function
///
/// `parameter` is handed to the first step and passed through the rest.
pub(crate) fn expand(graph: &OfficeGraph, function: &str, parameter: Option<Value>) -> VecDeque<Step> {
    let name: Arc<str> = Arc::from(function);
    let mut steps: VecDeque<Step> = graph
        .function(function)
        .map(|t| t.pre_administration.iter().map(|a| administer(a, &name)).collect())
        .unwrap_or_default();
    steps.push_back(Step {
        action: StepAction::Invoke(name),
        parameter: None,
    });
    if let Some(first) = steps.front_mut() {
        first.parameter = parameter;
    }
    steps
}

/// Post-administration steps of `function`
pub(crate) fn post_steps(graph: &OfficeGraph, function: &str) -> VecDeque<Step> {
    let name: Arc<str> = Arc::from(function);
    graph
        .function(function)
        .map(|t| t.post_administration.iter().map(|a| administer(a, &name)).collect())
        .unwrap_or_default()
}

/// Steps that follow a completed function
///
/// `next` is an explicit continuation chosen by the body; otherwise the
/// template's `next` is used.
pub(crate) fn continuation(graph: &OfficeGraph, function: &str, next: Option<(String, Value)>) -> VecDeque<Step> {
    let mut steps = post_steps(graph, function);
    let chained = match next {
        Some((name, parameter)) => Some(expand(graph, &name, Some(parameter))),
        None => graph
            .function(function)
            .and_then(|t| t.next.as_deref())
            .map(|name| expand(graph, name, None)),
    };
    steps.extend(chained.into_iter().flatten());
    steps
}
