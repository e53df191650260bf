//! Escalation procedure: which handler takes a failure.
//!
//! Handlers are searched from the narrowest place outwards: the failing
//! unit's function, the flow it ran in and the flows that spawned it
//! (nearest first), the office mappings and finally the office default
//! handler. A mapping matches when its class is the failure class or one of
//! its ancestors. Along one chain of handler flows a handler is never chosen
//! twice, so a handler that fails again escalates further out instead of
//! looping.

use strand_core::FailureClass;
use strand_plan::{EscalationMapping, OfficeGraph};

/// Where a handler was found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerScope {
    /// The failing function's template
    Function,
    /// Handlers of the failing flow or a flow enclosing it
    Flow,
    /// Office-wide mappings
    Office,
    /// Office default handler
    Default,
}

/// Chosen handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerChoice {
    /// Handler function
    pub handler: String,
    /// Where it was found
    pub scope: HandlerScope,
}

/// Pick the handler for `class`, skipping handlers in `exclude`
#[must_use]
pub fn select_handler(
    class: &FailureClass,
    function: &[EscalationMapping],
    flow: &[EscalationMapping],
    graph: &OfficeGraph,
    exclude: &[String],
) -> Option<HandlerChoice> {
    let usable = |handler: &str| !exclude.iter().any(|used| used == handler);
    let search = |mappings: &[EscalationMapping], scope: HandlerScope| {
        mappings
            .iter()
            .find(|m| m.class.is_assignable_from(class) && usable(&m.handler))
            .map(|m| HandlerChoice {
                handler: m.handler.clone(),
                scope,
            })
    };

    search(function, HandlerScope::Function)
        .or_else(|| search(flow, HandlerScope::Flow))
        .or_else(|| search(graph.escalations(), HandlerScope::Office))
        .or_else(|| {
            graph
                .default_handler()
                .filter(|handler| usable(handler))
                .map(|handler| HandlerChoice {
                    handler: handler.to_string(),
                    scope: HandlerScope::Default,
                })
        })
}
