//! Interest predicates — which future events a suspended workflow wants to see.

use faultlens_core::{Scenario, SourceEvent};
use serde::{Deserialize, Serialize};

/// Serializable filter registered by a suspended workflow. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "match", rename_all = "snake_case")]
pub enum InterestPredicate {
    /// Match one remembered event exactly.
    ExactEvent { event: SourceEvent },
    /// Match any event with this scenario for this target id.
    Scenario { scenario: Scenario, target_id: String },
    /// Exact event first, otherwise the scenario pair.
    Either {
        event: SourceEvent,
        scenario: Scenario,
        target_id: String,
    },
}

impl InterestPredicate {
    pub fn for_event(event: SourceEvent) -> Self {
        InterestPredicate::ExactEvent { event }
    }

    pub fn for_scenario(scenario: Scenario, target_id: impl Into<String>) -> Self {
        InterestPredicate::Scenario {
            scenario,
            target_id: target_id.into(),
        }
    }

    /// Remember `event` and also accept later events of the same scenario on its target.
    pub fn for_event_or_scenario(event: SourceEvent) -> Self {
        InterestPredicate::Either {
            scenario: event.scenario,
            target_id: event.target_id.clone(),
            event,
        }
    }

    pub fn is_match(&self, event: &SourceEvent) -> bool {
        match self {
            InterestPredicate::ExactEvent { event: wanted } => wanted == event,
            InterestPredicate::Scenario { scenario, target_id } => {
                scenario_matches(*scenario, target_id, event)
            }
            InterestPredicate::Either {
                event: wanted,
                scenario,
                target_id,
            } => wanted == event || scenario_matches(*scenario, target_id, event),
        }
    }
}

fn scenario_matches(scenario: Scenario, target_id: &str, event: &SourceEvent) -> bool {
    event.scenario == scenario && event.target_id == target_id
}

impl std::fmt::Display for InterestPredicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InterestPredicate::ExactEvent { event } => write!(f, "event {}", event.label()),
            InterestPredicate::Scenario { scenario, target_id } => {
                write!(f, "{scenario} on {target_id}")
            }
            InterestPredicate::Either { event, .. } => {
                write!(f, "event {} or its scenario", event.label())
            }
        }
    }
}
