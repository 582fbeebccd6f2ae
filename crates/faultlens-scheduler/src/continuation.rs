//! Continuation directives — what a workflow wants to happen after a step.

use faultlens_core::{Scenario, SourceEvent};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Returned by every agent step; consumed by the schedule state machine and the
/// activation loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Continuation {
    /// The workflow is finished.
    Done,
    /// Resume after the given delay.
    WaitForTime(Duration),
    /// Resume when this exact event is signalled.
    WaitForFabricEvent(SourceEvent),
    /// Resume when an event with this scenario arrives for the workflow's target.
    WaitForScenario(Scenario),
    /// Resume through `update_analysis` when the registered interest predicate matches.
    WaitForInterest,
}

/// Discriminant of [`Continuation`], for logging and cheap comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContinuationKind {
    Done,
    WaitForTime,
    WaitForFabricEvent,
    WaitForScenario,
    WaitForInterest,
}

impl Continuation {
    pub fn done() -> Self {
        Continuation::Done
    }

    pub fn resume_after(delay: Duration) -> Self {
        Continuation::WaitForTime(delay)
    }

    pub fn resume_on_fabric_event(event: SourceEvent) -> Self {
        Continuation::WaitForFabricEvent(event)
    }

    pub fn resume_on_scenario(scenario: Scenario) -> Self {
        Continuation::WaitForScenario(scenario)
    }

    pub fn wait_for_interest() -> Self {
        Continuation::WaitForInterest
    }

    /// Due on the very next activation pass.
    pub fn resume_immediately() -> Self {
        Continuation::WaitForTime(Duration::ZERO)
    }

    pub fn kind(&self) -> ContinuationKind {
        match self {
            Continuation::Done => ContinuationKind::Done,
            Continuation::WaitForTime(_) => ContinuationKind::WaitForTime,
            Continuation::WaitForFabricEvent(_) => ContinuationKind::WaitForFabricEvent,
            Continuation::WaitForScenario(_) => ContinuationKind::WaitForScenario,
            Continuation::WaitForInterest => ContinuationKind::WaitForInterest,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Continuation::Done)
    }

    /// Directives that are satisfied by an incoming signal rather than a timer.
    pub fn waits_for_signal(&self) -> bool {
        matches!(
            self,
            Continuation::WaitForFabricEvent(_)
                | Continuation::WaitForScenario(_)
                | Continuation::WaitForInterest
        )
    }
}

impl PartialEq for Continuation {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Continuation::WaitForTime(a), Continuation::WaitForTime(b)) => a == b,
            (Continuation::WaitForFabricEvent(a), Continuation::WaitForFabricEvent(b)) => a == b,
            _ => self.kind() == other.kind(),
        }
    }
}

impl Eq for Continuation {}

impl std::fmt::Display for Continuation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Continuation::Done => write!(f, "done"),
            Continuation::WaitForTime(d) => write!(f, "wait-for-time({}ms)", d.as_millis()),
            Continuation::WaitForFabricEvent(e) => write!(f, "wait-for-event({})", e.label()),
            Continuation::WaitForScenario(s) => write!(f, "wait-for-scenario({s})"),
            Continuation::WaitForInterest => write!(f, "wait-for-interest"),
        }
    }
}
