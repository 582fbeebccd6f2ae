//! Analysis workflows — the unit of work tracked end-to-end by the scheduler.
//!
//! A workflow is created by an agent for an eligible trigger signal, mutated by the
//! scheduler before and after each step, and kept in the workflow-body store after
//! it finishes (only its schedule record is deleted).

use chrono::{DateTime, Utc};
use faultlens_core::{SourceEvent, TargetEntity, TriggerSignal};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

use crate::agent::AgentId;
use crate::interest::InterestPredicate;
use crate::schedule::ScheduleStatus;

/// Failure captured from a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepException {
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisWorkflow {
    pub id: Uuid,
    /// Agent that owns this workflow.
    pub agent_id: AgentId,
    pub target: Option<TargetEntity>,
    pub interest: Option<InterestPredicate>,
    /// Signal driving the most recent step.
    pub current_invocation: Option<TriggerSignal>,
    /// Number of steps started; never decreases.
    pub progress: u64,
    pub exceptions: Vec<StepException>,
    /// Mirror of the schedule record status.
    pub status: ScheduleStatus,
    /// Events already delivered to this workflow.
    #[serde(default)]
    pub processed_events: HashSet<SourceEvent>,
    /// Agent-owned state carried between steps.
    #[serde(default)]
    pub context: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl AnalysisWorkflow {
    pub fn new(agent_id: AgentId) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_id,
            target: None,
            interest: None,
            current_invocation: None,
            progress: 0,
            exceptions: Vec::new(),
            status: ScheduleStatus::NotStarted,
            processed_events: HashSet::new(),
            context: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }

    pub fn with_interest(mut self, interest: InterestPredicate) -> Self {
        self.interest = Some(interest);
        self
    }

    pub fn register_interest(&mut self, interest: InterestPredicate) {
        self.interest = Some(interest);
    }

    /// Make `signal` the current invocation and remember its event.
    /// Returns `false` if the event was already delivered.
    pub fn attach_signal(&mut self, signal: TriggerSignal) -> bool {
        let fresh = self.processed_events.insert(signal.event.clone());
        self.current_invocation = Some(signal);
        fresh
    }

    pub fn has_processed(&self, event: &SourceEvent) -> bool {
        self.processed_events.contains(event)
    }

    pub fn advance_progress(&mut self) -> u64 {
        self.progress += 1;
        self.progress
    }

    pub fn record_exception(&mut self, message: impl Into<String>, at: DateTime<Utc>) {
        self.exceptions.push(StepException {
            message: message.into(),
            at,
        });
    }

    /// Target as a display string, for logs.
    pub fn target_label(&self) -> String {
        self.target
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "-".to_string())
    }
}

/// How a workflow ended, as seen by consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowOutcome {
    Finished,
    Failed,
}

/// Handed to consumers when a workflow reaches a terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub workflow: AnalysisWorkflow,
    pub outcome: WorkflowOutcome,
    pub completed_at: DateTime<Utc>,
}

impl WorkflowResult {
    pub fn new(workflow: AnalysisWorkflow, outcome: WorkflowOutcome) -> Self {
        Self {
            workflow,
            outcome,
            completed_at: Utc::now(),
        }
    }
}
