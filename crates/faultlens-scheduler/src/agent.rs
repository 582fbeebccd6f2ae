//! Agent capability — pluggable strategies that create and run workflows of one kind.

use async_trait::async_trait;
use faultlens_core::{Result, TargetEntity, TriggerSignal};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::continuation::Continuation;
use crate::workflow::AnalysisWorkflow;

/// Stable identifier an agent is registered and looked up under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// How an agent's workflows get started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgentKind {
    /// Bootstrapped once per target and kept alive with `ResumeAfter`.
    TimeTriggered,
    /// Started by incoming trigger signals.
    SignalTriggered,
}

/// What `stop` should do with persisted state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopOptions {
    StopOnly,
    RemoveAllState,
}

/// The capability set every agent implements. Only `id`, `kind` and `do_analysis`
/// are required.
#[async_trait]
pub trait Agent: Send + Sync {
    fn id(&self) -> AgentId;

    fn kind(&self) -> AgentKind;

    /// Whether `signal` should start a new workflow for `target`.
    fn is_eligible_for_analysis(&self, _target: &TargetEntity, _signal: &TriggerSignal) -> bool {
        true
    }

    /// Build the workflow for a new eligible signal. The scheduler attaches the target
    /// and the signal afterwards.
    fn create_new_workflow(&self, _signal: &TriggerSignal) -> Result<AnalysisWorkflow> {
        Ok(AnalysisWorkflow::new(self.id()))
    }

    /// Run one step of a fresh or timer-resumed workflow.
    async fn do_analysis(
        &self,
        workflow: &mut AnalysisWorkflow,
        cancel: &CancellationToken,
    ) -> Result<Continuation>;

    /// Run one step of a workflow resumed through its interest predicate.
    async fn update_analysis(
        &self,
        _workflow: &mut AnalysisWorkflow,
        _cancel: &CancellationToken,
    ) -> Result<Continuation> {
        Ok(Continuation::done())
    }

    async fn stop(&self, _options: StopOptions) -> Result<()> {
        Ok(())
    }

    async fn reload_configuration(&self) -> Result<()> {
        Ok(())
    }
}
