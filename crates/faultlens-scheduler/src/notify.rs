//! Consumer notifications — hands finished workflows to registered consumers.
//! Consumers run inline in post-step bookkeeping, so they should stay lightweight.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use faultlens_core::Result;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent::AgentId;
use crate::workflow::{WorkflowOutcome, WorkflowResult};

const HISTORY_LIMIT: usize = 100;

/// Which terminal outcomes a consumer wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsumeOption {
    OnFinished,
    OnFailed,
    OnEither,
}

impl ConsumeOption {
    pub fn accepts(self, outcome: WorkflowOutcome) -> bool {
        match self {
            ConsumeOption::OnFinished => outcome == WorkflowOutcome::Finished,
            ConsumeOption::OnFailed => outcome == WorkflowOutcome::Failed,
            ConsumeOption::OnEither => true,
        }
    }
}

/// Receiver of terminal workflow results.
#[async_trait]
pub trait WorkflowConsumer: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str {
        "consumer"
    }

    async fn consume(&self, result: &WorkflowResult, cancel: &CancellationToken) -> Result<()>;
}

#[derive(Clone)]
struct Registration {
    consumer: Arc<dyn WorkflowConsumer>,
    option: ConsumeOption,
}

/// One delivered notification, kept for inspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub workflow_id: Uuid,
    pub agent_id: AgentId,
    pub outcome: WorkflowOutcome,
    /// Consumers that were called.
    pub delivered: usize,
    /// Consumers that returned an error.
    pub errors: usize,
    pub timestamp: DateTime<Utc>,
}

/// Routes workflow results to the consumers registered for their agent.
pub struct ConsumerRouter {
    consumers: RwLock<HashMap<AgentId, Vec<Registration>>>,
    /// Notification history (in-memory ring buffer, max 100).
    history: Mutex<VecDeque<Notification>>,
}

impl ConsumerRouter {
    pub fn new() -> Self {
        Self {
            consumers: RwLock::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
        }
    }

    pub fn add_consumer(
        &self,
        agent_id: AgentId,
        consumer: Arc<dyn WorkflowConsumer>,
        option: ConsumeOption,
    ) {
        tracing::info!(
            "📣 Consumer '{}' registered for {} ({:?})",
            consumer.name(),
            agent_id,
            option
        );
        let mut consumers = self.consumers.write().unwrap_or_else(|e| e.into_inner());
        consumers
            .entry(agent_id)
            .or_default()
            .push(Registration { consumer, option });
    }

    pub fn consumer_count(&self, agent_id: &AgentId) -> usize {
        let consumers = self.consumers.read().unwrap_or_else(|e| e.into_inner());
        consumers.get(agent_id).map(Vec::len).unwrap_or(0)
    }

    /// Deliver `result` to every matching consumer. Consumer errors are logged and
    /// do not propagate. Returns how many consumers were called.
    pub async fn notify(&self, result: &WorkflowResult, cancel: &CancellationToken) -> usize {
        let matching: Vec<Registration> = {
            let consumers = self.consumers.read().unwrap_or_else(|e| e.into_inner());
            consumers
                .get(&result.workflow.agent_id)
                .map(|regs| {
                    regs.iter()
                        .filter(|r| r.option.accepts(result.outcome))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        };

        let mut errors = 0;
        for reg in &matching {
            if let Err(e) = reg.consumer.consume(result, cancel).await {
                errors += 1;
                tracing::warn!(
                    "⚠️ Consumer '{}' failed for workflow {}: {}",
                    reg.consumer.name(),
                    result.workflow.id,
                    e
                );
            }
        }

        if !matching.is_empty() {
            tracing::debug!(
                "📣 Workflow {} {:?} delivered to {} consumer(s)",
                result.workflow.id,
                result.outcome,
                matching.len()
            );
        }
        self.record(Notification {
            workflow_id: result.workflow.id,
            agent_id: result.workflow.agent_id.clone(),
            outcome: result.outcome,
            delivered: matching.len(),
            errors,
            timestamp: Utc::now(),
        });
        matching.len()
    }

    fn record(&self, notification: Notification) {
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.push_back(notification);
        // Ring buffer, keep last 100
        if history.len() > HISTORY_LIMIT {
            history.pop_front();
        }
    }

    /// Get notification history, oldest first.
    pub fn history(&self) -> Vec<Notification> {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.iter().cloned().collect()
    }
}

impl Default for ConsumerRouter {
    fn default() -> Self {
        Self::new()
    }
}
