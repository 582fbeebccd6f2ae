//! Core data model — source events, trigger signals and the entities they target.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Scenario tag carried by every source event.
///
/// New scenarios are added here; predicates and agents match on them by value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Scenario {
    /// A partition finished reconfiguring its replica set.
    Reconfiguration,
    /// The primary replica of a partition moved to another node.
    PrimaryMove,
    ReplicaDown,
    ReplicaUp,
    NodeDown,
    NodeUp,
    /// A partition lost write quorum.
    QuorumLoss,
    /// A hosted process crashed.
    ProcessCrash,
    /// Synthetic tick used to bootstrap time-triggered analyses.
    Periodic,
}

impl std::fmt::Display for Scenario {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Scenario::Reconfiguration => "reconfiguration",
            Scenario::PrimaryMove => "primary-move",
            Scenario::ReplicaDown => "replica-down",
            Scenario::ReplicaUp => "replica-up",
            Scenario::NodeDown => "node-down",
            Scenario::NodeUp => "node-up",
            Scenario::QuorumLoss => "quorum-loss",
            Scenario::ProcessCrash => "process-crash",
            Scenario::Periodic => "periodic",
        };
        f.write_str(name)
    }
}

/// An immutable fact observed in the cluster, e.g. "reconfiguration completed for
/// partition P at time T". Two events are equal when every field is equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceEvent {
    /// Reporting component ("FM", "RA", "Hosting", ...).
    pub task: String,
    pub scenario: Scenario,
    /// Identifier of the entity the event is about (partition id, node name, ...).
    pub target_id: String,
    pub occurred_at: DateTime<Utc>,
    /// Free-form attributes copied from the trace record.
    #[serde(default)]
    pub detail: BTreeMap<String, String>,
}

impl SourceEvent {
    pub fn new(
        task: impl Into<String>,
        scenario: Scenario,
        target_id: impl Into<String>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            task: task.into(),
            scenario,
            target_id: target_id.into(),
            occurred_at,
            detail: BTreeMap::new(),
        }
    }

    /// Attach one detail attribute.
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.detail.insert(key.into(), value.into());
        self
    }

    /// Short human-readable label used in logs and error messages.
    pub fn label(&self) -> String {
        format!(
            "{}/{}@{} ({})",
            self.task,
            self.scenario,
            self.target_id,
            self.occurred_at.to_rfc3339()
        )
    }
}

/// The cluster entity an analysis is about.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TargetEntity {
    Cluster,
    Node { name: String },
    Application { name: String },
    Service { name: String },
    Partition { id: Uuid },
    Replica { partition: Uuid, replica: i64 },
}

impl TargetEntity {
    /// Identifier an interest predicate matches `SourceEvent::target_id` against.
    pub fn entity_id(&self) -> String {
        match self {
            TargetEntity::Cluster => "cluster".to_string(),
            TargetEntity::Node { name } => name.clone(),
            TargetEntity::Application { name } => name.clone(),
            TargetEntity::Service { name } => name.clone(),
            TargetEntity::Partition { id } => id.to_string(),
            TargetEntity::Replica { partition, .. } => partition.to_string(),
        }
    }
}

impl std::fmt::Display for TargetEntity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetEntity::Cluster => write!(f, "cluster"),
            TargetEntity::Node { name } => write!(f, "node:{name}"),
            TargetEntity::Application { name } => write!(f, "application:{name}"),
            TargetEntity::Service { name } => write!(f, "service:{name}"),
            TargetEntity::Partition { id } => write!(f, "partition:{id}"),
            TargetEntity::Replica { partition, replica } => {
                write!(f, "replica:{partition}/{replica}")
            }
        }
    }
}

/// A source event plus the entity it should be analysed against; the unit handed
/// into the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TriggerSignal {
    pub event: SourceEvent,
    pub target: TargetEntity,
}

impl TriggerSignal {
    pub fn new(event: SourceEvent, target: TargetEntity) -> Self {
        Self { event, target }
    }

    /// Synthetic signal for time-triggered analyses.
    pub fn periodic(target: TargetEntity) -> Self {
        let event = SourceEvent::new("scheduler", Scenario::Periodic, target.entity_id(), Utc::now());
        Self { event, target }
    }
}
