//! # FaultLens Scheduler
//!
//! Persistent, resumable workflow scheduler for event-triggered diagnostic analyses.
//!
//! ## Design Principles
//! - One workflow per analysis, driven step by step by pluggable agents
//! - Every step says what it waits for next (timer, event, scenario, interest)
//! - Bounded execution pipeline — backpressure instead of unbounded queues
//! - State survives restarts — interrupted workflows are reclaimed on startup
//!
//! ## Architecture
//! ```text
//! TriggerSignal ──► AnalysisScheduler::start
//!                     ├── interested workflow? ──► resume / pending-signal queue
//!                     └── agent eligible? ──────► new AnalysisWorkflow
//!                                 │
//!                         ExecutionPipeline (queue_capacity × max_parallelism)
//!                                 │
//!                     Agent::do_analysis / update_analysis ──► Continuation
//!                                 │
//!                     ScheduleRecord state machine ──► SchedulerStores
//!                                 │
//!                     terminal? ──► ConsumerRouter ──► WorkflowConsumer
//!
//! Activation loop (tokio interval) ──► due timers + queued signals ──► pipeline
//! ```

pub mod agent;
pub mod continuation;
pub mod engine;
pub mod interest;
pub mod notify;
pub mod persistence;
pub mod pipeline;
pub mod registry;
pub mod schedule;
pub mod store;
pub mod workflow;

pub use agent::{Agent, AgentId, AgentKind, StopOptions};
pub use continuation::{Continuation, ContinuationKind};
pub use engine::{AnalysisScheduler, RecoveryReport, StartOutcome};
pub use interest::InterestPredicate;
pub use notify::{ConsumeOption, ConsumerRouter, Notification, WorkflowConsumer};
pub use persistence::SqliteBackend;
pub use pipeline::{ExecutionPipeline, PipelineJob, PipelineStats};
pub use registry::{AgentFactory, AgentRegistry};
pub use schedule::{ActivationCandidate, RecoveryOutcome, ScheduleRecord, ScheduleStatus, SchedulingInfo};
pub use store::{
    JsonFileBackend, MemoryBackend, PendingSignalStore, PersistentStore, RetentionPolicy,
    SchedulerStores, StoreBackend, StoredEntry,
};
pub use workflow::{AnalysisWorkflow, StepException, WorkflowOutcome, WorkflowResult};
