//! # FaultLens Core
//!
//! Shared vocabulary for the FaultLens workspace: the source events and trigger
//! signals that flow into the scheduler, the error taxonomy, and configuration.

pub mod config;
pub mod error;
pub mod types;

pub use config::{FaultLensConfig, LoggingConfig, SchedulerConfig, StorageBackendKind, StorageConfig};
pub use error::{FaultLensError, Result};
pub use types::{Scenario, SourceEvent, TargetEntity, TriggerSignal};
