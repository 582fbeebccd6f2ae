//! Error types shared by every FaultLens crate.

use thiserror::Error;
use uuid::Uuid;

/// Main error type for FaultLens operations.
#[derive(Error, Debug)]
pub enum FaultLensError {
    #[error("Illegal schedule transition: {from} -> {to}")]
    IllegalTransition { from: String, to: String },

    #[error("Workflow {0} has no attempts remaining")]
    OutOfAttempts(Uuid),

    #[error("Workflow {0} is already in use")]
    GuardAlreadySet(Uuid),

    #[error("Target mismatch for workflow {workflow_id}: expected {expected}, got {actual}")]
    TargetMismatch {
        workflow_id: Uuid,
        expected: String,
        actual: String,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Analysis error: {0}")]
    Analysis(String),

    #[error("Duplicate signal for workflow {workflow_id}: {event}")]
    DuplicateSignal { workflow_id: Uuid, event: String },

    #[error("Workflow {workflow_id} step failed: {message}")]
    StepFailed { workflow_id: Uuid, message: String },

    #[error("Execution pipeline has faulted")]
    PipelineFaulted,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias using [`FaultLensError`].
pub type Result<T> = std::result::Result<T, FaultLensError>;

impl FaultLensError {
    /// Create a storage error.
    pub fn storage(msg: impl Into<String>) -> Self {
        FaultLensError::Storage(msg.into())
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        FaultLensError::Config(msg.into())
    }

    /// Create an analysis error, raised by agent steps.
    pub fn analysis(msg: impl Into<String>) -> Self {
        FaultLensError::Analysis(msg.into())
    }

    /// Create an invalid argument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        FaultLensError::InvalidArgument(msg.into())
    }

    /// Contract violations and a faulted pipeline cannot be recovered from.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FaultLensError::IllegalTransition { .. }
                | FaultLensError::OutOfAttempts(_)
                | FaultLensError::GuardAlreadySet(_)
                | FaultLensError::TargetMismatch { .. }
                | FaultLensError::InvalidArgument(_)
                | FaultLensError::PipelineFaulted
        )
    }
}
