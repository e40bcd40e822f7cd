//! Error types for the job orchestration crate.

use thiserror::Error;

use crate::job::JobStatus;

/// Errors raised by a [`JobStore`](crate::JobStore) or [`WorkQueue`](crate::WorkQueue) backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The durable backend could not be reached or rejected the command.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A stored record could not be encoded or decoded.
    #[error("Record serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors surfaced by the [`JobManager`](crate::JobManager).
///
/// Absence and illegal transitions are normal outcomes and are reported
/// through return values, not through this type.
#[derive(Debug, Error)]
pub enum JobManagerError {
    /// Infrastructure failure in the backing store.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Results were requested for a job that has not completed.
    #[error("Job not completed. Current status: {status}")]
    NotCompleted { status: JobStatus },
}

/// A requested status change that is not an edge of the job state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Invalid job transition from {from} to {to}")]
pub struct TransitionError {
    pub from: JobStatus,
    pub to: JobStatus,
}

/// Errors reported by an [`InferenceEngine`](crate::InferenceEngine).
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine ran but could not produce a result.
    #[error("Inference failed: {0}")]
    Failed(String),

    /// The engine has not finished loading its model.
    #[error("Inference engine is not ready")]
    NotReady,

    /// The job's inputs could not be used.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Errors that can occur when building or stopping the [`Supervisor`](crate::Supervisor).
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Configuration error (e.g., zero concurrency, zero poll interval).
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The builder was finished without an inference engine.
    #[error("Invalid configuration: an inference engine must be configured")]
    MissingEngine,

    /// A worker panicked outside of job execution.
    #[error("Worker panicked: {0}")]
    WorkerPanicked(String),
}

/// Errors raised while loading [`Settings`](crate::Settings).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration source error: {0}")]
    Source(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
