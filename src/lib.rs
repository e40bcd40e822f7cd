//! Job orchestration for batch file-upload inference.
//!
//! Clients upload a batch of files, get a job id back immediately and poll
//! for status, progress and results while a bounded pool of workers runs the
//! batch through an external inference engine.
//!
//! - [`JobManager`] - Job records, status transitions, cancel/retry, queries
//! - [`Supervisor`] - Worker pool executing queued jobs with a concurrency cap and timeout
//! - [`InferenceEngine`] - Contract for the engine that does the actual work
//! - [`MemoryBackend`] - In-process store and queue; `RedisBackend` with the `redis` feature
//! - [`Settings`] - Configuration from `config/jobs` and environment variables
//!
//! # Architecture
//!
//! ```text
//!  ingress ──create_job──► ┌────────────┐ put/get  ┌──────────┐
//!  client ──status/cancel─►│ JobManager │◄────────►│ JobStore │
//!                          └─────┬──────┘          └──────────┘
//!                        enqueue │ ▲ update_job_status
//!                                ▼ │
//!                          ┌───────────┐  dequeue  ┌────────────┐  process  ┌─────────────────┐
//!                          │ WorkQueue │──────────►│ Supervisor │──────────►│ InferenceEngine │
//!                          └───────────┘           └────────────┘           └─────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::path::PathBuf;
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use batch_job_queue::{
//!     BATCH_PROCESSING, EngineError, InferenceEngine, JobId, JobManager, MemoryBackend,
//!     ProgressReporter, Supervisor,
//! };
//! use serde_json::{Value, json};
//!
//! struct CountingEngine;
//!
//! #[async_trait]
//! impl InferenceEngine for CountingEngine {
//!     async fn process(
//!         &self,
//!         inputs: &[PathBuf],
//!         _job_id: JobId,
//!         progress: &ProgressReporter,
//!     ) -> Result<Value, EngineError> {
//!         progress.units_done(inputs.len()).await;
//!         Ok(json!({ "processed": inputs.len() }))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = JobManager::with_backend(MemoryBackend::new());
//!     let supervisor = Supervisor::builder(manager.clone())
//!         .engine(Arc::new(CountingEngine))
//!         .max_concurrent_jobs(2)
//!         .build()?;
//!
//!     let id = manager
//!         .create_job(BATCH_PROCESSING, json!({ "files": ["a.dcm", "b.dcm"] }))
//!         .await?;
//!
//!     tokio::time::sleep(std::time::Duration::from_millis(100)).await;
//!     println!("{:?}", manager.get_job_status(id).await?);
//!
//!     supervisor.shutdown().await?;
//!     Ok(())
//! }
//! ```

mod config;
mod engine;
mod error;
mod job;
mod manager;
pub mod progress;
mod storage;
mod supervisor;

pub use config::Settings;
pub use engine::{InferenceEngine, InputLayout, ProgressReporter};
pub use error::{
    ConfigError, EngineError, JobManagerError, StoreError, SupervisorError, TransitionError,
};
pub use job::{BATCH_PROCESSING, JobId, JobRecord, JobStatus, JobUpdate, UnknownStatus};
pub use manager::{DEFAULT_JOB_TTL, JobManager, JobStats, ManagerConfig, UpdateOutcome};
pub use storage::{JobStore, MemoryBackend, WorkQueue};
#[cfg(feature = "redis")]
pub use storage::RedisBackend;
pub use supervisor::{
    HealthReport, HealthStatus, Supervisor, SupervisorBuilder, SupervisorConfig,
};
