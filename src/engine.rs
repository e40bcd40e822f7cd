//! Inference engine contract and job input resolution.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::EngineError;
use crate::job::{JobId, JobRecord, JobStatus, JobUpdate};
use crate::manager::JobManager;
use crate::progress;

/// External engine that turns a batch of staged inputs into a result payload.
///
/// Calls may run for minutes. The supervisor bounds them with a timeout and
/// never interrupts them for cancellation.
#[async_trait]
pub trait InferenceEngine: Send + Sync + 'static {
    /// Process `inputs` for `job_id`.
    ///
    /// Implementations may report finished sub-units through `progress`.
    async fn process(
        &self,
        inputs: &[PathBuf],
        job_id: JobId,
        progress: &ProgressReporter,
    ) -> Result<Value, EngineError>;

    /// Whether the engine can accept work.
    fn is_ready(&self) -> bool {
        true
    }

    /// Free-form description of the engine's resources (devices, memory, model).
    fn capacity_info(&self) -> Map<String, Value> {
        Map::new()
    }
}

/// Handle an engine uses to report per-unit progress for one job.
///
/// Progress lands in the inference band. Failed reports are logged and
/// otherwise ignored so they never fail the job.
#[derive(Clone)]
pub struct ProgressReporter {
    manager: JobManager,
    job_id: JobId,
    total: usize,
}

impl ProgressReporter {
    pub(crate) fn new(manager: JobManager, job_id: JobId, total: usize) -> Self {
        Self {
            manager,
            job_id,
            total,
        }
    }

    #[must_use]
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Number of units the batch was split into.
    #[must_use]
    pub fn total(&self) -> usize {
        self.total
    }

    /// Record that `done` units of the batch have finished.
    pub async fn units_done(&self, done: usize) {
        let update = JobUpdate::new(JobStatus::Processing)
            .progress(progress::inference(done, self.total));
        if let Err(e) = self.manager.update_job_status(self.job_id, update).await {
            warn!(job_id = %self.job_id, error = %e, "Failed to report job progress");
        }
    }
}

/// On-disk layout of staged job inputs: `<upload_dir>/<job_id>/<file>`.
#[derive(Clone, Debug)]
pub struct InputLayout {
    upload_dir: PathBuf,
}

impl Default for InputLayout {
    fn default() -> Self {
        Self::new("./uploads")
    }
}

impl InputLayout {
    #[must_use]
    pub fn new(upload_dir: impl Into<PathBuf>) -> Self {
        Self {
            upload_dir: upload_dir.into(),
        }
    }

    #[must_use]
    pub fn upload_dir(&self) -> &Path {
        &self.upload_dir
    }

    /// Directory holding one job's staged inputs.
    #[must_use]
    pub fn job_dir(&self, id: JobId) -> PathBuf {
        self.upload_dir.join(id.to_string())
    }

    /// Paths of the inputs named in the job's payload.
    ///
    /// Names come from the payload's `files` array, or `file_names` when
    /// `files` is absent. Directory components are stripped so every path
    /// stays inside the job directory; non-string entries are skipped.
    #[must_use]
    pub fn inputs_for(&self, record: &JobRecord) -> Vec<PathBuf> {
        let names = record
            .payload
            .get("files")
            .or_else(|| record.payload.get("file_names"))
            .and_then(Value::as_array);
        let Some(names) = names else {
            return Vec::new();
        };

        let dir = self.job_dir(record.id);
        names
            .iter()
            .filter_map(Value::as_str)
            .filter_map(|name| Path::new(name).file_name())
            .map(|name| dir.join(name))
            .collect()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
