//! Job manager: the only legal mutation path to job records.
//!
//! ```text
//! Ingress            JobManager            JobStore        WorkQueue
//!    │                   │                    │                │
//!    ├─ create_job() ───►│── put(pending) ───►│                │
//!    │                   │── enqueue ────────────────────────►│
//!    │◄── JobId ─────────┤                    │                │
//!    │                   │                    │                │
//! Supervisor             │                    │                │
//!    ├─ next_job() ─────►│── dequeue ────────────────────────►│
//!    ├─ update_job_status() ─► get / apply / put ─►│           │
//! ```
//!
//! Each `update_job_status` is a read-modify-write on one key. Two updates
//! racing on the same job resolve last-writer-wins; a cancel that lands
//! between a worker's read and write can be overwritten by that write.
//!
//! Creating or retrying a job writes the record and then enqueues its id,
//! two separate backend calls. If the enqueue fails the record write is
//! undone (the new record is deleted, a retried record is restored to
//! `failed`) and the error is returned. If the undo fails too, the job is
//! left `pending` without a queue entry and is logged at `error`.
//!
//! Ingress that stages inputs before execution uses
//! [`reserve_job`](JobManager::reserve_job), then
//! [`report_staging_progress`](JobManager::report_staging_progress), then
//! [`submit_job`](JobManager::submit_job). Workers never see the id until
//! it is submitted.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::error::{JobManagerError, StoreError};
use crate::job::{JobId, JobRecord, JobStatus, JobUpdate};
use crate::progress;
use crate::storage::{JobStore, WorkQueue};

/// Default retention window for job records.
pub const DEFAULT_JOB_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Configuration for the [`JobManager`].
#[derive(Clone, Debug)]
pub struct ManagerConfig {
    /// How long a record is kept after its last write.
    pub ttl: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_JOB_TTL,
        }
    }
}

/// Outcome of [`JobManager::update_job_status`].
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    /// The update was written; carries the new record.
    Applied(JobRecord),
    /// No record exists for the id (unknown or expired).
    NotFound,
    /// The requested status is not reachable from the current one.
    Rejected { from: JobStatus, to: JobStatus },
}

impl UpdateOutcome {
    #[must_use]
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

/// Aggregate counters over live records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub active_jobs: usize,
    pub completed_jobs_24h: usize,
    pub queue_length: usize,
}

/// Owns the job store and work queue and enforces the job state machine.
///
/// Cloning is cheap and every clone shares the same backends.
#[derive(Clone)]
pub struct JobManager {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn WorkQueue>,
    config: ManagerConfig,
}

impl JobManager {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn WorkQueue>,
        config: ManagerConfig,
    ) -> Self {
        Self {
            store,
            queue,
            config,
        }
    }

    /// Build a manager whose records and queue share one backend.
    pub fn with_backend<B>(backend: B) -> Self
    where
        B: JobStore + WorkQueue,
    {
        Self::with_backend_and_config(backend, ManagerConfig::default())
    }

    pub fn with_backend_and_config<B>(backend: B, config: ManagerConfig) -> Self
    where
        B: JobStore + WorkQueue,
    {
        let backend = Arc::new(backend);
        Self::new(backend.clone(), backend, config)
    }

    #[must_use]
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Record a new `pending` job and enqueue it.
    ///
    /// # Errors
    ///
    /// Returns [`JobManagerError::Store`] if the backend is unavailable.
    pub async fn create_job(
        &self,
        job_type: &str,
        payload: Value,
    ) -> Result<JobId, JobManagerError> {
        let record = JobRecord::new(job_type, payload, Utc::now());
        self.store.put(&record, self.config.ttl).await?;
        if let Err(e) = self.queue.enqueue(record.id).await {
            if let Err(undo) = self.store.delete(record.id).await {
                error!(job_id = %record.id, error = %undo, "Failed to remove unqueued job record");
            }
            return Err(e.into());
        }

        info!(job_id = %record.id, job_type, "Job created");
        Ok(record.id)
    }

    /// Record a new `pending` job without enqueueing it.
    ///
    /// The id is known before any worker can claim the job, so inputs can be
    /// staged under its directory first. Hand it over with
    /// [`submit_job`](JobManager::submit_job).
    ///
    /// # Errors
    ///
    /// Returns [`JobManagerError::Store`] if the backend is unavailable.
    pub async fn reserve_job(
        &self,
        job_type: &str,
        payload: Value,
    ) -> Result<JobId, JobManagerError> {
        let record = JobRecord::new(job_type, payload, Utc::now());
        self.store.put(&record, self.config.ttl).await?;

        info!(job_id = %record.id, job_type, "Job reserved");
        Ok(record.id)
    }

    /// Enqueue a reserved job. Returns `false` if the job is unknown or no
    /// longer `pending` (for example cancelled while staging).
    ///
    /// Submitting the same job twice queues it twice; the second copy is
    /// skipped by the worker that dequeues it.
    ///
    /// # Errors
    ///
    /// Returns [`JobManagerError::Store`] if the backend is unavailable. The
    /// job then stays reserved and the call can be repeated.
    pub async fn submit_job(&self, id: JobId) -> Result<bool, JobManagerError> {
        let Some(record) = self.store.get(id).await? else {
            return Ok(false);
        };
        if record.status != JobStatus::Pending {
            debug!(job_id = %id, status = %record.status, "Job is not submittable");
            return Ok(false);
        }

        self.queue.enqueue(id).await?;
        info!(job_id = %id, progress = record.progress, "Job submitted");
        Ok(true)
    }

    /// Apply `update` to the job's record.
    ///
    /// Unknown or expired jobs and illegal transitions are reported through
    /// [`UpdateOutcome`] and logged; neither touches the store.
    ///
    /// # Errors
    ///
    /// Returns [`JobManagerError::Store`] if the backend is unavailable.
    pub async fn update_job_status(
        &self,
        id: JobId,
        update: JobUpdate,
    ) -> Result<UpdateOutcome, JobManagerError> {
        let Some(mut record) = self.store.get(id).await? else {
            warn!(job_id = %id, status = %update.status, "Attempted to update non-existent job");
            return Ok(UpdateOutcome::NotFound);
        };

        if let Err(e) = record.apply(&update, Utc::now()) {
            warn!(job_id = %id, error = %e, "Rejected job status update");
            return Ok(UpdateOutcome::Rejected {
                from: e.from,
                to: e.to,
            });
        }

        self.store.put(&record, self.config.ttl).await?;
        debug!(
            job_id = %id,
            status = %record.status,
            progress = record.progress,
            "Job status updated"
        );
        Ok(UpdateOutcome::Applied(record))
    }

    /// Report that `staged` of `total` inputs have been written for a pending job.
    ///
    /// Progress lands in the staging band and the job stays `pending`. Only
    /// reserved jobs are guaranteed to still be `pending`; a job made with
    /// [`create_job`](JobManager::create_job) may already be running.
    ///
    /// # Errors
    ///
    /// Returns [`JobManagerError::Store`] if the backend is unavailable.
    pub async fn report_staging_progress(
        &self,
        id: JobId,
        staged: usize,
        total: usize,
    ) -> Result<UpdateOutcome, JobManagerError> {
        let update = JobUpdate::new(JobStatus::Pending).progress(progress::staging(staged, total));
        self.update_job_status(id, update).await
    }

    /// Current record for `id`, or `None` if unknown or expired.
    ///
    /// # Errors
    ///
    /// Returns [`JobManagerError::Store`] if the backend is unavailable.
    pub async fn get_job_status(&self, id: JobId) -> Result<Option<JobRecord>, JobManagerError> {
        Ok(self.store.get(id).await?)
    }

    /// Result payload of a completed job, or `None` if the job is unknown.
    ///
    /// # Errors
    ///
    /// Returns [`JobManagerError::NotCompleted`] if the job exists but has
    /// not completed, or [`JobManagerError::Store`] if the backend is
    /// unavailable.
    pub async fn get_job_results(&self, id: JobId) -> Result<Option<Value>, JobManagerError> {
        let Some(record) = self.store.get(id).await? else {
            return Ok(None);
        };
        if record.status != JobStatus::Completed {
            return Err(JobManagerError::NotCompleted {
                status: record.status,
            });
        }
        Ok(Some(record.result.unwrap_or(Value::Null)))
    }

    /// Cancel a `pending` or `processing` job.
    ///
    /// Removes the id from the work queue if it is still there. A running
    /// engine call is not interrupted; its outcome is discarded because the
    /// job is already terminal.
    ///
    /// # Errors
    ///
    /// Returns [`JobManagerError::Store`] if the backend is unavailable.
    pub async fn cancel_job(&self, id: JobId) -> Result<bool, JobManagerError> {
        let outcome = self
            .update_job_status(id, JobUpdate::new(JobStatus::Cancelled))
            .await?;
        if !outcome.is_applied() {
            return Ok(false);
        }

        self.queue.remove(id).await?;
        info!(job_id = %id, "Job cancelled");
        Ok(true)
    }

    /// Move a `failed` job back to `pending` and re-enqueue it.
    ///
    /// # Errors
    ///
    /// Returns [`JobManagerError::Store`] if the backend is unavailable.
    pub async fn retry_failed_job(&self, id: JobId) -> Result<bool, JobManagerError> {
        let Some(mut record) = self.store.get(id).await? else {
            return Ok(false);
        };
        let failed = record.clone();
        if let Err(e) = record.retry(Utc::now()) {
            debug!(job_id = %id, error = %e, "Job is not retryable");
            return Ok(false);
        }

        self.store.put(&record, self.config.ttl).await?;
        if let Err(e) = self.queue.enqueue(id).await {
            if let Err(undo) = self.store.put(&failed, self.config.ttl).await {
                error!(job_id = %id, error = %undo, "Failed to restore unqueued retry");
            }
            return Err(e.into());
        }
        info!(job_id = %id, "Job retry initiated");
        Ok(true)
    }

    /// Up to `limit` jobs in `status`, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`JobManagerError::Store`] if the backend is unavailable.
    pub async fn get_jobs_by_status(
        &self,
        status: JobStatus,
        limit: usize,
    ) -> Result<Vec<JobRecord>, JobManagerError> {
        let mut jobs = self.store.scan_status(status).await?;
        newest_first(&mut jobs, limit);
        Ok(jobs)
    }

    /// Up to `limit` `pending` and `processing` jobs, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`JobManagerError::Store`] if the backend is unavailable.
    pub async fn get_active_jobs(&self, limit: usize) -> Result<Vec<JobRecord>, JobManagerError> {
        let mut jobs = self.store.scan_status(JobStatus::Processing).await?;
        jobs.extend(self.store.scan_status(JobStatus::Pending).await?);
        newest_first(&mut jobs, limit);
        Ok(jobs)
    }

    /// Number of `pending` and `processing` jobs.
    ///
    /// # Errors
    ///
    /// Returns [`JobManagerError::Store`] if the backend is unavailable.
    pub async fn get_active_jobs_count(&self) -> Result<usize, JobManagerError> {
        let pending = self.store.scan_status(JobStatus::Pending).await?.len();
        let processing = self.store.scan_status(JobStatus::Processing).await?.len();
        Ok(pending + processing)
    }

    /// Number of completed jobs created in the last 24 hours.
    ///
    /// # Errors
    ///
    /// Returns [`JobManagerError::Store`] if the backend is unavailable.
    pub async fn get_completed_jobs_24h(&self) -> Result<usize, JobManagerError> {
        let cutoff = Utc::now() - chrono::Duration::hours(24);
        Ok(self
            .store
            .scan_status(JobStatus::Completed)
            .await?
            .iter()
            .filter(|record| record.created_at > cutoff)
            .count())
    }

    /// Delete every job created more than `days` days ago, whatever its status.
    ///
    /// Deleted `pending` jobs are also removed from the work queue.
    ///
    /// # Errors
    ///
    /// Returns [`JobManagerError::Store`] if the backend is unavailable.
    pub async fn cleanup_old_jobs(&self, days: u32) -> Result<usize, JobManagerError> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(days));
        let mut cleaned = 0;
        for record in self.store.scan().await? {
            if record.created_at < cutoff {
                self.store.delete(record.id).await?;
                if record.status == JobStatus::Pending {
                    self.queue.remove(record.id).await?;
                }
                cleaned += 1;
            }
        }

        info!(cleaned_count = cleaned, days, "Old jobs cleaned up");
        Ok(cleaned)
    }

    /// Number of ids waiting in the work queue.
    ///
    /// # Errors
    ///
    /// Returns [`JobManagerError::Store`] if the backend is unavailable.
    pub async fn get_job_queue_length(&self) -> Result<usize, JobManagerError> {
        Ok(self.queue.len().await?)
    }

    /// Pop the next queued id. Callers must re-check the job's status.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend is unavailable.
    pub async fn next_job(&self) -> Result<Option<JobId>, StoreError> {
        self.queue.dequeue().await
    }

    /// Put a dequeued id back after a worker failed to start it.
    pub(crate) async fn requeue(&self, id: JobId) -> Result<(), StoreError> {
        self.queue.enqueue(id).await
    }

    /// Wait until a job may be available or `timeout` elapses.
    pub(crate) async fn wait_for_job(&self, timeout: Duration) -> Result<(), StoreError> {
        self.queue.wait_for_job(timeout).await
    }

    /// Check that the store answers.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend is unavailable.
    pub async fn ping(&self) -> Result<(), StoreError> {
        self.store.ping().await
    }

    /// Active, recently completed and queued job counts.
    ///
    /// # Errors
    ///
    /// Returns [`JobManagerError::Store`] if the backend is unavailable.
    pub async fn stats(&self) -> Result<JobStats, JobManagerError> {
        Ok(JobStats {
            active_jobs: self.get_active_jobs_count().await?,
            completed_jobs_24h: self.get_completed_jobs_24h().await?,
            queue_length: self.get_job_queue_length().await?,
        })
    }
}

fn newest_first(jobs: &mut Vec<JobRecord>, limit: usize) {
    jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    jobs.truncate(limit);
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::BATCH_PROCESSING;
    use crate::storage::MemoryBackend;
    use async_trait::async_trait;
    use serde_json::json;

    fn manager() -> (JobManager, MemoryBackend) {
        let backend = MemoryBackend::new();
        (JobManager::with_backend(backend.clone()), backend)
    }

    async fn create(manager: &JobManager) -> JobId {
        manager
            .create_job(BATCH_PROCESSING, json!({"files": ["a.dcm", "b.dcm"]}))
            .await
            .unwrap()
    }

    async fn fail(manager: &JobManager, id: JobId) {
        manager
            .update_job_status(id, JobUpdate::processing(50))
            .await
            .unwrap();
        manager
            .update_job_status(id, JobUpdate::failed("engine error"))
            .await
            .unwrap();
    }

    // Backend that is never reachable
    struct DownBackend;

    fn down() -> StoreError {
        StoreError::Unavailable("connection refused".to_string())
    }

    #[async_trait]
    impl JobStore for DownBackend {
        async fn put(&self, _record: &JobRecord, _ttl: Duration) -> Result<(), StoreError> {
            Err(down())
        }
        async fn get(&self, _id: JobId) -> Result<Option<JobRecord>, StoreError> {
            Err(down())
        }
        async fn delete(&self, _id: JobId) -> Result<(), StoreError> {
            Err(down())
        }
        async fn scan(&self) -> Result<Vec<JobRecord>, StoreError> {
            Err(down())
        }
    }

    #[async_trait]
    impl WorkQueue for DownBackend {
        async fn enqueue(&self, _id: JobId) -> Result<(), StoreError> {
            Err(down())
        }
        async fn dequeue(&self) -> Result<Option<JobId>, StoreError> {
            Err(down())
        }
        async fn remove(&self, _id: JobId) -> Result<usize, StoreError> {
            Err(down())
        }
        async fn len(&self) -> Result<usize, StoreError> {
            Err(down())
        }
    }

    // =========================================================================
    // Create / Read Tests
    // =========================================================================

    #[tokio::test]
    async fn created_job_is_pending_and_queued() {
        let (manager, _) = manager();
        let id = create(&manager).await;

        let job = manager.get_job_status(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.progress, 0);
        assert_eq!(job.job_type, BATCH_PROCESSING);
        assert_eq!(manager.get_job_queue_length().await.unwrap(), 1);
        assert_eq!(manager.next_job().await.unwrap(), Some(id));
    }

    #[tokio::test]
    async fn unknown_job_is_absent() {
        let (manager, _) = manager();
        assert!(manager.get_job_status(JobId::new()).await.unwrap().is_none());
        assert!(manager.get_job_results(JobId::new()).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn job_expires_after_ttl() {
        let backend = MemoryBackend::new();
        let manager = JobManager::with_backend_and_config(
            backend,
            ManagerConfig {
                ttl: Duration::from_secs(1),
            },
        );
        let id = create(&manager).await;

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(manager.get_job_status(id).await.unwrap().is_none());
    }

    // =========================================================================
    // Update Tests
    // =========================================================================

    #[tokio::test]
    async fn update_unknown_job_is_soft_failure() {
        let (manager, backend) = manager();
        let outcome = manager
            .update_job_status(JobId::new(), JobUpdate::processing(10))
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::NotFound);
        assert_eq!(backend.record_count().await, 0);
    }

    #[tokio::test]
    async fn illegal_transition_is_rejected() {
        let (manager, _) = manager();
        let id = create(&manager).await;
        let before = manager.get_job_status(id).await.unwrap().unwrap();

        let outcome = manager
            .update_job_status(id, JobUpdate::completed(json!({})))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            UpdateOutcome::Rejected {
                from: JobStatus::Pending,
                to: JobStatus::Completed
            }
        );
        assert_eq!(manager.get_job_status(id).await.unwrap().unwrap(), before);
    }

    #[tokio::test]
    async fn repeated_update_matches_single_update() {
        let (manager, _) = manager();
        let id = create(&manager).await;
        let update = JobUpdate::processing(60);

        manager.update_job_status(id, update.clone()).await.unwrap();
        let mut once = manager.get_job_status(id).await.unwrap().unwrap();
        manager.update_job_status(id, update).await.unwrap();
        let twice = manager.get_job_status(id).await.unwrap().unwrap();

        once.updated_at = twice.updated_at;
        assert_eq!(
            serde_json::to_vec(&once).unwrap(),
            serde_json::to_vec(&twice).unwrap()
        );
    }

    #[tokio::test]
    async fn reserved_job_is_queued_only_after_submit() {
        let (manager, _) = manager();
        let id = manager
            .reserve_job(BATCH_PROCESSING, json!({"files": ["a.dcm"]}))
            .await
            .unwrap();
        assert_eq!(manager.get_job_queue_length().await.unwrap(), 0);
        assert_eq!(manager.next_job().await.unwrap(), None);

        manager.report_staging_progress(id, 1, 1).await.unwrap();
        assert!(manager.submit_job(id).await.unwrap());

        let job = manager.get_job_status(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.progress, progress::STAGING_END);
        assert_eq!(manager.next_job().await.unwrap(), Some(id));
    }

    #[tokio::test]
    async fn submit_refuses_cancelled_or_unknown_job() {
        let (manager, _) = manager();
        let id = manager
            .reserve_job(BATCH_PROCESSING, json!({}))
            .await
            .unwrap();
        assert!(manager.cancel_job(id).await.unwrap());

        assert!(!manager.submit_job(id).await.unwrap());
        assert!(!manager.submit_job(JobId::new()).await.unwrap());
        assert_eq!(manager.get_job_queue_length().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn staging_progress_keeps_job_pending() {
        let (manager, _) = manager();
        let id = create(&manager).await;

        manager.report_staging_progress(id, 1, 2).await.unwrap();
        let job = manager.get_job_status(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.progress, progress::staging(1, 2));
    }

    // =========================================================================
    // Results Tests
    // =========================================================================

    #[tokio::test]
    async fn results_require_completion() {
        let (manager, _) = manager();
        let id = create(&manager).await;
        manager
            .update_job_status(id, JobUpdate::processing(50))
            .await
            .unwrap();

        match manager.get_job_results(id).await {
            Err(JobManagerError::NotCompleted { status }) => {
                assert_eq!(status, JobStatus::Processing)
            }
            other => panic!("Expected NotCompleted, got {other:?}"),
        }

        let findings = json!({"findings": ["normal"]});
        manager
            .update_job_status(id, JobUpdate::completed(findings.clone()))
            .await
            .unwrap();
        assert_eq!(manager.get_job_results(id).await.unwrap(), Some(findings));
    }

    // =========================================================================
    // Cancel / Retry Tests
    // =========================================================================

    #[tokio::test]
    async fn cancel_pending_job_removes_it_from_queue() {
        let (manager, _) = manager();
        let id = create(&manager).await;

        assert!(manager.cancel_job(id).await.unwrap());
        assert_eq!(manager.get_job_queue_length().await.unwrap(), 0);
        let job = manager.get_job_status(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn cancel_completed_job_is_refused() {
        let (manager, _) = manager();
        let id = create(&manager).await;
        manager
            .update_job_status(id, JobUpdate::processing(50))
            .await
            .unwrap();
        manager
            .update_job_status(id, JobUpdate::completed(json!({"ok": true})))
            .await
            .unwrap();
        let before = manager.get_job_status(id).await.unwrap().unwrap();

        assert!(!manager.cancel_job(id).await.unwrap());
        assert_eq!(manager.get_job_status(id).await.unwrap().unwrap(), before);
    }

    #[tokio::test]
    async fn cancel_unknown_job_is_refused() {
        let (manager, _) = manager();
        assert!(!manager.cancel_job(JobId::new()).await.unwrap());
    }

    #[tokio::test]
    async fn cancelled_job_ignores_late_completion() {
        let (manager, _) = manager();
        let id = create(&manager).await;
        manager
            .update_job_status(id, JobUpdate::processing(50))
            .await
            .unwrap();
        assert!(manager.cancel_job(id).await.unwrap());

        let outcome = manager
            .update_job_status(id, JobUpdate::completed(json!({})))
            .await
            .unwrap();
        assert!(!outcome.is_applied());
        let job = manager.get_job_status(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.result.is_none());
    }

    #[tokio::test]
    async fn retry_resets_and_requeues_failed_job() {
        let (manager, _) = manager();
        let id = create(&manager).await;
        assert_eq!(manager.next_job().await.unwrap(), Some(id));
        fail(&manager, id).await;

        assert!(manager.retry_failed_job(id).await.unwrap());
        let job = manager.get_job_status(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.progress, 0);
        assert_eq!(job.error, None);
        assert_eq!(manager.next_job().await.unwrap(), Some(id));
    }

    #[tokio::test]
    async fn retry_non_failed_job_is_refused() {
        let (manager, _) = manager();
        let id = create(&manager).await;
        assert!(!manager.retry_failed_job(id).await.unwrap());
        assert!(!manager.retry_failed_job(JobId::new()).await.unwrap());
        assert_eq!(manager.get_job_queue_length().await.unwrap(), 1);
    }

    // =========================================================================
    // Query Tests
    // =========================================================================

    #[tokio::test]
    async fn jobs_by_status_are_newest_first_and_limited() {
        let (manager, backend) = manager();
        let now = Utc::now();
        for age in [3, 1, 2] {
            let mut job = JobRecord::new(BATCH_PROCESSING, json!({}), now);
            job.created_at = now - chrono::Duration::minutes(age);
            backend.put(&job, DEFAULT_JOB_TTL).await.unwrap();
        }

        let jobs = manager
            .get_jobs_by_status(JobStatus::Pending, 2)
            .await
            .unwrap();
        assert_eq!(jobs.len(), 2);
        assert!(jobs[0].created_at > jobs[1].created_at);
        assert_eq!(jobs[0].created_at, now - chrono::Duration::minutes(1));
    }

    #[tokio::test]
    async fn aggregates_count_by_status_and_window() {
        let (manager, backend) = manager();
        let pending = create(&manager).await;
        let running = create(&manager).await;
        manager
            .update_job_status(running, JobUpdate::processing(50))
            .await
            .unwrap();

        let mut old = JobRecord::new(BATCH_PROCESSING, json!({}), Utc::now());
        old.created_at = Utc::now() - chrono::Duration::hours(30);
        old.status = JobStatus::Completed;
        old.progress = 100;
        backend.put(&old, DEFAULT_JOB_TTL).await.unwrap();

        let recent = create(&manager).await;
        manager
            .update_job_status(recent, JobUpdate::processing(50))
            .await
            .unwrap();
        manager
            .update_job_status(recent, JobUpdate::completed(json!({})))
            .await
            .unwrap();

        let stats = manager.stats().await.unwrap();
        assert_eq!(stats.active_jobs, 2);
        assert_eq!(stats.completed_jobs_24h, 1);
        assert_eq!(stats.queue_length, 3);

        let active = manager.get_active_jobs(10).await.unwrap();
        let ids: Vec<JobId> = active.iter().map(|job| job.id).collect();
        assert!(ids.contains(&pending) && ids.contains(&running));
    }

    #[tokio::test]
    async fn cleanup_deletes_old_jobs_regardless_of_status() {
        let (manager, backend) = manager();
        let fresh = create(&manager).await;
        for status in [JobStatus::Pending, JobStatus::Completed] {
            let mut old = JobRecord::new(BATCH_PROCESSING, json!({}), Utc::now());
            old.created_at = Utc::now() - chrono::Duration::days(8);
            old.status = status;
            backend.put(&old, DEFAULT_JOB_TTL).await.unwrap();
        }

        assert_eq!(manager.cleanup_old_jobs(7).await.unwrap(), 2);
        assert_eq!(backend.record_count().await, 1);
        assert!(manager.get_job_status(fresh).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn cleanup_drops_deleted_pending_jobs_from_queue() {
        let (manager, backend) = manager();
        let fresh = create(&manager).await;
        let old = create(&manager).await;
        let mut record = manager.get_job_status(old).await.unwrap().unwrap();
        record.created_at = Utc::now() - chrono::Duration::days(8);
        backend.put(&record, DEFAULT_JOB_TTL).await.unwrap();

        assert_eq!(manager.cleanup_old_jobs(7).await.unwrap(), 1);
        assert_eq!(manager.get_job_queue_length().await.unwrap(), 1);
        assert_eq!(manager.stats().await.unwrap().queue_length, 1);
        assert_eq!(manager.next_job().await.unwrap(), Some(fresh));
    }

    // =========================================================================
    // Store Failure Tests
    // =========================================================================

    #[tokio::test]
    async fn store_outage_propagates_as_error() {
        let manager = JobManager::with_backend(DownBackend);

        assert!(matches!(
            manager.create_job(BATCH_PROCESSING, json!({})).await,
            Err(JobManagerError::Store(StoreError::Unavailable(_)))
        ));
        assert!(manager.get_job_status(JobId::new()).await.is_err());
        assert!(manager.cancel_job(JobId::new()).await.is_err());
        assert!(manager.retry_failed_job(JobId::new()).await.is_err());
        assert!(manager.stats().await.is_err());
    }

    fn unqueueable(backend: &MemoryBackend) -> JobManager {
        JobManager::new(
            Arc::new(backend.clone()),
            Arc::new(DownBackend),
            ManagerConfig::default(),
        )
    }

    #[tokio::test]
    async fn failed_enqueue_leaves_no_record_behind() {
        let backend = MemoryBackend::new();
        let manager = unqueueable(&backend);

        assert!(manager.create_job(BATCH_PROCESSING, json!({})).await.is_err());
        assert_eq!(backend.record_count().await, 0);
        assert_eq!(manager.get_active_jobs_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_enqueue_keeps_retried_job_failed() {
        let (manager, backend) = manager();
        let id = create(&manager).await;
        fail(&manager, id).await;

        let broken = unqueueable(&backend);
        assert!(broken.retry_failed_job(id).await.is_err());

        let job = manager.get_job_status(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("engine error"));
        assert!(manager.retry_failed_job(id).await.unwrap());
    }
}
