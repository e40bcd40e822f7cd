//! Job record model and the status state machine.
//!
//! Every mutation of a [`JobRecord`] goes through [`JobRecord::apply`] or
//! [`JobRecord::retry`], which validate the requested edge against
//! [`JobStatus::valid_transitions`].
//!
//! ```text
//!             ┌── progress ──┐          ┌── progress ──┐
//!             ▼              │          ▼              │
//!          Pending ──────────┴──► Processing ──────────┴──► Completed
//!           │   ▲                  │      │
//!           │   └──── retry ──── Failed ◄─┘
//!           │                             │
//!           └────────► Cancelled ◄────────┘
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::error::TransitionError;
use crate::progress::{COMPLETE, MAX_IN_FLIGHT};

/// Job type tag for uploaded file batches.
pub const BATCH_PROCESSING: &str = "batch_processing";

/// Opaque unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Generate a fresh random identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for JobId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting in the work queue.
    Pending,
    /// Claimed by a worker; the engine call is running.
    Processing,
    /// Finished with a result.
    Completed,
    /// Finished with an error.
    Failed,
    /// Withdrawn by a client.
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        Self::Pending,
        Self::Processing,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
    ];

    /// Returns the set of valid target states from the current state.
    ///
    /// `Pending -> Pending` and `Processing -> Processing` are progress-only
    /// updates. `Failed -> Pending` is the retry edge.
    #[must_use]
    pub fn valid_transitions(&self) -> &'static [JobStatus] {
        match self {
            Self::Pending => &[Self::Pending, Self::Processing, Self::Cancelled],
            Self::Processing => &[
                Self::Processing,
                Self::Completed,
                Self::Failed,
                Self::Cancelled,
            ],
            Self::Failed => &[Self::Pending],
            Self::Completed | Self::Cancelled => &[],
        }
    }

    /// Check whether transitioning to `target` is allowed from the current state.
    #[must_use]
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        self.valid_transitions().contains(&target)
    }

    /// Whether this status represents a final state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether the job is still waiting or running.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Processing)
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when parsing an unknown status name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unknown job status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for JobStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

/// Persisted state of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    #[serde(alias = "job_id")]
    pub id: JobId,
    pub job_type: String,
    pub status: JobStatus,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub progress: u8,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl JobRecord {
    /// A fresh `pending` record with zero progress.
    #[must_use]
    pub fn new(job_type: impl Into<String>, payload: Value, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            job_type: job_type.into(),
            status: JobStatus::Pending,
            payload,
            created_at: now,
            updated_at: now,
            progress: 0,
            result: None,
            error: None,
        }
    }

    /// Apply a status update in place.
    ///
    /// Progress never moves backwards while the job is active and is capped
    /// below 100 until completion. `result` is only kept on the completion
    /// edge and `error` only on the failure edge. The retry edge is not
    /// reachable from here, use [`JobRecord::retry`].
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError`] and leaves the record untouched when the
    /// update is not an edge of the state machine.
    pub fn apply(&mut self, update: &JobUpdate, now: DateTime<Utc>) -> Result<(), TransitionError> {
        let from = self.status;
        let to = update.status;
        if from == JobStatus::Failed || !from.can_transition_to(to) {
            return Err(TransitionError { from, to });
        }

        match to {
            JobStatus::Pending | JobStatus::Processing => {
                if let Some(progress) = update.progress {
                    self.progress = self.progress.max(progress.min(MAX_IN_FLIGHT));
                }
            }
            JobStatus::Completed => {
                self.progress = COMPLETE;
                self.result = Some(update.result.clone().unwrap_or(Value::Null));
                self.error = None;
            }
            JobStatus::Failed => {
                self.progress = 0;
                self.result = None;
                self.error = Some(
                    update
                        .error
                        .clone()
                        .unwrap_or_else(|| "job failed without an error description".to_string()),
                );
            }
            JobStatus::Cancelled => {}
        }

        self.status = to;
        self.updated_at = now;
        Ok(())
    }

    /// Take the retry edge: `failed -> pending`, progress and error reset.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError`] when the job is not `failed`.
    pub fn retry(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if self.status != JobStatus::Failed {
            return Err(TransitionError {
                from: self.status,
                to: JobStatus::Pending,
            });
        }
        self.status = JobStatus::Pending;
        self.progress = 0;
        self.error = None;
        self.result = None;
        self.updated_at = now;
        Ok(())
    }
}

/// Requested change to a job record.
#[derive(Debug, Clone, PartialEq)]
pub struct JobUpdate {
    pub status: JobStatus,
    pub progress: Option<u8>,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl JobUpdate {
    #[must_use]
    pub fn new(status: JobStatus) -> Self {
        Self {
            status,
            progress: None,
            result: None,
            error: None,
        }
    }

    #[must_use]
    pub fn processing(progress: u8) -> Self {
        Self::new(JobStatus::Processing).progress(progress)
    }

    #[must_use]
    pub fn completed(result: Value) -> Self {
        Self::new(JobStatus::Completed)
            .progress(COMPLETE)
            .result(result)
    }

    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self::new(JobStatus::Failed).progress(0).error(error)
    }

    #[must_use]
    pub fn progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress);
        self
    }

    #[must_use]
    pub fn result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    #[must_use]
    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> JobRecord {
        JobRecord::new(BATCH_PROCESSING, json!({"files": ["a.dcm"]}), Utc::now())
    }

    // =========================================================================
    // State Machine Tests
    // =========================================================================

    #[test]
    fn terminal_states_have_no_outgoing_edges_except_retry() {
        assert!(JobStatus::Completed.valid_transitions().is_empty());
        assert!(JobStatus::Cancelled.valid_transitions().is_empty());
        assert_eq!(JobStatus::Failed.valid_transitions(), &[JobStatus::Pending]);
        for status in JobStatus::ALL {
            assert_eq!(
                status.is_terminal(),
                matches!(
                    status,
                    JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
                )
            );
        }
    }

    #[test]
    fn pending_cannot_complete_without_processing() {
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Failed));
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Processing));
    }

    #[test]
    fn status_parses_case_insensitively() {
        assert_eq!("Processing".parse::<JobStatus>(), Ok(JobStatus::Processing));
        assert_eq!(
            "running".parse::<JobStatus>(),
            Err(UnknownStatus("running".to_string()))
        );
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&JobStatus::Cancelled).unwrap(),
            "\"cancelled\""
        );
    }

    // =========================================================================
    // Apply Tests
    // =========================================================================

    #[test]
    fn new_record_is_pending_with_zero_progress() {
        let job = record();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.progress, 0);
        assert_eq!(job.created_at, job.updated_at);
        assert!(job.result.is_none() && job.error.is_none());
    }

    #[test]
    fn processing_progress_never_decreases() {
        let mut job = record();
        job.apply(&JobUpdate::processing(60), Utc::now()).unwrap();
        job.apply(&JobUpdate::processing(40), Utc::now()).unwrap();
        assert_eq!(job.progress, 60);
    }

    #[test]
    fn progress_stays_below_complete_until_completion() {
        let mut job = record();
        job.apply(&JobUpdate::processing(100), Utc::now()).unwrap();
        assert_eq!(job.progress, MAX_IN_FLIGHT);

        job.apply(&JobUpdate::completed(json!({"ok": true})), Utc::now())
            .unwrap();
        assert_eq!(job.progress, COMPLETE);
        assert_eq!(job.result, Some(json!({"ok": true})));
        assert_eq!(job.error, None);
    }

    #[test]
    fn failure_records_error_and_resets_progress() {
        let mut job = record();
        job.apply(&JobUpdate::processing(70), Utc::now()).unwrap();
        job.apply(&JobUpdate::failed("engine exploded"), Utc::now())
            .unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.progress, 0);
        assert_eq!(job.error.as_deref(), Some("engine exploded"));
        assert!(job.result.is_none());
    }

    #[test]
    fn rejected_update_leaves_record_untouched() {
        let mut job = record();
        job.apply(&JobUpdate::processing(50), Utc::now()).unwrap();
        job.apply(&JobUpdate::completed(json!(1)), Utc::now()).unwrap();
        let before = job.clone();

        let err = job
            .apply(&JobUpdate::new(JobStatus::Cancelled), Utc::now())
            .unwrap_err();
        assert_eq!(
            err,
            TransitionError {
                from: JobStatus::Completed,
                to: JobStatus::Cancelled
            }
        );
        assert_eq!(job, before);
    }

    #[test]
    fn retry_edge_is_not_reachable_through_apply() {
        let mut job = record();
        job.apply(&JobUpdate::processing(50), Utc::now()).unwrap();
        job.apply(&JobUpdate::failed("boom"), Utc::now()).unwrap();
        assert!(job.apply(&JobUpdate::new(JobStatus::Pending), Utc::now()).is_err());
        assert_eq!(job.status, JobStatus::Failed);
    }

    #[test]
    fn retry_resets_failed_job() {
        let mut job = record();
        job.apply(&JobUpdate::processing(50), Utc::now()).unwrap();
        job.apply(&JobUpdate::failed("boom"), Utc::now()).unwrap();

        job.retry(Utc::now()).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.progress, 0);
        assert_eq!(job.error, None);
    }

    #[test]
    fn retry_rejects_non_failed_job() {
        let mut job = record();
        assert!(job.retry(Utc::now()).is_err());
    }

    #[test]
    fn identical_updates_are_idempotent() {
        let mut once = record();
        let mut twice = once.clone();
        let update = JobUpdate::processing(55);
        let now = Utc::now();

        once.apply(&update, now).unwrap();
        twice.apply(&update, now).unwrap();
        twice.apply(&update, now).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn record_reads_legacy_job_id_field() {
        let job = record();
        let mut value = serde_json::to_value(&job).unwrap();
        let id = value.as_object_mut().unwrap().remove("id").unwrap();
        value["job_id"] = id;

        let decoded: JobRecord = serde_json::from_value(value).unwrap();
        assert_eq!(decoded, job);
    }
}
