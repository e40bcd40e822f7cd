//! Storage backends for job records and the work queue.
//!
//! This module provides:
//! - [`JobStore`] trait - Keyed record persistence with expiry
//! - [`WorkQueue`] trait - FIFO handoff of pending job ids
//! - [`MemoryBackend`] - In-process implementation of both, for tests and single-node use
//! - `RedisBackend` - Durable implementation of both (requires the `redis` feature)

use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::job::{JobId, JobRecord, JobStatus};

mod memory;
#[cfg(feature = "redis")]
mod redis;

pub use memory::MemoryBackend;
#[cfg(feature = "redis")]
pub use self::redis::RedisBackend;

/// Durable keyed storage of job records.
///
/// Absence is a normal outcome: `get` returns `Ok(None)` for unknown or
/// expired ids and `delete` is idempotent. Only backend failures are errors.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Write `record`, replacing any previous version and resetting its expiry.
    async fn put(&self, record: &JobRecord, ttl: Duration) -> Result<(), StoreError>;

    /// Read the current record for `id`.
    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, StoreError>;

    /// Remove the record for `id` if present.
    async fn delete(&self, id: JobId) -> Result<(), StoreError>;

    /// Snapshot of every non-expired record.
    ///
    /// Records written or deleted while the scan runs may or may not appear.
    async fn scan(&self) -> Result<Vec<JobRecord>, StoreError>;

    /// Snapshot of every non-expired record currently in `status`.
    ///
    /// Backends that keep a per-status index should override this; the
    /// default filters a full [`scan`](JobStore::scan).
    async fn scan_status(&self, status: JobStatus) -> Result<Vec<JobRecord>, StoreError> {
        let mut records = self.scan().await?;
        records.retain(|record| record.status == status);
        Ok(records)
    }

    /// Check that the backend is reachable.
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Ordered handoff of pending job ids.
///
/// Ids are pushed at the producing end and popped from the consuming end, so
/// retried and newly created jobs share one arrival order.
#[async_trait]
pub trait WorkQueue: Send + Sync + 'static {
    /// Push `id` at the producing end.
    async fn enqueue(&self, id: JobId) -> Result<(), StoreError>;

    /// Pop the oldest id, or `Ok(None)` if the queue is empty.
    async fn dequeue(&self) -> Result<Option<JobId>, StoreError>;

    /// Remove every queued occurrence of `id`. Returns how many were removed.
    async fn remove(&self, id: JobId) -> Result<usize, StoreError>;

    /// Number of queued ids.
    async fn len(&self) -> Result<usize, StoreError>;

    /// Wait for a new id to be enqueued or for the timeout to expire.
    ///
    /// Backends can implement event-driven notifications to wake workers quickly.
    async fn wait_for_job(&self, timeout: Duration) -> Result<(), StoreError> {
        tokio::time::sleep(timeout).await;
        Ok(())
    }
}
