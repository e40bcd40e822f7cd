//! In-memory storage implementation for testing and single-process use.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use super::{JobStore, WorkQueue};
use crate::error::StoreError;
use crate::job::{JobId, JobRecord, JobStatus};

/// In-memory job records and work queue.
///
/// Records expire `ttl` after their last write, measured on tokio's clock so
/// tests can drive expiry with a paused runtime. A per-status index is
/// updated under the same lock as the record it describes.
///
/// # Cloning
///
/// Cloning creates a new handle to the **same** underlying state.
///
/// # Example
///
/// ```rust,ignore
/// use batch_job_queue::{JobManager, MemoryBackend};
///
/// let backend = MemoryBackend::new();
/// let manager = JobManager::with_backend(backend.clone());
/// ```
#[derive(Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
}

struct Entry {
    record: JobRecord,
    expires_at: Instant,
}

#[derive(Default)]
struct Inner {
    records: HashMap<JobId, Entry>,
    by_status: HashMap<JobStatus, HashSet<JobId>>,
    queue: VecDeque<JobId>,
}

impl Inner {
    fn evict(&mut self, id: JobId) -> Option<Entry> {
        let entry = self.records.remove(&id)?;
        if let Some(ids) = self.by_status.get_mut(&entry.record.status) {
            ids.remove(&id);
        }
        Some(entry)
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<JobId> = self
            .records
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.evict(*id);
        }
        expired.len()
    }
}

impl MemoryBackend {
    /// Create a new empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (non-expired) records.
    #[must_use = "this returns the count, it doesn't modify the store"]
    pub async fn record_count(&self) -> usize {
        let now = Instant::now();
        self.inner
            .lock()
            .await
            .records
            .values()
            .filter(|entry| entry.expires_at > now)
            .count()
    }

    /// Drop every expired record now instead of on next access.
    pub async fn purge_expired(&self) -> usize {
        self.inner.lock().await.purge_expired(Instant::now())
    }
}

#[async_trait]
impl JobStore for MemoryBackend {
    async fn put(&self, record: &JobRecord, ttl: Duration) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.evict(record.id);
        inner
            .by_status
            .entry(record.status)
            .or_default()
            .insert(record.id);
        inner.records.insert(
            record.id,
            Entry {
                record: record.clone(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
        let mut inner = self.inner.lock().await;
        let expired = match inner.records.get(&id) {
            Some(entry) if entry.expires_at > Instant::now() => {
                return Ok(Some(entry.record.clone()));
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            inner.evict(id);
        }
        Ok(None)
    }

    async fn delete(&self, id: JobId) -> Result<(), StoreError> {
        self.inner.lock().await.evict(id);
        Ok(())
    }

    async fn scan(&self) -> Result<Vec<JobRecord>, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.purge_expired(Instant::now());
        Ok(inner
            .records
            .values()
            .map(|entry| entry.record.clone())
            .collect())
    }

    async fn scan_status(&self, status: JobStatus) -> Result<Vec<JobRecord>, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.purge_expired(Instant::now());
        let Some(ids) = inner.by_status.get(&status) else {
            return Ok(Vec::new());
        };
        Ok(ids
            .iter()
            .filter_map(|id| inner.records.get(id))
            .map(|entry| entry.record.clone())
            .collect())
    }
}

#[async_trait]
impl WorkQueue for MemoryBackend {
    async fn enqueue(&self, id: JobId) -> Result<(), StoreError> {
        self.inner.lock().await.queue.push_front(id);
        self.notify.notify_one();
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<JobId>, StoreError> {
        Ok(self.inner.lock().await.queue.pop_back())
    }

    async fn remove(&self, id: JobId) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock().await;
        let before = inner.queue.len();
        inner.queue.retain(|queued| *queued != id);
        Ok(before - inner.queue.len())
    }

    async fn len(&self) -> Result<usize, StoreError> {
        Ok(self.inner.lock().await.queue.len())
    }

    async fn wait_for_job(&self, timeout: Duration) -> Result<(), StoreError> {
        // Timing out just means the caller polls again.
        let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
