//! Redis-backed job records and work queue.
//!
//! Key layout under a configurable prefix:
//!
//! | Key                        | Type   | Contents                       |
//! |----------------------------|--------|--------------------------------|
//! | `<prefix>:record:<job_id>` | string | JSON job record, with expiry   |
//! | `<prefix>:status:<status>` | set    | ids last written in `status`   |
//! | `<prefix>:queue`           | list   | pending ids, LPUSH / RPOP      |
//!
//! Status sets are maintained in the same MULTI block as the record write.
//! Records expire on their own, so a set may briefly hold ids whose record
//! is gone; readers drop those lazily.

use std::time::Duration;

use async_trait::async_trait;
use redis::Client;
use redis::aio::ConnectionManager;
use tracing::{debug, error};

use super::{JobStore, WorkQueue};
use crate::error::StoreError;
use crate::job::{JobId, JobRecord, JobStatus};

const SCAN_BATCH: usize = 200;

/// Job store and work queue backed by a Redis-compatible server.
///
/// Cloning shares the underlying multiplexed connection.
#[derive(Clone)]
pub struct RedisBackend {
    conn: ConnectionManager,
    prefix: String,
}

fn unavailable(op: &str, e: redis::RedisError) -> StoreError {
    error!(op, error = %e, "Redis command failed");
    StoreError::Unavailable(format!("Redis {op} error: {e}"))
}

impl RedisBackend {
    /// Connect to `url` and verify the server answers.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the client cannot be created
    /// or the server does not answer PING.
    pub async fn connect(url: &str, prefix: impl Into<String>) -> Result<Self, StoreError> {
        let client = Client::open(url).map_err(|e| unavailable("client", e))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| unavailable("connect", e))?;

        let backend = Self {
            conn,
            prefix: prefix.into(),
        };
        backend.ping().await?;

        debug!(prefix = %backend.prefix, "Connected to Redis job store");
        Ok(backend)
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn record_key(&self, id: JobId) -> String {
        format!("{}:record:{}", self.prefix, id)
    }

    fn status_key(&self, status: JobStatus) -> String {
        format!("{}:status:{}", self.prefix, status)
    }

    fn queue_key(&self) -> String {
        format!("{}:queue", self.prefix)
    }

    async fn fetch_records(&self, keys: &[String]) -> Result<Vec<JobRecord>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let values = redis::cmd("MGET")
            .arg(keys)
            .query_async::<Vec<Option<String>>>(&mut conn)
            .await
            .map_err(|e| unavailable("MGET", e))?;

        let mut records = Vec::with_capacity(values.len());
        for value in values.into_iter().flatten() {
            records.push(serde_json::from_str(&value)?);
        }
        Ok(records)
    }
}

#[async_trait]
impl JobStore for RedisBackend {
    async fn put(&self, record: &JobRecord, ttl: Duration) -> Result<(), StoreError> {
        let json = serde_json::to_string(record)?;
        let id = record.id.to_string();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("SET")
            .arg(self.record_key(record.id))
            .arg(json)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .ignore();
        for status in JobStatus::ALL {
            if status != record.status {
                pipe.cmd("SREM")
                    .arg(self.status_key(status))
                    .arg(&id)
                    .ignore();
            }
        }
        pipe.cmd("SADD")
            .arg(self.status_key(record.status))
            .arg(&id)
            .ignore();

        let mut conn = self.conn.clone();
        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(|e| unavailable("SET", e))
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let value = redis::cmd("GET")
            .arg(self.record_key(id))
            .query_async::<Option<String>>(&mut conn)
            .await
            .map_err(|e| unavailable("GET", e))?;

        match value {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn delete(&self, id: JobId) -> Result<(), StoreError> {
        let id_str = id.to_string();
        let mut pipe = redis::pipe();
        pipe.atomic().cmd("DEL").arg(self.record_key(id)).ignore();
        for status in JobStatus::ALL {
            pipe.cmd("SREM")
                .arg(self.status_key(status))
                .arg(&id_str)
                .ignore();
        }

        let mut conn = self.conn.clone();
        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(|e| unavailable("DEL", e))
    }

    async fn scan(&self) -> Result<Vec<JobRecord>, StoreError> {
        let pattern = format!("{}:record:*", self.prefix);
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut records = Vec::new();

        loop {
            let (next, keys) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async::<(u64, Vec<String>)>(&mut conn)
                .await
                .map_err(|e| unavailable("SCAN", e))?;

            records.extend(self.fetch_records(&keys).await?);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(records)
    }

    async fn scan_status(&self, status: JobStatus) -> Result<Vec<JobRecord>, StoreError> {
        let set_key = self.status_key(status);
        let mut conn = self.conn.clone();
        let ids = redis::cmd("SMEMBERS")
            .arg(&set_key)
            .query_async::<Vec<String>>(&mut conn)
            .await
            .map_err(|e| unavailable("SMEMBERS", e))?;

        let keys: Vec<String> = ids
            .iter()
            .map(|id| format!("{}:record:{}", self.prefix, id))
            .collect();
        let records = self.fetch_records(&keys).await?;

        // Drop ids whose record expired or moved on since the set was read
        let stale: Vec<&String> = ids
            .iter()
            .filter(|id| {
                !records
                    .iter()
                    .any(|record| record.id.to_string() == **id && record.status == status)
            })
            .collect();
        if !stale.is_empty() {
            redis::cmd("SREM")
                .arg(&set_key)
                .arg(&stale)
                .query_async::<i64>(&mut conn)
                .await
                .map_err(|e| unavailable("SREM", e))?;
        }

        Ok(records
            .into_iter()
            .filter(|record| record.status == status)
            .collect())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(|e| unavailable("PING", e))?;
        Ok(())
    }
}

#[async_trait]
impl WorkQueue for RedisBackend {
    async fn enqueue(&self, id: JobId) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("LPUSH")
            .arg(self.queue_key())
            .arg(id.to_string())
            .query_async::<i64>(&mut conn)
            .await
            .map_err(|e| unavailable("LPUSH", e))?;
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<JobId>, StoreError> {
        let mut conn = self.conn.clone();
        let value = redis::cmd("RPOP")
            .arg(self.queue_key())
            .query_async::<Option<String>>(&mut conn)
            .await
            .map_err(|e| unavailable("RPOP", e))?;

        let Some(value) = value else {
            return Ok(None);
        };
        match value.parse() {
            Ok(id) => Ok(Some(id)),
            Err(e) => {
                error!(value = %value, error = %e, "Discarding malformed id from work queue");
                Ok(None)
            }
        }
    }

    async fn remove(&self, id: JobId) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        let removed = redis::cmd("LREM")
            .arg(self.queue_key())
            .arg(0)
            .arg(id.to_string())
            .query_async::<usize>(&mut conn)
            .await
            .map_err(|e| unavailable("LREM", e))?;
        Ok(removed)
    }

    async fn len(&self) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("LLEN")
            .arg(self.queue_key())
            .query_async::<usize>(&mut conn)
            .await
            .map_err(|e| unavailable("LLEN", e))
    }
}
