//! Execution supervisor: a fixed worker pool between the work queue and the
//! inference engine.
//!
//! The pool has exactly `max_concurrent_jobs` workers and each worker runs
//! one job at a time, so the pool size is the concurrency cap. Ready work
//! beyond the cap stays in the queue.
//!
//! ```text
//!  WorkQueue ──► worker 0 ──┐
//!            ──► worker 1 ──┼──► InferenceEngine::process ──► JobManager::update_job_status
//!            ──► worker N ──┘
//! ```

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::engine::{InferenceEngine, InputLayout, ProgressReporter};
use crate::error::{JobManagerError, SupervisorError};
use crate::job::{JobId, JobStatus, JobUpdate};
use crate::manager::{JobManager, JobStats, UpdateOutcome};
use crate::progress::STAGING_END;

/// Configuration for the [`Supervisor`].
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use batch_job_queue::SupervisorConfig;
///
/// let config = SupervisorConfig {
///     max_concurrent_jobs: 2,
///     job_timeout: Duration::from_secs(600),
///     ..SupervisorConfig::default()
/// };
/// assert_eq!(config.retention_days, 7);
/// ```
#[derive(Clone, Debug)]
pub struct SupervisorConfig {
    /// Number of workers, and so the most jobs that run at once.
    pub max_concurrent_jobs: usize,

    /// Wall-clock budget for one engine call, measured from its start.
    pub job_timeout: Duration,

    /// How long an idle worker waits before polling the queue again.
    pub poll_interval: Duration,

    /// How often to sweep old jobs. `None` disables the sweep.
    pub cleanup_interval: Option<Duration>,

    /// Age in days past which the sweep deletes a job.
    pub retention_days: u32,
}

impl Default for SupervisorConfig {
    /// - `max_concurrent_jobs`: 3
    /// - `job_timeout`: 1 hour
    /// - `poll_interval`: 1 second
    /// - `cleanup_interval`: disabled
    /// - `retention_days`: 7
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 3,
            job_timeout: Duration::from_secs(3600),
            poll_interval: Duration::from_secs(1),
            cleanup_interval: None,
            retention_days: 7,
        }
    }
}

impl SupervisorConfig {
    fn validate(&self) -> Result<(), SupervisorError> {
        if self.max_concurrent_jobs == 0 {
            return Err(SupervisorError::InvalidConfig(
                "max_concurrent_jobs must be greater than 0".into(),
            ));
        }
        if self.job_timeout.is_zero() {
            return Err(SupervisorError::InvalidConfig(
                "job_timeout must be greater than 0".into(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(SupervisorError::InvalidConfig(
                "poll_interval must be greater than 0".into(),
            ));
        }
        if self.cleanup_interval.is_some_and(|interval| interval.is_zero()) {
            return Err(SupervisorError::InvalidConfig(
                "cleanup_interval must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// Overall health of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    /// The store answers but the engine cannot take work.
    Degraded,
    /// The store is unreachable.
    Unhealthy,
}

/// Snapshot of engine, store and pool state.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub engine_ready: bool,
    pub engine_capacity: Map<String, Value>,
    pub store_reachable: bool,
    pub max_concurrent_jobs: usize,
    pub jobs_in_flight: usize,
    pub stats: Option<JobStats>,
}

/// Builder for a [`Supervisor`].
pub struct SupervisorBuilder {
    manager: JobManager,
    engine: Option<Arc<dyn InferenceEngine>>,
    layout: InputLayout,
    config: SupervisorConfig,
}

impl SupervisorBuilder {
    #[must_use]
    pub fn engine(mut self, engine: Arc<dyn InferenceEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    #[must_use]
    pub fn input_layout(mut self, layout: InputLayout) -> Self {
        self.layout = layout;
        self
    }

    #[must_use]
    pub fn config(mut self, config: SupervisorConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn max_concurrent_jobs(mut self, max: usize) -> Self {
        self.config.max_concurrent_jobs = max;
        self
    }

    #[must_use]
    pub fn job_timeout(mut self, timeout: Duration) -> Self {
        self.config.job_timeout = timeout;
        self
    }

    #[must_use]
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    /// Sweep jobs older than `retention_days` every `interval`.
    #[must_use]
    pub fn cleanup(mut self, interval: Duration, retention_days: u32) -> Self {
        self.config.cleanup_interval = Some(interval);
        self.config.retention_days = retention_days;
        self
    }

    /// Validate the configuration and start the workers.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::MissingEngine`] if no engine was set, or
    /// [`SupervisorError::InvalidConfig`] if any interval or the concurrency
    /// cap is zero.
    #[must_use = "supervisor must be stored to keep workers running"]
    pub fn build(self) -> Result<Supervisor, SupervisorError> {
        let engine = self.engine.ok_or(SupervisorError::MissingEngine)?;
        Supervisor::start(self.manager, engine, self.layout, self.config)
    }
}

/// Shared state handed to every worker.
struct WorkerContext {
    manager: JobManager,
    engine: Arc<dyn InferenceEngine>,
    layout: InputLayout,
    job_timeout: Duration,
    in_flight: Arc<AtomicUsize>,
}

/// Bounded-concurrency pool executing queued jobs.
///
/// # Lifecycle
///
/// 1. Create with [`Supervisor::builder`]
/// 2. Workers start polling the queue immediately
/// 3. Call [`Supervisor::shutdown`] to stop them once in-flight jobs finish
///
/// # Example
///
/// ```rust,ignore
/// use batch_job_queue::{JobManager, MemoryBackend, Supervisor};
///
/// let manager = JobManager::with_backend(MemoryBackend::new());
/// let supervisor = Supervisor::builder(manager.clone())
///     .engine(engine)
///     .max_concurrent_jobs(2)
///     .build()?;
///
/// // Jobs created through `manager` are picked up in the background...
///
/// supervisor.shutdown().await?;
/// ```
pub struct Supervisor {
    workers: Vec<JoinHandle<()>>,
    shutdown_tx: broadcast::Sender<()>,
    manager: JobManager,
    engine: Arc<dyn InferenceEngine>,
    in_flight: Arc<AtomicUsize>,
    max_concurrent_jobs: usize,
}

impl Supervisor {
    #[must_use]
    pub fn builder(manager: JobManager) -> SupervisorBuilder {
        SupervisorBuilder {
            manager,
            engine: None,
            layout: InputLayout::default(),
            config: SupervisorConfig::default(),
        }
    }

    fn start(
        manager: JobManager,
        engine: Arc<dyn InferenceEngine>,
        layout: InputLayout,
        config: SupervisorConfig,
    ) -> Result<Self, SupervisorError> {
        config.validate()?;

        let (shutdown_tx, _) = broadcast::channel(1);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let context = Arc::new(WorkerContext {
            manager: manager.clone(),
            engine: engine.clone(),
            layout,
            job_timeout: config.job_timeout,
            in_flight: in_flight.clone(),
        });

        let mut workers = Vec::with_capacity(config.max_concurrent_jobs + 1);
        for worker_id in 0..config.max_concurrent_jobs {
            let context = context.clone();
            let shutdown_rx = shutdown_tx.subscribe();
            let poll_interval = config.poll_interval;
            workers.push(tokio::spawn(async move {
                context.worker_loop(worker_id, poll_interval, shutdown_rx).await;
            }));
        }

        if let Some(interval) = config.cleanup_interval {
            workers.push(tokio::spawn(cleanup_loop(
                manager.clone(),
                interval,
                config.retention_days,
                shutdown_tx.subscribe(),
            )));
        }

        info!(
            max_concurrent_jobs = config.max_concurrent_jobs,
            job_timeout_secs = config.job_timeout.as_secs(),
            "Job supervisor started"
        );

        Ok(Self {
            workers,
            shutdown_tx,
            manager,
            engine,
            in_flight,
            max_concurrent_jobs: config.max_concurrent_jobs,
        })
    }

    #[must_use]
    pub fn manager(&self) -> &JobManager {
        &self.manager
    }

    /// Number of engine calls currently running.
    #[must_use]
    pub fn jobs_in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Engine readiness, store reachability and job counters.
    pub async fn health(&self) -> HealthReport {
        let engine_ready = self.engine.is_ready();
        let store_reachable = match self.manager.ping().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Job store health check failed");
                false
            }
        };
        let stats = if store_reachable {
            self.manager.stats().await.ok()
        } else {
            None
        };

        let status = if !store_reachable {
            HealthStatus::Unhealthy
        } else if !engine_ready {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        HealthReport {
            status,
            engine_ready,
            engine_capacity: self.engine.capacity_info(),
            store_reachable,
            max_concurrent_jobs: self.max_concurrent_jobs,
            jobs_in_flight: self.jobs_in_flight(),
            stats,
        }
    }

    /// Stop accepting work and wait for every worker to finish its current job.
    ///
    /// Jobs still queued stay in the work queue for the next start.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::WorkerPanicked`] if any worker task panicked.
    pub async fn shutdown(self) -> Result<(), SupervisorError> {
        // Send shutdown signal to all workers
        let _ = self.shutdown_tx.send(());

        for (idx, handle) in self.workers.into_iter().enumerate() {
            handle.await.map_err(|e| {
                SupervisorError::WorkerPanicked(format!("Worker {} panicked: {}", idx, e))
            })?;
        }

        info!("All job workers shut down successfully");
        Ok(())
    }

    /// Shut down an `Arc<Supervisor>` if it's the last reference.
    ///
    /// - If this is the last `Arc` reference, shuts the pool down and awaits completion
    /// - If other references exist, logs a warning and returns without shutdown
    pub async fn shutdown_arc(self: Arc<Self>) {
        info!("Shutting down job supervisor...");
        match Arc::try_unwrap(self) {
            Ok(supervisor) => {
                if let Err(e) = supervisor.shutdown().await {
                    error!(error = %e, "Error shutting down job supervisor");
                }
            }
            Err(_) => {
                warn!("Could not shut down job supervisor - still has active references");
            }
        }
    }
}

impl WorkerContext {
    async fn worker_loop(
        &self,
        worker_id: usize,
        poll_interval: Duration,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        debug!(worker_id, "Worker starting");

        loop {
            // A closed channel means the supervisor was dropped
            if !matches!(shutdown_rx.try_recv(), Err(TryRecvError::Empty)) {
                debug!(worker_id, "Worker received shutdown signal");
                break;
            }

            match self.manager.next_job().await {
                Ok(Some(job_id)) => {
                    debug!(worker_id, job_id = %job_id, "Worker claimed job");
                    if let Err(e) = self.run_job(job_id).await {
                        warn!(worker_id, job_id = %job_id, error = %e, "Could not start job, returning it to the queue");
                        if !self.requeue(job_id, poll_interval, &mut shutdown_rx).await {
                            break;
                        }
                    }
                }
                Ok(None) => {
                    tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        waited = self.manager.wait_for_job(poll_interval) => {
                            if let Err(e) = waited {
                                error!(worker_id, error = %e, "Failed to wait for jobs");
                                tokio::time::sleep(poll_interval).await;
                            }
                        }
                    }
                }
                Err(e) => {
                    error!(worker_id, error = %e, "Failed to poll job queue");
                    tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        _ = tokio::time::sleep(poll_interval) => {}
                    }
                }
            }
        }

        debug!(worker_id, "Worker shutting down");
    }

    /// Back off, then put `job_id` back on the queue, retrying until the
    /// store accepts it. On shutdown the id gets one last attempt and
    /// `false` is returned.
    async fn requeue(
        &self,
        job_id: JobId,
        poll_interval: Duration,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> bool {
        loop {
            let shutting_down = tokio::select! {
                _ = shutdown_rx.recv() => true,
                _ = tokio::time::sleep(poll_interval) => false,
            };
            match self.manager.requeue(job_id).await {
                Ok(()) => return !shutting_down,
                Err(e) if shutting_down => {
                    error!(job_id = %job_id, error = %e, "Shutting down with job neither started nor queued");
                    return false;
                }
                Err(e) => error!(job_id = %job_id, error = %e, "Failed to requeue job"),
            }
        }
    }

    /// Execute one dequeued job. Every outcome, including panics and
    /// timeouts, ends up in the job record.
    ///
    /// Store errors before the engine call starts are returned so the
    /// caller can put the id back; the job is still `pending` then.
    async fn run_job(&self, job_id: JobId) -> Result<(), JobManagerError> {
        let Some(record) = self.manager.get_job_status(job_id).await? else {
            debug!(job_id = %job_id, "Dequeued job no longer exists");
            return Ok(());
        };
        if record.status != JobStatus::Pending {
            debug!(job_id = %job_id, status = %record.status, "Skipping job that is no longer pending");
            return Ok(());
        }

        let outcome = self
            .manager
            .update_job_status(job_id, JobUpdate::processing(STAGING_END))
            .await?;
        if !outcome.is_applied() {
            debug!(job_id = %job_id, ?outcome, "Job could not be started");
            return Ok(());
        }

        let inputs = self.layout.inputs_for(&record);
        let reporter = ProgressReporter::new(self.manager.clone(), job_id, inputs.len());
        let started = Instant::now();

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let call = AssertUnwindSafe(self.engine.process(&inputs, job_id, &reporter)).catch_unwind();
        let outcome = tokio::time::timeout(self.job_timeout, call).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let update = match outcome {
            Ok(Ok(Ok(result))) => {
                info!(job_id = %job_id, elapsed_ms, file_count = inputs.len(), "Job processing completed");
                JobUpdate::completed(result)
            }
            Ok(Ok(Err(e))) => {
                warn!(job_id = %job_id, elapsed_ms, error = %e, "Job processing failed");
                JobUpdate::failed(e.to_string())
            }
            Ok(Err(panic)) => {
                let reason = panic_message(panic.as_ref());
                error!(job_id = %job_id, elapsed_ms, reason, "Inference engine panicked");
                JobUpdate::failed(format!("Inference engine panicked: {reason}"))
            }
            Err(_) => {
                warn!(
                    job_id = %job_id,
                    timeout_secs = self.job_timeout.as_secs_f64(),
                    "Job processing timed out"
                );
                JobUpdate::failed(format!(
                    "Job timed out after {:.1}s",
                    self.job_timeout.as_secs_f64()
                ))
            }
        };

        match self.manager.update_job_status(job_id, update).await {
            Ok(UpdateOutcome::Applied(_)) => {}
            Ok(outcome) => {
                info!(job_id = %job_id, ?outcome, "Discarded outcome of job that changed state while running");
            }
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Failed to record job outcome");
            }
        }
        Ok(())
    }
}

async fn cleanup_loop(
    manager: JobManager,
    interval: Duration,
    retention_days: u32,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = ticker.tick() => {
                if let Err(e) = manager.cleanup_old_jobs(retention_days).await {
                    error!(error = %e, "Failed to clean up old jobs");
                }
            }
        }
    }
    debug!("Cleanup task shutting down");
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
