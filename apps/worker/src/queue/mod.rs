//! Broker queue abstraction
//!
//! The broker owns job records until a worker dequeues them. Implementations
//! must hand each job to exactly one dequeuer, honour strict priority order
//! across classes and FIFO order within a class.

mod job;
mod memory;
mod redis_broker;

pub use job::{JobId, JobMeta, JobOutcome, JobRecord, JobStatus, JobStatusView, Priority};
pub use memory::InMemoryBroker;
pub use redis_broker::{RedisBroker, RedisBrokerOptions, DEFAULT_PREFIX};

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::error::{WorkerError, WorkerResult};

/// Arguments for putting a job on a queue
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub task_name: String,
    pub priority: Priority,
    pub payload: serde_json::Value,
    /// Refuse to create a second active job for the same task
    pub unique: bool,
}

impl EnqueueRequest {
    pub fn new(task_name: impl Into<String>, priority: Priority) -> Self {
        Self {
            task_name: task_name.into(),
            priority,
            payload: serde_json::Value::Object(JobMeta::new()),
            unique: false,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn unique(mut self, unique: bool) -> Self {
        self.unique = unique;
        self
    }
}

/// Result of an enqueue attempt
#[derive(Debug, Clone, PartialEq)]
pub enum Enqueued {
    /// A new job record was created
    Queued(JobRecord),
    /// The task already has a queued or started job
    AlreadyActive(JobId),
}

impl Enqueued {
    pub fn job_id(&self) -> JobId {
        match self {
            Self::Queued(job) => job.id,
            Self::AlreadyActive(id) => *id,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Self::Queued(_))
    }
}

/// Durable FIFO-per-priority job store shared by all processes
#[async_trait]
pub trait Broker: Send + Sync {
    /// Verify the broker is reachable
    async fn ping(&self) -> WorkerResult<()>;

    /// Create a queued job record and append it to its priority queue
    async fn enqueue(&self, request: EnqueueRequest) -> WorkerResult<Enqueued>;

    /// Pop the oldest job from the first non-empty queue in `priorities` and
    /// mark it started. Returns `None` when every queue is empty.
    async fn dequeue(&self, priorities: &[Priority]) -> WorkerResult<Option<JobRecord>>;

    /// Merge keys into a started job's metadata
    async fn update_meta(&self, id: JobId, partial: JobMeta) -> WorkerResult<()>;

    /// Record that the worker owning a started job is still alive
    async fn heartbeat(&self, id: JobId) -> WorkerResult<()>;

    /// Move a started job to its terminal state
    async fn complete(&self, id: JobId, outcome: JobOutcome) -> WorkerResult<JobRecord>;

    /// Fetch a job record
    async fn get(&self, id: JobId) -> WorkerResult<Option<JobRecord>>;

    /// Current queued or started job for a task, if any
    async fn active_job(&self, task_name: &str) -> WorkerResult<Option<JobId>>;

    /// Started jobs whose last heartbeat is older than `heartbeat_before`
    async fn stale_jobs(&self, heartbeat_before: DateTime<Utc>) -> WorkerResult<Vec<JobId>>;

    /// Number of jobs waiting in a priority queue
    async fn queue_len(&self, priority: Priority) -> WorkerResult<usize>;

    /// Take the named lease for `holder`, or extend it when `holder` already
    /// owns it. Returns false while another holder's lease is unexpired.
    async fn acquire_lease(&self, name: &str, holder: &str, ttl: Duration) -> WorkerResult<bool>;

    /// Drop the named lease if `holder` owns it
    async fn release_lease(&self, name: &str, holder: &str) -> WorkerResult<()>;

    /// Persist an enable/disable override for a task, visible to every process
    async fn set_task_enabled(&self, task_name: &str, enabled: bool) -> WorkerResult<()>;

    /// Override stored for a task, `None` when the configured default applies
    async fn task_enabled(&self, task_name: &str) -> WorkerResult<Option<bool>>;

    /// Fetch a job record, failing when it does not exist
    async fn get_status(&self, id: JobId) -> WorkerResult<JobRecord> {
        self.get(id).await?.ok_or(WorkerError::JobNotFound(id))
    }
}

/// Dequeue, polling every `poll_interval` while all queues are empty.
///
/// Returns `None` once `cancel` fires.
pub async fn dequeue_blocking(
    broker: &dyn Broker,
    priorities: &[Priority],
    poll_interval: Duration,
    cancel: &CancellationToken,
) -> WorkerResult<Option<JobRecord>> {
    loop {
        if cancel.is_cancelled() {
            return Ok(None);
        }
        if let Some(job) = broker.dequeue(priorities).await? {
            return Ok(Some(job));
        }
        tokio::select! {
            _ = cancel.cancelled() => return Ok(None),
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }
}

/// Fail every started job whose worker stopped heartbeating before `now - window`.
///
/// Jobs are never re-queued: handlers are not assumed to be idempotent.
pub async fn sweep_stale_jobs(
    broker: &dyn Broker,
    window: Duration,
    now: DateTime<Utc>,
) -> WorkerResult<Vec<JobId>> {
    let window = chrono::Duration::from_std(window)
        .map_err(|e| WorkerError::Configuration(format!("invalid staleness window: {}", e)))?;
    let cutoff = now - window;

    let mut swept = Vec::new();
    for id in broker.stale_jobs(cutoff).await? {
        let outcome = JobOutcome::failed(format!(
            "worker stopped responding; no heartbeat since before {}",
            cutoff.to_rfc3339()
        ));
        match broker.complete(id, outcome).await {
            Ok(job) => {
                tracing::warn!(job_id = %id, task = %job.task_name, "Marked stale job as failed");
                swept.push(id);
            }
            // Finished between listing and completing
            Err(WorkerError::InvalidTransition { .. }) | Err(WorkerError::JobNotFound(_)) => {}
            Err(e) => return Err(e),
        }
    }

    Ok(swept)
}
