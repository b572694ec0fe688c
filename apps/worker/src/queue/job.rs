//! Job record model
//!
//! A [`JobRecord`] is the unit of schedulable work. It is created in the
//! `queued` state by the broker, moved to `started` exactly once by the
//! worker that dequeues it, and ends in `finished` or `failed`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{WorkerError, WorkerResult};

/// Progress metadata attached to a job
pub type JobMeta = serde_json::Map<String, serde_json::Value>;

/// Opaque job identifier assigned at enqueue time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Generate a fresh identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Access the underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Priority class; each class is backed by its own FIFO queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Default,
    Low,
}

impl Priority {
    /// All classes in dequeue order (highest first)
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Default, Priority::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Default => "default",
            Self::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = WorkerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high" => Ok(Self::High),
            "default" => Ok(Self::Default),
            "low" => Ok(Self::Low),
            other => Err(WorkerError::Queue(format!("unknown priority '{}'", other))),
        }
    }
}

/// Job lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Started,
    Finished,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Started => "started",
            Self::Finished => "finished",
            Self::Failed => "failed",
        }
    }

    /// Terminal states never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }

    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Started)
                | (Self::Started, Self::Finished)
                | (Self::Started, Self::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = WorkerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "started" => Ok(Self::Started),
            "finished" => Ok(Self::Finished),
            "failed" => Ok(Self::Failed),
            other => Err(WorkerError::Queue(format!("unknown job status '{}'", other))),
        }
    }
}

/// How a job ended, as reported by the worker or the stale-job sweep
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Finished,
    Failed { error: String },
}

impl JobOutcome {
    pub fn failed(error: impl Into<String>) -> Self {
        Self::Failed {
            error: error.into(),
        }
    }

    pub fn status(&self) -> JobStatus {
        match self {
            Self::Finished => JobStatus::Finished,
            Self::Failed { .. } => JobStatus::Failed,
        }
    }
}

/// Persisted unit of schedulable work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub task_name: String,
    pub priority: Priority,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub meta: JobMeta,
}

impl JobRecord {
    /// Create a freshly queued record
    pub fn queued(task_name: impl Into<String>, priority: Priority, payload: serde_json::Value) -> Self {
        Self {
            id: JobId::new(),
            task_name: task_name.into(),
            priority,
            payload,
            status: JobStatus::Queued,
            queued_at: Utc::now(),
            started_at: None,
            ended_at: None,
            meta: JobMeta::new(),
        }
    }

    /// Move to `started`, stamping `started_at`
    pub fn mark_started(&mut self, at: DateTime<Utc>) -> WorkerResult<()> {
        self.transition(JobStatus::Started)?;
        self.started_at = Some(at);
        Ok(())
    }

    /// Move to a terminal state, stamping `ended_at` and recording any error
    pub fn mark_ended(&mut self, outcome: &JobOutcome, at: DateTime<Utc>) -> WorkerResult<()> {
        self.transition(outcome.status())?;
        self.ended_at = Some(at);
        if let JobOutcome::Failed { error } = outcome {
            self.meta
                .insert("error".to_string(), serde_json::Value::String(error.clone()));
        }
        Ok(())
    }

    /// Merge keys into `meta`, replacing only the keys given
    pub fn merge_meta(&mut self, partial: JobMeta) {
        for (key, value) in partial {
            self.meta.insert(key, value);
        }
    }

    fn transition(&mut self, next: JobStatus) -> WorkerResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(WorkerError::InvalidTransition {
                id: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }
}

/// Read-only view of a job returned by the status boundary
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatusView {
    pub task_name: String,
    pub job_id: JobId,
    pub status: JobStatus,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl From<&JobRecord> for JobStatusView {
    fn from(job: &JobRecord) -> Self {
        Self {
            task_name: job.task_name.clone(),
            job_id: job.id,
            status: job.status,
            queued_at: job.queued_at,
            started_at: job.started_at,
            ended_at: job.ended_at,
        }
    }
}
