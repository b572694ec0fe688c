//! Job progress reporting
//!
//! A running handler publishes progress through [`ProgressReporter`]. Each
//! report is merged into the job's persisted metadata, refreshes the job's
//! heartbeat and is broadcast as a [`JobEvent`].

use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::Value;

use crate::error::WorkerResult;
use crate::events::{EventChannel, JobEvent};
use crate::queue::{Broker, JobId, JobMeta, JobStatus};

/// Progress handle for one started job
#[derive(Clone)]
pub struct ProgressReporter {
    broker: Arc<dyn Broker>,
    events: EventChannel,
    job_id: JobId,
    task_name: String,
    /// Local copy of the persisted metadata; the handler is its only writer
    meta: Arc<Mutex<JobMeta>>,
}

impl ProgressReporter {
    pub fn new(
        broker: Arc<dyn Broker>,
        events: EventChannel,
        job_id: JobId,
        task_name: impl Into<String>,
        meta: JobMeta,
    ) -> Self {
        Self {
            broker,
            events,
            job_id,
            task_name: task_name.into(),
            meta: Arc::new(Mutex::new(meta)),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Merge `partial` into the job's metadata and broadcast the result
    pub async fn report(&self, partial: JobMeta) -> WorkerResult<()> {
        self.broker.update_meta(self.job_id, partial.clone()).await?;

        let meta = {
            let mut meta = self.meta.lock().unwrap_or_else(|e| e.into_inner());
            for (key, value) in partial {
                meta.insert(key, value);
            }
            meta.clone()
        };

        self.events
            .publish_job_event(&JobEvent {
                job_id: self.job_id,
                task_name: self.task_name.clone(),
                status: JobStatus::Started,
                meta,
            })
            .await;
        Ok(())
    }

    /// Report a single key
    pub async fn set(&self, key: &str, value: impl Into<Value>) -> WorkerResult<()> {
        let mut partial = JobMeta::new();
        partial.insert(key.to_string(), value.into());
        self.report(partial).await
    }

    /// Snapshot of everything reported so far
    pub fn snapshot(&self) -> JobMeta {
        self.meta.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Reports `processed`/`total` every `every` items and once more for the last item
pub struct BatchedProgress<'a> {
    reporter: &'a ProgressReporter,
    every: usize,
    total: Option<usize>,
    processed: usize,
    reported: usize,
}

impl<'a> BatchedProgress<'a> {
    pub fn new(reporter: &'a ProgressReporter, every: usize) -> Self {
        Self {
            reporter,
            every: every.max(1),
            total: None,
            processed: 0,
            reported: 0,
        }
    }

    /// Set the expected item count so the final item triggers a report
    pub fn with_total(mut self, total: usize) -> Self {
        self.total = Some(total);
        self
    }

    pub fn processed(&self) -> usize {
        self.processed
    }

    /// Count one finished item, reporting when a batch boundary is reached
    pub async fn advance(&mut self) -> WorkerResult<()> {
        self.processed += 1;
        if self.processed % self.every == 0 || Some(self.processed) == self.total {
            self.flush().await?;
        }
        Ok(())
    }

    /// Report any items counted since the last report
    pub async fn finish(&mut self) -> WorkerResult<()> {
        if self.reported != self.processed || self.processed == 0 {
            self.flush().await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> WorkerResult<()> {
        let mut partial = JobMeta::new();
        partial.insert("processed".to_string(), Value::from(self.processed));
        if let Some(total) = self.total {
            partial.insert("total".to_string(), Value::from(total));
        }
        self.reporter.report(partial).await?;
        self.reported = self.processed;
        Ok(())
    }
}

/// Per-item results of a bulk operation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BulkOutcome {
    pub successful_items: usize,
    pub failed_items: usize,
    pub errors: Vec<String>,
}

impl BulkOutcome {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&mut self) {
        self.successful_items += 1;
    }

    pub fn record_failure(&mut self, item: impl std::fmt::Display, error: impl std::fmt::Display) {
        self.failed_items += 1;
        self.errors.push(format!("{}: {}", item, error));
    }

    pub fn total(&self) -> usize {
        self.successful_items + self.failed_items
    }

    /// Fields to merge into job metadata
    pub fn to_meta(&self) -> JobMeta {
        let mut meta = JobMeta::new();
        meta.insert("successful_items".to_string(), Value::from(self.successful_items));
        meta.insert("failed_items".to_string(), Value::from(self.failed_items));
        meta.insert(
            "errors".to_string(),
            Value::from(self.errors.iter().map(|e| Value::from(e.as_str())).collect::<Vec<_>>()),
        );
        meta
    }
}
