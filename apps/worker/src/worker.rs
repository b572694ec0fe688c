//! Worker pool
//!
//! Runs `concurrency` slots per process. Each slot dequeues one job at a
//! time in strict priority order, runs its handler and records the outcome.
//! Handler errors, panics and timeouts fail the job; they never take the
//! process down.

use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{WorkerError, WorkerResult};
use crate::events::{EventChannel, JobEvent};
use crate::progress::ProgressReporter;
use crate::queue::{dequeue_blocking, Broker, JobOutcome, JobRecord, JobStatus, Priority};
use crate::registry::{JobContext, TaskRegistry};

/// Worker pool tuning
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub job_timeout: Option<Duration>,
    /// Queues served by this pool, highest priority first
    pub priorities: Vec<Priority>,
}

impl WorkerOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            concurrency: config.concurrency,
            poll_interval: config.poll_interval,
            heartbeat_interval: config.heartbeat_interval(),
            job_timeout: config.job_timeout,
            priorities: Priority::ALL.to_vec(),
        }
    }
}

/// Owns a started job until its outcome is recorded.
///
/// [`JobScope::finish`] records the outcome. A scope dropped without
/// finishing (its future was cancelled) fails the job in the background so
/// no record is left `started` by this worker.
struct JobScope {
    broker: Arc<dyn Broker>,
    events: EventChannel,
    job: Option<JobRecord>,
}

impl JobScope {
    fn new(broker: Arc<dyn Broker>, events: EventChannel, job: JobRecord) -> Self {
        Self {
            broker,
            events,
            job: Some(job),
        }
    }

    async fn finish(mut self, outcome: JobOutcome) -> WorkerResult<JobRecord> {
        let Some(job) = self.job.take() else {
            return Err(WorkerError::Internal("job scope already finished".to_string()));
        };
        finalize(self.broker.as_ref(), &self.events, job, outcome).await
    }
}

impl Drop for JobScope {
    fn drop(&mut self) {
        let Some(job) = self.job.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::error!(job_id = %job.id, "Job abandoned without a runtime to record it");
            return;
        };

        let broker = self.broker.clone();
        let events = self.events.clone();
        runtime.spawn(async move {
            let outcome = JobOutcome::failed("worker stopped while the job was running");
            if let Err(e) = finalize(broker.as_ref(), &events, job, outcome).await {
                e.log();
            }
        });
    }
}

/// Record a job's outcome and announce it
async fn finalize(
    broker: &dyn Broker,
    events: &EventChannel,
    job: JobRecord,
    outcome: JobOutcome,
) -> WorkerResult<JobRecord> {
    match broker.complete(job.id, outcome).await {
        Ok(done) => {
            match done.meta.get("error") {
                Some(error) if done.status == JobStatus::Failed => {
                    tracing::warn!(job_id = %done.id, task = %done.task_name, error = %error, "Job failed")
                }
                _ => tracing::info!(job_id = %done.id, task = %done.task_name, "Job finished"),
            }
            events.publish_job_event(&JobEvent::from(&done)).await;
            Ok(done)
        }
        // The stale-job sweep got there first
        Err(WorkerError::InvalidTransition { from, .. }) => {
            tracing::warn!(
                job_id = %job.id,
                task = %job.task_name,
                status = %from,
                "Job was already finalized elsewhere"
            );
            broker.get_status(job.id).await
        }
        Err(e) => Err(e),
    }
}

fn panic_message(err: tokio::task::JoinError) -> String {
    if err.is_cancelled() {
        return "handler task was cancelled".to_string();
    }
    let payload = err.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Pool of worker slots pulling from the shared broker
#[derive(Clone)]
pub struct WorkerPool {
    broker: Arc<dyn Broker>,
    registry: Arc<TaskRegistry>,
    events: EventChannel,
    options: WorkerOptions,
}

impl WorkerPool {
    pub fn new(
        broker: Arc<dyn Broker>,
        registry: Arc<TaskRegistry>,
        events: EventChannel,
        options: WorkerOptions,
    ) -> Self {
        Self {
            broker,
            registry,
            events,
            options,
        }
    }

    /// Run every slot until `cancel` fires.
    ///
    /// Idle slots stop at once; a slot running a job stops after the job
    /// has been recorded.
    pub async fn run(&self, cancel: CancellationToken) -> WorkerResult<()> {
        tracing::info!(
            concurrency = self.options.concurrency,
            queues = ?self.options.priorities,
            "Worker pool started"
        );

        let mut slots = JoinSet::new();
        for slot in 0..self.options.concurrency.max(1) {
            let pool = self.clone();
            let cancel = cancel.clone();
            slots.spawn(async move { pool.run_slot(slot, cancel).await });
        }

        while let Some(joined) = slots.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Worker slot crashed");
            }
        }

        tracing::info!("Worker pool stopped");
        Ok(())
    }

    async fn run_slot(&self, slot: usize, cancel: CancellationToken) {
        tracing::debug!(slot, "Worker slot started");
        loop {
            let next = dequeue_blocking(
                self.broker.as_ref(),
                &self.options.priorities,
                self.options.poll_interval,
                &cancel,
            )
            .await;

            match next {
                Ok(Some(job)) => {
                    if let Err(e) = self.process(job).await {
                        e.log();
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    e.log();
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.options.poll_interval) => {}
                    }
                }
            }
        }
        tracing::debug!(slot, "Worker slot stopped");
    }

    /// Dequeue and process a single job, if one is waiting
    pub async fn run_once(&self) -> WorkerResult<Option<JobRecord>> {
        match self.broker.dequeue(&self.options.priorities).await? {
            Some(job) => self.process(job).await.map(Some),
            None => Ok(None),
        }
    }

    /// Run a dequeued (started) job to completion and return its final record
    pub async fn process(&self, job: JobRecord) -> WorkerResult<JobRecord> {
        tracing::info!(job_id = %job.id, task = %job.task_name, priority = %job.priority, "Job started");
        self.events.publish_job_event(&JobEvent::from(&job)).await;
        let scope = JobScope::new(self.broker.clone(), self.events.clone(), job.clone());

        let handler = match self.registry.lookup(&job.task_name) {
            Ok(task) => task.handler(),
            Err(e) => return scope.finish(JobOutcome::failed(e.to_string())).await,
        };

        let ctx = JobContext {
            progress: ProgressReporter::new(
                self.broker.clone(),
                self.events.clone(),
                job.id,
                job.task_name.clone(),
                job.meta.clone(),
            ),
            job: job.clone(),
        };
        let args = job.payload.clone();
        let mut handle = tokio::spawn(async move { handler.run(&ctx, args).await });

        let mut heartbeat = tokio::time::interval(self.options.heartbeat_interval);
        heartbeat.tick().await;
        let timeout = self.options.job_timeout;
        let deadline = async move {
            match timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => pending::<()>().await,
            }
        };
        tokio::pin!(deadline);

        let outcome = loop {
            tokio::select! {
                joined = &mut handle => break match joined {
                    Ok(Ok(())) => JobOutcome::Finished,
                    Ok(Err(e)) => {
                        e.log();
                        JobOutcome::failed(e.to_string())
                    }
                    Err(e) => {
                        let err = WorkerError::HandlerPanicked(panic_message(e));
                        err.log();
                        JobOutcome::failed(err.to_string())
                    }
                },
                _ = heartbeat.tick() => {
                    if let Err(e) = self.broker.heartbeat(job.id).await {
                        tracing::warn!(job_id = %job.id, error = %e, "Failed to refresh job heartbeat");
                    }
                }
                _ = &mut deadline => {
                    handle.abort();
                    let err = WorkerError::Timeout {
                        seconds: timeout.map(|t| t.as_secs()).unwrap_or_default(),
                    };
                    err.log();
                    break JobOutcome::failed(err.to_string());
                }
            }
        };

        scope.finish(outcome).await
    }
}
