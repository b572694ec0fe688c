//! Task boundary
//!
//! [`TaskService`] is what front-end processes call: trigger tasks, read job
//! status, list tasks and follow job events. Nothing here runs task bodies.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::Stream;
use serde_json::Value;

use crate::error::{WorkerError, WorkerResult};
use crate::events::{EventChannel, JobEvent};
use crate::progress::BulkOutcome;
use crate::queue::{Broker, EnqueueRequest, Enqueued, JobId, JobMeta, JobRecord, JobStatusView};
use crate::registry::{TaskHeartbeat, TaskInfo, TaskRegistry};

/// Front-end facing task operations
#[derive(Clone)]
pub struct TaskService {
    registry: Arc<TaskRegistry>,
    broker: Arc<dyn Broker>,
    events: EventChannel,
}

impl TaskService {
    pub fn new(registry: Arc<TaskRegistry>, broker: Arc<dyn Broker>, events: EventChannel) -> Self {
        Self {
            registry,
            broker,
            events,
        }
    }

    /// Queue a manual run of `task_name` and return its job id.
    ///
    /// Disabled tasks can still be run by hand. When the task does not
    /// allow concurrent runs and one is already queued or running, the id of
    /// that job is returned instead of queueing another.
    pub async fn run_task(&self, task_name: &str, kwargs: Value) -> WorkerResult<JobId> {
        let task = self.registry.lookup(task_name)?;
        if !task.manual_run {
            return Err(WorkerError::ManualRunNotAllowed(task_name.to_string()));
        }

        let payload = match kwargs {
            Value::Null => Value::Object(JobMeta::new()),
            Value::Object(map) => Value::Object(map),
            other => {
                return Err(WorkerError::InvalidPayload(format!(
                    "task arguments must be an object, got {}",
                    other
                )))
            }
        };

        let request = EnqueueRequest::new(task.name(), task.priority)
            .with_payload(payload)
            .unique(!task.concurrent);

        match self.broker.enqueue(request).await? {
            Enqueued::Queued(job) => {
                tracing::info!(task = %task.kind, job_id = %job.id, priority = %job.priority, "Manual run queued");
                self.events.publish_job_event(&JobEvent::from(&job)).await;
                Ok(job.id)
            }
            Enqueued::AlreadyActive(id) => {
                tracing::info!(task = %task.kind, job_id = %id, "Task already active, returning existing job");
                Ok(id)
            }
        }
    }

    /// Queue a manual run of each named task, collecting per-task results
    pub async fn run_tasks<I, S>(&self, task_names: I) -> BulkOutcome
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut outcome = BulkOutcome::new();
        for name in task_names {
            let name = name.as_ref();
            match self.run_task(name, Value::Null).await {
                Ok(_) => outcome.record_success(),
                Err(e) => outcome.record_failure(name, e),
            }
        }
        outcome
    }

    /// Lifecycle timestamps of a job
    pub async fn job_status(&self, id: JobId) -> WorkerResult<JobStatusView> {
        let job = self.broker.get_status(id).await?;
        Ok(JobStatusView::from(&job))
    }

    /// Full job record including metadata
    pub async fn job(&self, id: JobId) -> WorkerResult<JobRecord> {
        self.broker.get_status(id).await
    }

    /// Registered tasks grouped by category
    pub async fn list_tasks(&self) -> WorkerResult<BTreeMap<String, Vec<TaskInfo>>> {
        let enabled = self.registry.resolve_enabled(self.broker.as_ref()).await?;
        Ok(self.registry.list_tasks(&enabled))
    }

    /// Enabled flag and schedule of every recurring task
    pub async fn heartbeat(&self) -> WorkerResult<BTreeMap<String, TaskHeartbeat>> {
        let enabled = self.registry.resolve_enabled(self.broker.as_ref()).await?;
        Ok(self.registry.heartbeat(&enabled))
    }

    /// Enable or disable a task for every process sharing the broker.
    ///
    /// Only future scheduled enqueues are affected; queued and running jobs
    /// are left alone.
    pub async fn set_enabled(&self, task_name: &str, enabled: bool) -> WorkerResult<()> {
        let task = self.registry.lookup(task_name)?;
        self.broker.set_task_enabled(task.name(), enabled).await?;
        tracing::info!(task = %task.kind, enabled, "Task toggled");
        Ok(())
    }

    /// Job events published from now on by any process
    pub fn subscribe(&self) -> Pin<Box<dyn Stream<Item = JobEvent> + Send>> {
        self.events.job_events()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{InMemoryBroker, JobStatus, Priority};
    use crate::registry::{JobContext, TaskDescriptor, TaskHandler, TaskKind};
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use futures_util::StreamExt;
    use serde_json::json;

    struct Noop;

    #[async_trait]
    impl TaskHandler for Noop {
        async fn run(&self, _ctx: &JobContext, _args: Value) -> WorkerResult<()> {
            Ok(())
        }
    }

    fn service() -> (Arc<InMemoryBroker>, TaskService) {
        let mut registry = TaskRegistry::new();
        registry.register(TaskDescriptor::scheduled(
            TaskKind::UpdateMameXml,
            "0 5 * * *",
            false,
            Arc::new(Noop),
        ));
        let mut scan = TaskDescriptor::scheduled(TaskKind::ScanLibrary, "0 3 * * *", true, Arc::new(Noop));
        scan.manual_run = false;
        registry.register(scan);

        let broker = Arc::new(InMemoryBroker::new());
        let service = TaskService::new(Arc::new(registry), broker.clone(), EventChannel::in_memory());
        (broker, service)
    }

    #[tokio::test]
    async fn test_run_task_queues_disabled_task() {
        let (broker, service) = service();
        let mut events = service.subscribe();

        let id = service.run_task("update_mame_xml", json!({"force": true})).await.unwrap();

        let job = service.job(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.priority, Priority::Low);
        assert_eq!(job.payload, json!({"force": true}));
        assert_eq!(broker.queue_len(Priority::Low).await.unwrap(), 1);

        let event = events.next().await.unwrap();
        assert_eq!(event.job_id, id);
        assert_eq!(event.status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn test_run_task_returns_active_job() {
        let (broker, service) = service();
        let first = service.run_task("update_mame_xml", Value::Null).await.unwrap();
        let second = service.run_task("update_mame_xml", Value::Null).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(broker.queue_len(Priority::Low).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_run_task_rejections() {
        let (broker, service) = service();

        assert_matches!(
            service.run_task("format_c", Value::Null).await,
            Err(WorkerError::UnknownTask(name)) if name == "format_c"
        );
        assert_matches!(
            service.run_task("scan_library", Value::Null).await,
            Err(WorkerError::ManualRunNotAllowed(_))
        );
        assert_matches!(
            service.run_task("update_mame_xml", json!([1, 2])).await,
            Err(WorkerError::InvalidPayload(_))
        );
        for priority in Priority::ALL {
            assert_eq!(broker.queue_len(priority).await.unwrap(), 0);
        }
    }

    #[tokio::test]
    async fn test_job_status_view() {
        let (_broker, service) = service();
        let id = service.run_task("update_mame_xml", Value::Null).await.unwrap();

        let view = service.job_status(id).await.unwrap();
        assert_eq!(view.job_id, id);
        assert_eq!(view.task_name, "update_mame_xml");
        assert!(view.started_at.is_none());

        assert_matches!(
            service.job_status(JobId::new()).await,
            Err(WorkerError::JobNotFound(_))
        );
    }

    #[tokio::test]
    async fn test_run_tasks_reports_each_name() {
        let (_broker, service) = service();
        let outcome = service
            .run_tasks(["update_mame_xml", "nope", "scan_library"])
            .await;

        assert_eq!(outcome.successful_items, 1);
        assert_eq!(outcome.failed_items, 2);
        assert_eq!(
            outcome.errors,
            vec![
                "nope: unknown task: nope".to_string(),
                "scan_library: task 'scan_library' cannot be run manually".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_set_enabled_shows_in_heartbeat() {
        let (broker, service) = service();
        assert!(!service.heartbeat().await.unwrap()["update_mame_xml"].enabled);

        service.set_enabled("update_mame_xml", true).await.unwrap();
        assert!(service.heartbeat().await.unwrap()["update_mame_xml"].enabled);
        assert_eq!(broker.task_enabled("update_mame_xml").await.unwrap(), Some(true));
        assert_matches!(
            service.set_enabled("ghost", true).await,
            Err(WorkerError::UnknownTask(_))
        );
    }

    #[tokio::test]
    async fn test_toggle_is_shared_between_services() {
        let (broker, first) = service();
        let mut registry = TaskRegistry::new();
        registry.register(TaskDescriptor::scheduled(
            TaskKind::UpdateMameXml,
            "0 5 * * *",
            false,
            Arc::new(Noop),
        ));
        // Separate registry, as in another process
        let second = TaskService::new(Arc::new(registry), broker, EventChannel::in_memory());

        first.set_enabled("update_mame_xml", true).await.unwrap();

        let listing = second.list_tasks().await.unwrap();
        assert!(listing["scheduled"][0].enabled);
    }
}
