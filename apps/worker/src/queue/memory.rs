//! In-process broker
//!
//! Used for single-process deployments and tests. All state sits behind one
//! mutex, so every operation is atomic with respect to concurrent workers.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{Broker, EnqueueRequest, Enqueued, JobId, JobMeta, JobOutcome, JobRecord, JobStatus, Priority};
use crate::error::{WorkerError, WorkerResult};

struct StoredJob {
    record: JobRecord,
    heartbeat_at: Option<DateTime<Utc>>,
    expires_at: Option<DateTime<Utc>>,
}

struct Lease {
    holder: String,
    expires_at: Instant,
}

#[derive(Default)]
struct Inner {
    queues: HashMap<Priority, VecDeque<JobId>>,
    jobs: HashMap<JobId, StoredJob>,
    /// task name -> queued or started job
    active: HashMap<String, JobId>,
    leases: HashMap<String, Lease>,
    enabled: HashMap<String, bool>,
}

impl Inner {
    fn prune_expired(&mut self, now: DateTime<Utc>) {
        self.jobs
            .retain(|_, job| job.expires_at.map_or(true, |expires_at| expires_at > now));
    }

    fn started_job(&mut self, id: JobId) -> WorkerResult<&mut StoredJob> {
        let job = self.jobs.get_mut(&id).ok_or(WorkerError::JobNotFound(id))?;
        if job.record.status != JobStatus::Started {
            return Err(WorkerError::Queue(format!(
                "job {} is {}, not started",
                id, job.record.status
            )));
        }
        Ok(job)
    }
}

/// Broker keeping queues and job records in memory
pub struct InMemoryBroker {
    inner: Mutex<Inner>,
    retention: Option<Duration>,
}

impl InMemoryBroker {
    /// Create a broker that keeps finished jobs forever
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            retention: None,
        }
    }

    /// Create a broker that forgets terminal jobs after `retention`
    pub fn with_retention(retention: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            retention: Some(retention),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Recover from poisoning so one panicking caller does not wedge the queue
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn ping(&self) -> WorkerResult<()> {
        Ok(())
    }

    async fn enqueue(&self, request: EnqueueRequest) -> WorkerResult<Enqueued> {
        let mut inner = self.lock();

        if request.unique {
            if let Some(existing) = inner.active.get(&request.task_name) {
                return Ok(Enqueued::AlreadyActive(*existing));
            }
        }

        let record = JobRecord::queued(request.task_name, request.priority, request.payload);
        let id = record.id;
        inner.active.entry(record.task_name.clone()).or_insert(id);
        inner.queues.entry(record.priority).or_default().push_back(id);
        inner.jobs.insert(
            id,
            StoredJob {
                record: record.clone(),
                heartbeat_at: None,
                expires_at: None,
            },
        );

        Ok(Enqueued::Queued(record))
    }

    async fn dequeue(&self, priorities: &[Priority]) -> WorkerResult<Option<JobRecord>> {
        let mut inner = self.lock();
        let now = Utc::now();

        for priority in priorities {
            let Some(id) = inner.queues.get_mut(priority).and_then(|q| q.pop_front()) else {
                continue;
            };
            let Some(job) = inner.jobs.get_mut(&id) else {
                continue;
            };
            job.record.mark_started(now)?;
            job.heartbeat_at = Some(now);
            return Ok(Some(job.record.clone()));
        }

        Ok(None)
    }

    async fn update_meta(&self, id: JobId, partial: JobMeta) -> WorkerResult<()> {
        let mut inner = self.lock();
        let job = inner.started_job(id)?;
        job.record.merge_meta(partial);
        job.heartbeat_at = Some(Utc::now());
        Ok(())
    }

    async fn heartbeat(&self, id: JobId) -> WorkerResult<()> {
        let mut inner = self.lock();
        inner.started_job(id)?.heartbeat_at = Some(Utc::now());
        Ok(())
    }

    async fn complete(&self, id: JobId, outcome: JobOutcome) -> WorkerResult<JobRecord> {
        let mut inner = self.lock();
        let now = Utc::now();
        inner.prune_expired(now);

        let job = inner.jobs.get_mut(&id).ok_or(WorkerError::JobNotFound(id))?;
        job.record.mark_ended(&outcome, now)?;
        job.expires_at = self
            .retention
            .and_then(|r| chrono::Duration::from_std(r).ok())
            .map(|r| now + r);
        let record = job.record.clone();

        if inner.active.get(&record.task_name) == Some(&id) {
            inner.active.remove(&record.task_name);
        }

        Ok(record)
    }

    async fn get(&self, id: JobId) -> WorkerResult<Option<JobRecord>> {
        let mut inner = self.lock();
        inner.prune_expired(Utc::now());
        Ok(inner.jobs.get(&id).map(|job| job.record.clone()))
    }

    async fn active_job(&self, task_name: &str) -> WorkerResult<Option<JobId>> {
        Ok(self.lock().active.get(task_name).copied())
    }

    async fn stale_jobs(&self, heartbeat_before: DateTime<Utc>) -> WorkerResult<Vec<JobId>> {
        let inner = self.lock();
        let mut stale: Vec<(DateTime<Utc>, JobId)> = inner
            .jobs
            .iter()
            .filter(|(_, job)| job.record.status == JobStatus::Started)
            .filter_map(|(id, job)| job.heartbeat_at.map(|at| (at, *id)))
            .filter(|(at, _)| *at < heartbeat_before)
            .collect();
        stale.sort();
        Ok(stale.into_iter().map(|(_, id)| id).collect())
    }

    async fn queue_len(&self, priority: Priority) -> WorkerResult<usize> {
        Ok(self.lock().queues.get(&priority).map_or(0, VecDeque::len))
    }

    async fn acquire_lease(&self, name: &str, holder: &str, ttl: Duration) -> WorkerResult<bool> {
        let mut inner = self.lock();
        let now = Instant::now();

        let held_elsewhere = inner
            .leases
            .get(name)
            .is_some_and(|lease| lease.holder != holder && lease.expires_at > now);
        if held_elsewhere {
            return Ok(false);
        }

        inner.leases.insert(
            name.to_string(),
            Lease {
                holder: holder.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn release_lease(&self, name: &str, holder: &str) -> WorkerResult<()> {
        let mut inner = self.lock();
        if inner.leases.get(name).is_some_and(|lease| lease.holder == holder) {
            inner.leases.remove(name);
        }
        Ok(())
    }

    async fn set_task_enabled(&self, task_name: &str, enabled: bool) -> WorkerResult<()> {
        self.lock().enabled.insert(task_name.to_string(), enabled);
        Ok(())
    }

    async fn task_enabled(&self, task_name: &str) -> WorkerResult<Option<bool>> {
        Ok(self.lock().enabled.get(task_name).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::sweep_stale_jobs;
    use serde_json::json;

    fn request(task: &str, priority: Priority) -> EnqueueRequest {
        EnqueueRequest::new(task, priority)
    }

    #[tokio::test]
    async fn test_high_priority_dequeued_first() {
        let broker = InMemoryBroker::new();
        let low = broker.enqueue(request("low_task", Priority::Low)).await.unwrap();
        let high = broker.enqueue(request("high_task", Priority::High)).await.unwrap();

        let first = broker.dequeue(&Priority::ALL).await.unwrap().unwrap();
        assert_eq!(first.id, high.job_id());
        let second = broker.dequeue(&Priority::ALL).await.unwrap().unwrap();
        assert_eq!(second.id, low.job_id());
        assert!(broker.dequeue(&Priority::ALL).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fifo_within_priority() {
        let broker = InMemoryBroker::new();
        let a = broker.enqueue(request("a", Priority::Default)).await.unwrap();
        let b = broker.enqueue(request("b", Priority::Default)).await.unwrap();

        assert_eq!(broker.queue_len(Priority::Default).await.unwrap(), 2);
        assert_eq!(broker.dequeue(&Priority::ALL).await.unwrap().unwrap().id, a.job_id());
        assert_eq!(broker.dequeue(&Priority::ALL).await.unwrap().unwrap().id, b.job_id());
    }

    #[tokio::test]
    async fn test_dequeue_respects_priority_subset() {
        let broker = InMemoryBroker::new();
        broker.enqueue(request("high", Priority::High)).await.unwrap();
        let low = broker.enqueue(request("low", Priority::Low)).await.unwrap();

        let job = broker.dequeue(&[Priority::Low]).await.unwrap().unwrap();
        assert_eq!(job.id, low.job_id());
    }

    #[tokio::test]
    async fn test_unique_enqueue_returns_active_job() {
        let broker = InMemoryBroker::new();
        let first = broker
            .enqueue(request("scan_library", Priority::Low).unique(true))
            .await
            .unwrap();
        assert!(first.is_new());

        let second = broker
            .enqueue(request("scan_library", Priority::Low).unique(true))
            .await
            .unwrap();
        assert_eq!(second, Enqueued::AlreadyActive(first.job_id()));

        broker.dequeue(&Priority::ALL).await.unwrap();
        broker.complete(first.job_id(), JobOutcome::Finished).await.unwrap();

        let third = broker
            .enqueue(request("scan_library", Priority::Low).unique(true))
            .await
            .unwrap();
        assert!(third.is_new());
    }

    #[tokio::test]
    async fn test_concurrent_dequeue_hands_each_job_out_once() {
        let broker = std::sync::Arc::new(InMemoryBroker::new());
        for i in 0..50 {
            broker
                .enqueue(request(&format!("task_{}", i), Priority::Default))
                .await
                .unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let broker = broker.clone();
            handles.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Some(job) = broker.dequeue(&Priority::ALL).await.unwrap() {
                    seen.push(job.id);
                }
                seen
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        let unique: std::collections::HashSet<_> = all.iter().collect();
        assert_eq!(all.len(), 50);
        assert_eq!(unique.len(), 50);
    }

    #[tokio::test]
    async fn test_meta_merges_and_requires_started() {
        let broker = InMemoryBroker::new();
        let id = broker.enqueue(request("scan", Priority::Default)).await.unwrap().job_id();

        let mut early = JobMeta::new();
        early.insert("processed".into(), json!(1));
        assert!(broker.update_meta(id, early).await.is_err());

        broker.dequeue(&Priority::ALL).await.unwrap();
        let mut first = JobMeta::new();
        first.insert("total".into(), json!(3));
        broker.update_meta(id, first).await.unwrap();
        let mut second = JobMeta::new();
        second.insert("processed".into(), json!(2));
        broker.update_meta(id, second).await.unwrap();

        let job = broker.get_status(id).await.unwrap();
        assert_eq!(job.meta["total"], 3);
        assert_eq!(job.meta["processed"], 2);
    }

    #[tokio::test]
    async fn test_terminal_state_is_final() {
        let broker = InMemoryBroker::new();
        let id = broker.enqueue(request("scan", Priority::Default)).await.unwrap().job_id();
        broker.dequeue(&Priority::ALL).await.unwrap();
        broker.complete(id, JobOutcome::Finished).await.unwrap();

        let err = broker.complete(id, JobOutcome::failed("late")).await.unwrap_err();
        assert!(matches!(err, WorkerError::InvalidTransition { .. }));
        assert_eq!(broker.get_status(id).await.unwrap().status, JobStatus::Finished);
    }

    #[tokio::test]
    async fn test_stale_job_is_swept_once() {
        let broker = InMemoryBroker::new();
        let id = broker
            .enqueue(request("scan_library", Priority::Low).unique(true))
            .await
            .unwrap()
            .job_id();
        broker.dequeue(&Priority::ALL).await.unwrap();

        let window = Duration::from_secs(60);
        assert!(sweep_stale_jobs(&broker, window, Utc::now()).await.unwrap().is_empty());

        let later = Utc::now() + chrono::Duration::seconds(120);
        assert_eq!(sweep_stale_jobs(&broker, window, later).await.unwrap(), vec![id]);
        assert!(sweep_stale_jobs(&broker, window, later).await.unwrap().is_empty());

        let job = broker.get_status(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.ended_at.is_some());
        assert!(broker.active_job("scan_library").await.unwrap().is_none());
        assert_eq!(broker.queue_len(Priority::Low).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_retention_expires_terminal_jobs() {
        let broker = InMemoryBroker::with_retention(Duration::from_millis(0));
        let id = broker.enqueue(request("scan", Priority::Default)).await.unwrap().job_id();
        broker.dequeue(&Priority::ALL).await.unwrap();
        broker.complete(id, JobOutcome::Finished).await.unwrap();

        assert!(broker.get(id).await.unwrap().is_none());
        assert!(matches!(
            broker.get_status(id).await.unwrap_err(),
            WorkerError::JobNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_lease_has_one_holder_until_released() {
        let broker = InMemoryBroker::new();
        let ttl = Duration::from_secs(30);

        assert!(broker.acquire_lease("scheduler", "a", ttl).await.unwrap());
        assert!(!broker.acquire_lease("scheduler", "b", ttl).await.unwrap());
        // Renewal by the holder
        assert!(broker.acquire_lease("scheduler", "a", ttl).await.unwrap());

        // Only the holder can release
        broker.release_lease("scheduler", "b").await.unwrap();
        assert!(!broker.acquire_lease("scheduler", "b", ttl).await.unwrap());

        broker.release_lease("scheduler", "a").await.unwrap();
        assert!(broker.acquire_lease("scheduler", "b", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken_over() {
        let broker = InMemoryBroker::new();
        assert!(broker
            .acquire_lease("scheduler", "a", Duration::from_millis(0))
            .await
            .unwrap());
        assert!(broker
            .acquire_lease("scheduler", "b", Duration::from_secs(30))
            .await
            .unwrap());
        assert!(!broker
            .acquire_lease("scheduler", "a", Duration::from_secs(30))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_enabled_override_round_trip() {
        let broker = InMemoryBroker::new();
        assert_eq!(broker.task_enabled("scan_library").await.unwrap(), None);

        broker.set_task_enabled("scan_library", false).await.unwrap();
        assert_eq!(broker.task_enabled("scan_library").await.unwrap(), Some(false));
        assert_eq!(broker.task_enabled("update_mame_xml").await.unwrap(), None);
    }
}
