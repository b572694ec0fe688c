//! Event fan-out across processes
//!
//! Workers publish job progress here; front-end processes subscribe and relay
//! events to their connected clients. Delivery is at-most-once and
//! best-effort: there is no replay, and a subscriber that falls behind the
//! local buffer silently loses the oldest events.

use std::pin::Pin;
use std::sync::Arc;

use futures_util::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::config::redact_url;
use crate::error::{WorkerError, WorkerResult};
use crate::queue::{JobId, JobMeta, JobRecord, JobStatus};

/// Channel capacity for broadcast channels
const BROADCAST_CAPACITY: usize = 256;

/// Topic carrying [`JobEvent`]s
pub const TASK_EVENTS_TOPIC: &str = "tasks";

/// Stream of raw messages for one topic
pub type EventStream = Pin<Box<dyn Stream<Item = String> + Send>>;

/// Progress or status change of a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: JobId,
    pub task_name: String,
    pub status: JobStatus,
    #[serde(default)]
    pub meta: JobMeta,
}

impl From<&JobRecord> for JobEvent {
    fn from(job: &JobRecord) -> Self {
        Self {
            job_id: job.id,
            task_name: job.task_name.clone(),
            status: job.status,
            meta: job.meta.clone(),
        }
    }
}

/// Topic pub/sub with a Redis relay or an in-process fallback
#[derive(Clone)]
pub struct EventChannel {
    inner: Arc<EventChannelInner>,
}

enum EventChannelInner {
    /// Redis-backed relay for multi-process deployments
    Redis(RedisRelay),
    /// In-memory channel for single-process mode and tests
    InMemory(InMemoryRelay),
}

impl EventChannel {
    /// Connect to Redis and start relaying events under `prefix`.
    ///
    /// Fails when Redis is unreachable instead of degrading to in-memory
    /// delivery, which would silently cut workers off from front-ends.
    pub async fn connect(url: &str, prefix: &str) -> WorkerResult<Self> {
        let relay = RedisRelay::connect(url, prefix).await?;
        tracing::info!(url = %redact_url(url), "Redis event relay connected");
        Ok(Self {
            inner: Arc::new(EventChannelInner::Redis(relay)),
        })
    }

    /// Create an in-memory channel (single process only)
    pub fn in_memory() -> Self {
        Self {
            inner: Arc::new(EventChannelInner::InMemory(InMemoryRelay::new())),
        }
    }

    /// Publish a message to every current subscriber of `topic`
    pub async fn publish(&self, topic: &str, message: String) {
        match &*self.inner {
            EventChannelInner::Redis(redis) => redis.publish(topic, message).await,
            EventChannelInner::InMemory(memory) => memory.publish(topic, message),
        }
    }

    /// Subscribe to messages published to `topic` from now on
    pub fn subscribe(&self, topic: &str) -> EventStream {
        match &*self.inner {
            EventChannelInner::Redis(redis) => redis.subscribe(topic),
            EventChannelInner::InMemory(memory) => memory.subscribe(topic),
        }
    }

    /// Publish a job event on [`TASK_EVENTS_TOPIC`]
    pub async fn publish_job_event(&self, event: &JobEvent) {
        match serde_json::to_string(event) {
            Ok(payload) => self.publish(TASK_EVENTS_TOPIC, payload).await,
            Err(e) => tracing::error!(error = %e, job_id = %event.job_id, "Failed to serialize job event"),
        }
    }

    /// Stream of job events; malformed messages are skipped
    pub fn job_events(&self) -> Pin<Box<dyn Stream<Item = JobEvent> + Send>> {
        Box::pin(self.subscribe(TASK_EVENTS_TOPIC).filter_map(|payload| {
            match serde_json::from_str::<JobEvent>(&payload) {
                Ok(event) => Some(event),
                Err(e) => {
                    tracing::warn!(error = %e, "Dropping malformed job event");
                    None
                }
            }
        }))
    }

    /// Check if events cross process boundaries
    pub fn is_redis_backed(&self) -> bool {
        matches!(&*self.inner, EventChannelInner::Redis(_))
    }

    /// Stop the background relay listener, if any
    pub fn shutdown(&self) {
        if let EventChannelInner::Redis(redis) = &*self.inner {
            redis.shutdown.cancel();
        }
    }
}

/// Drop lag notifications; the contract is at-most-once
fn lossy<T: Clone + Send + 'static>(rx: broadcast::Receiver<T>) -> impl Stream<Item = T> + Send {
    BroadcastStream::new(rx).filter_map(|item| match item {
        Ok(item) => Some(item),
        Err(e) => {
            tracing::warn!(error = %e, "Event subscriber lagged, events dropped");
            None
        }
    })
}

/// Redis-backed relay
struct RedisRelay {
    conn: redis::aio::MultiplexedConnection,
    prefix: String,
    /// Local broadcast for redistribution to local subscribers
    local_sender: broadcast::Sender<(String, String)>,
    shutdown: CancellationToken,
}

impl RedisRelay {
    async fn connect(url: &str, prefix: &str) -> WorkerResult<Self> {
        let unavailable = |e: redis::RedisError| WorkerError::BrokerUnavailable {
            url: redact_url(url),
            reason: e.to_string(),
        };

        let client = redis::Client::open(url).map_err(unavailable)?;
        let mut conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(unavailable)?;
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(unavailable)?;

        let (local_sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        let relay = Self {
            conn,
            prefix: prefix.to_string(),
            local_sender,
            shutdown: CancellationToken::new(),
        };

        // Start background task to listen for Redis pub/sub messages
        relay.start_listener(client);

        Ok(relay)
    }

    fn channel(&self, topic: &str) -> String {
        format!("{}:events:{}", self.prefix, topic)
    }

    fn start_listener(&self, client: redis::Client) {
        let sender = self.local_sender.clone();
        let pattern = format!("{}:events:*", self.prefix);
        let strip = format!("{}:events:", self.prefix);
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            const MAX_RECONNECT_DELAY_SECS: u64 = 60;

            let mut delay_secs = 1u64;

            loop {
                let result = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    result = Self::run_listener(&client, &pattern, &strip, &sender) => result,
                };

                match result {
                    Ok(()) => {
                        tracing::warn!("Redis event listener disconnected, reconnecting...");
                        delay_secs = 1;
                    }
                    Err(e) => {
                        tracing::error!(
                            error = %e,
                            delay_secs = delay_secs,
                            "Redis event listener error, reconnecting..."
                        );
                    }
                }

                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(tokio::time::Duration::from_secs(delay_secs)) => {}
                }
                delay_secs = (delay_secs * 2).min(MAX_RECONNECT_DELAY_SECS);
            }

            tracing::debug!("Redis event listener stopped");
        });
    }

    async fn run_listener(
        client: &redis::Client,
        pattern: &str,
        strip: &str,
        sender: &broadcast::Sender<(String, String)>,
    ) -> Result<(), redis::RedisError> {
        let conn = client.get_async_connection().await?;
        let mut pubsub = conn.into_pubsub();
        pubsub.psubscribe(pattern).await?;

        let mut stream = pubsub.on_message();

        while let Some(msg) = stream.next().await {
            let channel = msg.get_channel_name().to_string();
            let Some(topic) = channel.strip_prefix(strip) else {
                continue;
            };
            match msg.get_payload::<String>() {
                Ok(payload) => {
                    // No local subscribers is fine
                    let _ = sender.send((topic.to_string(), payload));
                }
                Err(e) => tracing::warn!(error = %e, channel = %channel, "Dropping non-text event payload"),
            }
        }

        Ok(())
    }

    async fn publish(&self, topic: &str, message: String) {
        let mut conn = self.conn.clone();
        let result: Result<i64, _> = redis::cmd("PUBLISH")
            .arg(self.channel(topic))
            .arg(&message)
            .query_async(&mut conn)
            .await;

        if let Err(e) = result {
            tracing::error!(error = %e, topic = %topic, "Failed to publish to Redis");
            // Fall back to local delivery
            let _ = self.local_sender.send((topic.to_string(), message));
        }
    }

    fn subscribe(&self, topic: &str) -> EventStream {
        let topic = topic.to_string();
        Box::pin(
            lossy(self.local_sender.subscribe())
                .filter_map(move |(event_topic, message)| (event_topic == topic).then_some(message)),
        )
    }
}

/// In-memory relay for single-process mode
struct InMemoryRelay {
    /// Per-topic broadcast channels
    channels: dashmap::DashMap<String, broadcast::Sender<String>>,
}

impl InMemoryRelay {
    fn new() -> Self {
        Self {
            channels: dashmap::DashMap::new(),
        }
    }

    fn publish(&self, topic: &str, message: String) {
        if let Some(sender) = self.channels.get(topic) {
            // Ignore send errors (no receivers)
            let _ = sender.send(message);
        }
    }

    fn subscribe(&self, topic: &str) -> EventStream {
        let receiver = self
            .channels
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(BROADCAST_CAPACITY).0)
            .subscribe();
        Box::pin(lossy(receiver))
    }
}
