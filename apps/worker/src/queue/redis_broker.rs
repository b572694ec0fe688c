//! Redis-backed broker shared by the worker and scheduler processes
//!
//! Key layout (all under a configurable prefix):
//!
//! - `{prefix}:queue:{priority}` list of job ids, oldest at the head
//! - `{prefix}:job:{id}` hash with the job record fields
//! - `{prefix}:job:{id}:meta` hash of JSON-encoded progress values
//! - `{prefix}:jobs:started` sorted set of started jobs scored by last heartbeat
//! - `{prefix}:task:{name}:active` id of the task's queued or started job
//! - `{prefix}:task:{name}:enabled` `1` or `0`, overriding the configured default
//! - `{prefix}:{lease}:lock` holder id of a named lease, with a PX expiry
//!
//! State changes that touch more than one key run as Lua scripts so that
//! concurrent workers never observe or produce a half-applied transition.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::Script;

use super::{Broker, EnqueueRequest, Enqueued, JobId, JobMeta, JobOutcome, JobRecord, JobStatus, Priority};
use crate::config::redact_url;
use crate::error::{WorkerError, WorkerResult};

/// Default key prefix
pub const DEFAULT_PREFIX: &str = "romvault";

const ENQUEUE_SCRIPT: &str = r#"
local job_key = KEYS[1]
local queue_key = KEYS[2]
local active_key = KEYS[3]

if ARGV[6] == '1' then
    local existing = redis.call('GET', active_key)
    if existing then
        return {0, existing}
    end
end

redis.call('HSET', job_key,
    'id', ARGV[1],
    'task_name', ARGV[2],
    'priority', ARGV[3],
    'payload', ARGV[4],
    'status', 'queued',
    'queued_at', ARGV[5])
redis.call('RPUSH', queue_key, ARGV[1])
redis.call('SET', active_key, ARGV[1], 'NX')
return {1, ARGV[1]}
"#;

const DEQUEUE_SCRIPT: &str = r#"
local prefix = ARGV[1]
for _, queue_key in ipairs(KEYS) do
    local id = redis.call('LPOP', queue_key)
    while id do
        local job_key = prefix .. ':job:' .. id
        if redis.call('HGET', job_key, 'status') == 'queued' then
            redis.call('HSET', job_key, 'status', 'started', 'started_at', ARGV[2])
            redis.call('ZADD', prefix .. ':jobs:started', ARGV[3], id)
            return id
        end
        id = redis.call('LPOP', queue_key)
    end
end
return false
"#;

const COMPLETE_SCRIPT: &str = r#"
local job_key = KEYS[1]
local meta_key = KEYS[2]
local started_key = KEYS[3]
local prefix = ARGV[1]
local id = ARGV[2]

local status = redis.call('HGET', job_key, 'status')
if not status then
    return 'missing'
end
if status ~= 'started' then
    return status
end

redis.call('HSET', job_key, 'status', ARGV[3], 'ended_at', ARGV[4])
redis.call('ZREM', started_key, id)

local task = redis.call('HGET', job_key, 'task_name')
local active_key = prefix .. ':task:' .. task .. ':active'
if redis.call('GET', active_key) == id then
    redis.call('DEL', active_key)
end

if ARGV[5] ~= '' then
    redis.call('HSET', meta_key, 'error', ARGV[5])
end

local ttl = tonumber(ARGV[6])
if ttl > 0 then
    redis.call('EXPIRE', job_key, ttl)
    redis.call('EXPIRE', meta_key, ttl)
end
return 'ok'
"#;

const UPDATE_META_SCRIPT: &str = r#"
local job_key = KEYS[1]
local meta_key = KEYS[2]
local started_key = KEYS[3]

local status = redis.call('HGET', job_key, 'status')
if not status then
    return 'missing'
end
if status ~= 'started' then
    return status
end

if #ARGV > 2 then
    redis.call('HSET', meta_key, unpack(ARGV, 3))
end
redis.call('ZADD', started_key, 'XX', ARGV[2], ARGV[1])
return 'ok'
"#;

const ACQUIRE_LEASE_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if current == ARGV[1] then
    redis.call('PEXPIRE', KEYS[1], ARGV[2])
    return 1
end
if not current then
    redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
    return 1
end
return 0
"#;

const RELEASE_LEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Options for [`RedisBroker`]
#[derive(Debug, Clone)]
pub struct RedisBrokerOptions {
    /// Prefix for every key the broker touches
    pub prefix: String,
    /// How long terminal job records are kept; `None` keeps them forever
    pub retention: Option<Duration>,
}

impl Default for RedisBrokerOptions {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            retention: None,
        }
    }
}

/// Broker storing queues and job records in Redis
#[derive(Clone)]
pub struct RedisBroker {
    conn: MultiplexedConnection,
    options: RedisBrokerOptions,
    enqueue_script: Script,
    dequeue_script: Script,
    complete_script: Script,
    update_meta_script: Script,
    acquire_lease_script: Script,
    release_lease_script: Script,
}

impl RedisBroker {
    /// Connect and verify the server answers PING.
    ///
    /// Fails with [`WorkerError::BrokerUnavailable`] rather than retrying,
    /// so processes refuse to start against an unreachable broker.
    pub async fn connect(url: &str, options: RedisBrokerOptions) -> WorkerResult<Self> {
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

        tracing::info!(url = %redact_url(url), prefix = %options.prefix, "Connected to Redis broker");
        Ok(Self::from_connection(conn, options))
    }

    /// Wrap an existing connection
    pub fn from_connection(conn: MultiplexedConnection, options: RedisBrokerOptions) -> Self {
        Self {
            conn,
            options,
            enqueue_script: Script::new(ENQUEUE_SCRIPT),
            dequeue_script: Script::new(DEQUEUE_SCRIPT),
            complete_script: Script::new(COMPLETE_SCRIPT),
            update_meta_script: Script::new(UPDATE_META_SCRIPT),
            acquire_lease_script: Script::new(ACQUIRE_LEASE_SCRIPT),
            release_lease_script: Script::new(RELEASE_LEASE_SCRIPT),
        }
    }

    /// Shared connection, for stores living next to the queues
    pub fn connection(&self) -> MultiplexedConnection {
        self.conn.clone()
    }

    pub fn prefix(&self) -> &str {
        &self.options.prefix
    }

    fn queue_key(&self, priority: Priority) -> String {
        format!("{}:queue:{}", self.options.prefix, priority)
    }

    fn job_key(&self, id: JobId) -> String {
        format!("{}:job:{}", self.options.prefix, id)
    }

    fn meta_key(&self, id: JobId) -> String {
        format!("{}:job:{}:meta", self.options.prefix, id)
    }

    fn started_key(&self) -> String {
        format!("{}:jobs:started", self.options.prefix)
    }

    fn active_key(&self, task_name: &str) -> String {
        format!("{}:task:{}:active", self.options.prefix, task_name)
    }

    fn enabled_key(&self, task_name: &str) -> String {
        format!("{}:task:{}:enabled", self.options.prefix, task_name)
    }

    fn lease_key(&self, name: &str) -> String {
        format!("{}:{}:lock", self.options.prefix, name)
    }

    /// Refresh a started job's heartbeat and merge `fields` into its
    /// metadata in one step, so a job completed concurrently is never touched.
    async fn touch_started(&self, id: JobId, fields: Vec<(String, String)>) -> WorkerResult<()> {
        let mut conn = self.conn.clone();

        let mut invocation = self.update_meta_script.prepare_invoke();
        invocation
            .key(self.job_key(id))
            .key(self.meta_key(id))
            .key(self.started_key())
            .arg(id.to_string())
            .arg(Utc::now().timestamp_millis());
        for (key, value) in fields {
            invocation.arg(key).arg(value);
        }

        let result: String = invocation.invoke_async(&mut conn).await?;
        match result.as_str() {
            "ok" => Ok(()),
            "missing" => Err(WorkerError::JobNotFound(id)),
            status => Err(WorkerError::Queue(format!(
                "job {} is {}, not started",
                id, status
            ))),
        }
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn ping(&self) -> WorkerResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        Ok(())
    }

    async fn enqueue(&self, request: EnqueueRequest) -> WorkerResult<Enqueued> {
        let mut conn = self.conn.clone();
        let record = JobRecord::queued(request.task_name, request.priority, request.payload);

        let (created, id): (i64, String) = self
            .enqueue_script
            .key(self.job_key(record.id))
            .key(self.queue_key(record.priority))
            .key(self.active_key(&record.task_name))
            .arg(record.id.to_string())
            .arg(&record.task_name)
            .arg(record.priority.as_str())
            .arg(serde_json::to_string(&record.payload)?)
            .arg(record.queued_at.to_rfc3339())
            .arg(if request.unique { "1" } else { "0" })
            .invoke_async(&mut conn)
            .await?;

        if created == 1 {
            tracing::debug!(job_id = %record.id, task = %record.task_name, priority = %record.priority, "Job enqueued");
            Ok(Enqueued::Queued(record))
        } else {
            Ok(Enqueued::AlreadyActive(parse_job_id(&id)?))
        }
    }

    async fn dequeue(&self, priorities: &[Priority]) -> WorkerResult<Option<JobRecord>> {
        if priorities.is_empty() {
            return Ok(None);
        }

        let mut conn = self.conn.clone();
        let now = Utc::now();

        let mut invocation = self.dequeue_script.prepare_invoke();
        for priority in priorities {
            invocation.key(self.queue_key(*priority));
        }
        invocation
            .arg(&self.options.prefix)
            .arg(now.to_rfc3339())
            .arg(now.timestamp_millis());

        let id: Option<String> = invocation.invoke_async(&mut conn).await?;
        match id {
            Some(id) => self.get(parse_job_id(&id)?).await,
            None => Ok(None),
        }
    }

    async fn update_meta(&self, id: JobId, partial: JobMeta) -> WorkerResult<()> {
        let mut fields = Vec::with_capacity(partial.len());
        for (key, value) in &partial {
            fields.push((key.clone(), serde_json::to_string(value)?));
        }
        self.touch_started(id, fields).await
    }

    async fn heartbeat(&self, id: JobId) -> WorkerResult<()> {
        self.touch_started(id, Vec::new()).await
    }

    async fn complete(&self, id: JobId, outcome: JobOutcome) -> WorkerResult<JobRecord> {
        let mut conn = self.conn.clone();
        let error = match &outcome {
            JobOutcome::Failed { error } => serde_json::to_string(error)?,
            JobOutcome::Finished => String::new(),
        };
        let ttl = self.options.retention.map_or(0, |r| r.as_secs().max(1));

        let result: String = self
            .complete_script
            .key(self.job_key(id))
            .key(self.meta_key(id))
            .key(self.started_key())
            .arg(&self.options.prefix)
            .arg(id.to_string())
            .arg(outcome.status().as_str())
            .arg(Utc::now().to_rfc3339())
            .arg(error)
            .arg(ttl)
            .invoke_async(&mut conn)
            .await?;

        match result.as_str() {
            "ok" => self.get_status(id).await,
            "missing" => Err(WorkerError::JobNotFound(id)),
            current => Err(WorkerError::InvalidTransition {
                id,
                from: current.parse()?,
                to: outcome.status(),
            }),
        }
    }

    async fn get(&self, id: JobId) -> WorkerResult<Option<JobRecord>> {
        let mut conn = self.conn.clone();
        let (fields, meta): (HashMap<String, String>, HashMap<String, String>) = redis::pipe()
            .hgetall(self.job_key(id))
            .hgetall(self.meta_key(id))
            .query_async(&mut conn)
            .await?;

        if fields.is_empty() {
            return Ok(None);
        }
        decode_record(id, fields, meta).map(Some)
    }

    async fn active_job(&self, task_name: &str) -> WorkerResult<Option<JobId>> {
        let mut conn = self.conn.clone();
        let id: Option<String> = redis::cmd("GET")
            .arg(self.active_key(task_name))
            .query_async(&mut conn)
            .await?;
        id.as_deref().map(parse_job_id).transpose()
    }

    async fn stale_jobs(&self, heartbeat_before: DateTime<Utc>) -> WorkerResult<Vec<JobId>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.started_key())
            .arg("-inf")
            .arg(format!("({}", heartbeat_before.timestamp_millis()))
            .query_async(&mut conn)
            .await?;
        ids.iter().map(|id| parse_job_id(id)).collect()
    }

    async fn queue_len(&self, priority: Priority) -> WorkerResult<usize> {
        let mut conn = self.conn.clone();
        let len: usize = redis::cmd("LLEN")
            .arg(self.queue_key(priority))
            .query_async(&mut conn)
            .await?;
        Ok(len)
    }

    async fn acquire_lease(&self, name: &str, holder: &str, ttl: Duration) -> WorkerResult<bool> {
        let mut conn = self.conn.clone();
        let acquired: i64 = self
            .acquire_lease_script
            .key(self.lease_key(name))
            .arg(holder)
            .arg(ttl.as_millis().max(1) as u64)
            .invoke_async(&mut conn)
            .await?;
        Ok(acquired == 1)
    }

    async fn release_lease(&self, name: &str, holder: &str) -> WorkerResult<()> {
        let mut conn = self.conn.clone();
        self.release_lease_script
            .key(self.lease_key(name))
            .arg(holder)
            .invoke_async::<_, i64>(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_task_enabled(&self, task_name: &str, enabled: bool) -> WorkerResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(self.enabled_key(task_name))
            .arg(if enabled { "1" } else { "0" })
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn task_enabled(&self, task_name: &str) -> WorkerResult<Option<bool>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.enabled_key(task_name))
            .query_async(&mut conn)
            .await?;
        match raw.as_deref() {
            None => Ok(None),
            Some("1") => Ok(Some(true)),
            Some("0") => Ok(Some(false)),
            Some(other) => Err(WorkerError::Queue(format!(
                "malformed enabled flag for {}: '{}'",
                task_name, other
            ))),
        }
    }
}

fn parse_job_id(raw: &str) -> WorkerResult<JobId> {
    raw.parse()
        .map_err(|e| WorkerError::Queue(format!("malformed job id '{}': {}", raw, e)))
}

fn parse_time(field: &str, raw: &str) -> WorkerResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| WorkerError::Queue(format!("malformed {} '{}': {}", field, raw, e)))
}

fn decode_record(
    id: JobId,
    mut fields: HashMap<String, String>,
    meta: HashMap<String, String>,
) -> WorkerResult<JobRecord> {
    let mut take = |name: &str| {
        fields
            .remove(name)
            .ok_or_else(|| WorkerError::Queue(format!("job {} is missing field '{}'", id, name)))
    };

    let task_name = take("task_name")?;
    let priority = take("priority")?.parse()?;
    let status: JobStatus = take("status")?.parse()?;
    let payload = serde_json::from_str(&take("payload")?)?;
    let queued_at = parse_time("queued_at", &take("queued_at")?)?;
    let started_at = take("started_at")
        .ok()
        .map(|raw| parse_time("started_at", &raw))
        .transpose()?;
    let ended_at = take("ended_at")
        .ok()
        .map(|raw| parse_time("ended_at", &raw))
        .transpose()?;

    let mut decoded = JobMeta::new();
    for (key, raw) in meta {
        decoded.insert(key, serde_json::from_str(&raw)?);
    }

    Ok(JobRecord {
        id,
        task_name,
        priority,
        payload,
        status,
        queued_at,
        started_at,
        ended_at,
        meta: decoded,
    })
}
