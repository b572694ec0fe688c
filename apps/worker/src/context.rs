//! Process-wide collaborators
//!
//! [`AppContext`] is built once by each binary and handed to the worker pool,
//! the scheduler and the task boundary.

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::config::{redact_url, Config};
use crate::error::WorkerResult;
use crate::events::EventChannel;
use crate::queue::{Broker, InMemoryBroker, RedisBroker, RedisBrokerOptions, DEFAULT_PREFIX};
use crate::registry::TaskRegistry;
use crate::scheduler::Scheduler;
use crate::service::TaskService;
use crate::store::{
    InMemoryRunStateStore, LibraryStore, PgLibraryStore, RedisRunStateStore, RunStateStore,
};
use crate::tasks::{builtin_registry, TaskDeps};
use crate::worker::{WorkerOptions, WorkerPool};

/// Shared state of a worker or scheduler process
pub struct AppContext {
    config: Config,
    broker: Arc<dyn Broker>,
    events: EventChannel,
    registry: Arc<TaskRegistry>,
    db: Option<PgPool>,
}

impl AppContext {
    /// Connect to Redis and PostgreSQL and register the built-in tasks.
    ///
    /// Redis must answer immediately; the database pool connects lazily.
    pub async fn connect(config: Config) -> WorkerResult<Self> {
        let redis_url = config.redis().connection_url();
        let broker = RedisBroker::connect(
            &redis_url,
            RedisBrokerOptions {
                prefix: DEFAULT_PREFIX.to_string(),
                retention: config.job_retention,
            },
        )
        .await?;
        let events = EventChannel::connect(&redis_url, DEFAULT_PREFIX).await?;
        let run_state: Arc<dyn RunStateStore> =
            Arc::new(RedisRunStateStore::new(broker.connection(), DEFAULT_PREFIX));

        let database = config.database();
        let db = PgPoolOptions::new()
            .max_connections(database.max_connections)
            .min_connections(database.min_connections)
            .acquire_timeout(Duration::from_secs(database.connect_timeout_secs))
            .idle_timeout(Duration::from_secs(database.idle_timeout_secs))
            .connect_lazy(&database.url)?;
        tracing::info!(url = %redact_url(&database.url), "Database pool configured");

        let library: Arc<dyn LibraryStore> = Arc::new(PgLibraryStore::new(db.clone()));
        let registry = Self::build_registry(&config, library, run_state)?;

        Ok(Self {
            config,
            broker: Arc::new(broker),
            events,
            registry,
            db: Some(db),
        })
    }

    /// Single-process context backed by in-memory queues and events
    pub fn in_memory(config: Config, library: Arc<dyn LibraryStore>) -> WorkerResult<Self> {
        let broker = match config.job_retention {
            Some(retention) => InMemoryBroker::with_retention(retention),
            None => InMemoryBroker::new(),
        };
        let registry = Self::build_registry(&config, library, Arc::new(InMemoryRunStateStore::new()))?;

        Ok(Self {
            config,
            broker: Arc::new(broker),
            events: EventChannel::in_memory(),
            registry,
            db: None,
        })
    }

    fn build_registry(
        config: &Config,
        library: Arc<dyn LibraryStore>,
        run_state: Arc<dyn RunStateStore>,
    ) -> WorkerResult<Arc<TaskRegistry>> {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .user_agent(concat!("romvault-worker/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let deps = TaskDeps {
            library,
            run_state,
            http,
            library_path: config.library_path().to_path_buf(),
            resources_path: config.resources_path().to_path_buf(),
            progress_batch: config.progress_batch,
        };
        Ok(Arc::new(builtin_registry(&deps, config.tasks())))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn broker(&self) -> Arc<dyn Broker> {
        self.broker.clone()
    }

    pub fn events(&self) -> EventChannel {
        self.events.clone()
    }

    pub fn registry(&self) -> Arc<TaskRegistry> {
        self.registry.clone()
    }

    /// Task boundary for front-end callers
    pub fn service(&self) -> TaskService {
        TaskService::new(self.registry(), self.broker(), self.events())
    }

    /// Worker pool configured from [`Config`]
    pub fn worker_pool(&self) -> WorkerPool {
        WorkerPool::new(
            self.broker(),
            self.registry(),
            self.events(),
            WorkerOptions::from_config(&self.config),
        )
    }

    /// Cron scheduler over the recurring tasks
    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(
            self.registry(),
            self.broker(),
            self.events(),
            self.config.stale_job_timeout,
        )
        .with_lease_ttl(self.config.scheduler_tick * 3)
    }

    /// Stop background listeners and close the database pool
    pub async fn shutdown(&self) {
        self.events.shutdown();
        if let Some(db) = &self.db {
            db.close().await;
        }
        tracing::info!("Context shut down");
    }
}
