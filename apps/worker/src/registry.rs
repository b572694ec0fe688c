//! Task registry
//!
//! Maps each [`TaskKind`] to its handler and the metadata the scheduler and
//! the task boundary need: title, description, cron string, priority and the
//! configured enabled flag. Runtime toggles live in the broker so every
//! process sees them; see [`TaskDescriptor::is_enabled`].

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{WorkerError, WorkerResult};
use crate::progress::ProgressReporter;
use crate::queue::{Broker, JobRecord, Priority};
use crate::scheduler::CronSchedule;

/// Every task the worker knows how to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    ScanLibrary,
    UpdateSwitchTitledb,
    UpdateMameXml,
    CleanupOrphanedResources,
}

impl TaskKind {
    pub const ALL: [TaskKind; 4] = [
        TaskKind::ScanLibrary,
        TaskKind::UpdateSwitchTitledb,
        TaskKind::UpdateMameXml,
        TaskKind::CleanupOrphanedResources,
    ];

    /// Stable task name used in job records and at the boundary
    pub fn name(&self) -> &'static str {
        match self {
            Self::ScanLibrary => "scan_library",
            Self::UpdateSwitchTitledb => "update_switch_titledb",
            Self::UpdateMameXml => "update_mame_xml",
            Self::CleanupOrphanedResources => "cleanup_orphaned_resources",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TaskKind {
    type Err = WorkerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| WorkerError::UnknownTask(s.to_string()))
    }
}

/// Grouping shown by the task listing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskCategory {
    /// Runs on a cron schedule and on demand
    Scheduled,
    /// Runs only on demand
    Manual,
}

impl TaskCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Manual => "manual",
        }
    }
}

/// What a handler gets while running a job
pub struct JobContext {
    pub job: JobRecord,
    pub progress: ProgressReporter,
}

/// Executable body of a task
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Run the task. `args` is `{}` for scheduled runs and may carry extra
    /// keys for manual runs; handlers ignore keys they do not understand.
    async fn run(&self, ctx: &JobContext, args: Value) -> WorkerResult<()>;
}

/// Registry entry for one task
pub struct TaskDescriptor {
    pub kind: TaskKind,
    pub title: String,
    pub description: String,
    pub category: TaskCategory,
    /// Absent for manual-only tasks
    pub cron_string: Option<String>,
    pub manual_run: bool,
    pub priority: Priority,
    /// Allow more than one active job at a time
    pub concurrent: bool,
    /// Configured default, used until someone toggles the task
    enabled_by_default: bool,
    handler: Arc<dyn TaskHandler>,
}

impl TaskDescriptor {
    /// Manual-only task at default priority
    pub fn manual(kind: TaskKind, handler: Arc<dyn TaskHandler>) -> Self {
        Self {
            kind,
            title: kind.name().to_string(),
            description: String::new(),
            category: TaskCategory::Manual,
            cron_string: None,
            manual_run: true,
            priority: Priority::Default,
            concurrent: false,
            enabled_by_default: true,
            handler,
        }
    }

    /// Recurring task at low priority
    pub fn scheduled(
        kind: TaskKind,
        cron: impl Into<String>,
        enabled: bool,
        handler: Arc<dyn TaskHandler>,
    ) -> Self {
        Self {
            category: TaskCategory::Scheduled,
            cron_string: Some(cron.into()),
            priority: Priority::Low,
            enabled_by_default: enabled,
            ..Self::manual(kind, handler)
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn enabled_by_default(&self) -> bool {
        self.enabled_by_default
    }

    /// Effective enabled flag: the override stored in the broker, else the
    /// configured default
    pub async fn is_enabled(&self, broker: &dyn Broker) -> WorkerResult<bool> {
        Ok(broker
            .task_enabled(self.name())
            .await?
            .unwrap_or(self.enabled_by_default))
    }

    pub fn is_recurring(&self) -> bool {
        self.cron_string.is_some()
    }

    pub fn handler(&self) -> Arc<dyn TaskHandler> {
        self.handler.clone()
    }

    /// Build the cron entry for the scheduler; `None` for manual-only tasks
    pub fn init(&self) -> WorkerResult<Option<CronSchedule>> {
        self.cron_string
            .as_deref()
            .map(CronSchedule::parse)
            .transpose()
    }
}

impl fmt::Debug for TaskDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDescriptor")
            .field("kind", &self.kind)
            .field("category", &self.category)
            .field("cron_string", &self.cron_string)
            .field("priority", &self.priority)
            .field("enabled_by_default", &self.enabled_by_default)
            .finish_non_exhaustive()
    }
}

/// One row of the task listing
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub task_type: TaskCategory,
    pub manual_run: bool,
    pub title: String,
    pub description: String,
    pub enabled: bool,
    pub cron_string: Option<String>,
}

/// Recurring task summary reported by the heartbeat
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskHeartbeat {
    pub enabled: bool,
    pub title: String,
    pub message: String,
    pub cron: String,
}

/// Registered tasks, ordered by [`TaskKind`]
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: BTreeMap<TaskKind, TaskDescriptor>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a task, replacing any previous registration of the same kind
    pub fn register(&mut self, descriptor: TaskDescriptor) {
        tracing::debug!(task = %descriptor.kind, category = descriptor.category.as_str(), "Registered task");
        self.tasks.insert(descriptor.kind, descriptor);
    }

    pub fn get(&self, kind: TaskKind) -> Option<&TaskDescriptor> {
        self.tasks.get(&kind)
    }

    /// Resolve a task by name
    pub fn lookup(&self, name: &str) -> WorkerResult<&TaskDescriptor> {
        let kind: TaskKind = name.parse()?;
        self.get(kind)
            .ok_or_else(|| WorkerError::UnknownTask(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskDescriptor> {
        self.tasks.values()
    }

    /// Tasks that carry a cron schedule
    pub fn recurring(&self) -> impl Iterator<Item = &TaskDescriptor> {
        self.iter().filter(|task| task.is_recurring())
    }

    /// Effective enabled flag of every registered task
    pub async fn resolve_enabled(&self, broker: &dyn Broker) -> WorkerResult<BTreeMap<TaskKind, bool>> {
        let mut resolved = BTreeMap::new();
        for task in self.iter() {
            resolved.insert(task.kind, task.is_enabled(broker).await?);
        }
        Ok(resolved)
    }

    /// Tasks grouped by category name, with flags from [`Self::resolve_enabled`]
    pub fn list_tasks(&self, enabled: &BTreeMap<TaskKind, bool>) -> BTreeMap<String, Vec<TaskInfo>> {
        let mut grouped: BTreeMap<String, Vec<TaskInfo>> = BTreeMap::new();
        for task in self.iter() {
            grouped
                .entry(task.category.as_str().to_string())
                .or_default()
                .push(TaskInfo {
                    name: task.name().to_string(),
                    task_type: task.category,
                    manual_run: task.manual_run,
                    title: task.title.clone(),
                    description: task.description.clone(),
                    enabled: enabled.get(&task.kind).copied().unwrap_or(task.enabled_by_default),
                    cron_string: task.cron_string.clone(),
                });
        }
        grouped
    }

    /// Enabled flag and schedule of each recurring task
    pub fn heartbeat(&self, enabled: &BTreeMap<TaskKind, bool>) -> BTreeMap<String, TaskHeartbeat> {
        self.recurring()
            .map(|task| {
                (
                    task.name().to_string(),
                    TaskHeartbeat {
                        enabled: enabled.get(&task.kind).copied().unwrap_or(task.enabled_by_default),
                        title: task.title.clone(),
                        message: task.description.clone(),
                        cron: task.cron_string.clone().unwrap_or_default(),
                    },
                )
            })
            .collect()
    }
}
