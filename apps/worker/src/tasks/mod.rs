//! Built-in task handlers
//!
//! - [`ScanLibraryTask`] walks the ROM library and upserts every file
//! - [`RemoteFilePullTask`] refreshes a cached remote resource (Switch
//!   TitleDB, MAME machine list)
//! - [`CleanupOrphanedResourcesTask`] deletes resources of removed ROMs

pub mod cleanup;
pub mod remote_pull;
pub mod scan_library;

pub use cleanup::CleanupOrphanedResourcesTask;
pub use remote_pull::{PullOutcome, RemoteFilePullTask};
pub use scan_library::{FsLibraryScanner, LibraryScanner, ScanLibraryTask};

use std::path::PathBuf;
use std::sync::Arc;

use romvault_shared_config::TasksConfig;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{WorkerError, WorkerResult};
use crate::registry::{TaskDescriptor, TaskKind, TaskRegistry};
use crate::store::{LibraryStore, RunStateStore};

/// Collaborators shared by the built-in tasks
#[derive(Clone)]
pub struct TaskDeps {
    pub library: Arc<dyn LibraryStore>,
    pub run_state: Arc<dyn RunStateStore>,
    pub http: reqwest::Client,
    pub library_path: PathBuf,
    pub resources_path: PathBuf,
    /// Items between progress reports
    pub progress_batch: usize,
}

/// Location of the cached Switch title database
pub fn switch_titledb_cache(resources_path: &std::path::Path) -> PathBuf {
    resources_path.join("switch").join("titledb.json")
}

/// Location of the cached MAME machine list
pub fn mame_xml_cache(resources_path: &std::path::Path) -> PathBuf {
    resources_path.join("mame").join("mame.xml")
}

/// Register every built-in task with its configured schedule
pub fn builtin_registry(deps: &TaskDeps, config: &TasksConfig) -> TaskRegistry {
    let mut registry = TaskRegistry::new();

    registry.register(
        TaskDescriptor::scheduled(
            TaskKind::ScanLibrary,
            config.rescan.cron.clone(),
            config.rescan.enabled,
            Arc::new(ScanLibraryTask::new(
                Arc::new(FsLibraryScanner::new(deps.library_path.clone())),
                deps.library.clone(),
                deps.progress_batch,
            )),
        )
        .with_title("Rescan library")
        .with_description("Rescans the entire library for new, changed and removed ROMs"),
    );

    registry.register(
        TaskDescriptor::scheduled(
            TaskKind::UpdateSwitchTitledb,
            config.switch_titledb.cron.clone(),
            config.switch_titledb.enabled,
            Arc::new(RemoteFilePullTask::new(
                TaskKind::UpdateSwitchTitledb.name(),
                config.switch_titledb_url.clone(),
                switch_titledb_cache(&deps.resources_path),
                deps.http.clone(),
                deps.run_state.clone(),
            )),
        )
        .with_title("Update Switch TitleDB")
        .with_description("Downloads the Nintendo Switch title database used to match titles"),
    );

    registry.register(
        TaskDescriptor::scheduled(
            TaskKind::UpdateMameXml,
            config.mame_xml.cron.clone(),
            config.mame_xml.enabled,
            Arc::new(RemoteFilePullTask::new(
                TaskKind::UpdateMameXml.name(),
                config.mame_xml_url.clone(),
                mame_xml_cache(&deps.resources_path),
                deps.http.clone(),
                deps.run_state.clone(),
            )),
        )
        .with_title("Update MAME XML")
        .with_description("Downloads the MAME machine list used to name arcade ROMs"),
    );

    registry.register(
        TaskDescriptor::manual(
            TaskKind::CleanupOrphanedResources,
            Arc::new(CleanupOrphanedResourcesTask::new(
                deps.resources_path.clone(),
                deps.library.clone(),
            )),
        )
        .with_title("Cleanup orphaned resources")
        .with_description("Deletes cover art and other resources of ROMs no longer in the library"),
    );

    registry
}

/// Decode handler arguments; `null` means "no arguments" and unknown keys are ignored
pub(crate) fn parse_args<T>(args: Value) -> WorkerResult<T>
where
    T: DeserializeOwned + Default,
{
    if args.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(args).map_err(|e| WorkerError::InvalidPayload(e.to_string()))
}

/// A started job to run handlers against in unit tests
#[cfg(test)]
pub(crate) async fn test_context(
    task_name: &str,
) -> (Arc<crate::queue::InMemoryBroker>, crate::registry::JobContext) {
    use crate::events::EventChannel;
    use crate::progress::ProgressReporter;
    use crate::queue::{Broker, EnqueueRequest, InMemoryBroker, Priority};

    let broker = Arc::new(InMemoryBroker::new());
    broker
        .enqueue(EnqueueRequest::new(task_name, Priority::Default))
        .await
        .unwrap();
    let job = broker.dequeue(&Priority::ALL).await.unwrap().unwrap();
    let progress = ProgressReporter::new(
        broker.clone(),
        EventChannel::in_memory(),
        job.id,
        job.task_name.clone(),
        job.meta.clone(),
    );
    (broker, crate::registry::JobContext { job, progress })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryLibraryStore, InMemoryRunStateStore};
    use romvault_shared_config::ScheduledTaskConfig;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Default, Deserialize, PartialEq)]
    struct Args {
        #[serde(default)]
        force: bool,
    }

    fn deps() -> TaskDeps {
        TaskDeps {
            library: Arc::new(InMemoryLibraryStore::new()),
            run_state: Arc::new(InMemoryRunStateStore::new()),
            http: reqwest::Client::new(),
            library_path: PathBuf::from("/library"),
            resources_path: PathBuf::from("/resources"),
            progress_batch: 10,
        }
    }

    #[test]
    fn test_parse_args() {
        assert_eq!(parse_args::<Args>(Value::Null).unwrap(), Args { force: false });
        assert_eq!(parse_args::<Args>(json!({})).unwrap(), Args { force: false });
        assert_eq!(
            parse_args::<Args>(json!({"force": true, "requested_by": "admin"})).unwrap(),
            Args { force: true }
        );
        assert!(matches!(
            parse_args::<Args>(json!({"force": "yes"})),
            Err(WorkerError::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_builtin_registry() {
        let mut config = TasksConfig::default();
        config.rescan = ScheduledTaskConfig::enabled("0 2 * * *");

        let registry = builtin_registry(&deps(), &config);
        assert_eq!(registry.iter().count(), TaskKind::ALL.len());

        let scan = registry.get(TaskKind::ScanLibrary).unwrap();
        assert!(scan.enabled_by_default());
        assert_eq!(scan.cron_string.as_deref(), Some("0 2 * * *"));

        let mame = registry.get(TaskKind::UpdateMameXml).unwrap();
        assert!(!mame.enabled_by_default());
        assert_eq!(mame.cron_string.as_deref(), Some("0 5 * * *"));

        assert_eq!(registry.recurring().count(), 3);
        for task in registry.iter() {
            assert!(!task.concurrent);
            assert!(task.init().is_ok());
        }
    }

    #[test]
    fn test_cache_locations() {
        let root = PathBuf::from("/resources");
        assert_eq!(mame_xml_cache(&root), PathBuf::from("/resources/mame/mame.xml"));
        assert_eq!(
            switch_titledb_cache(&root),
            PathBuf::from("/resources/switch/titledb.json")
        );
    }
}
