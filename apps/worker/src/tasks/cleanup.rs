//! Orphaned resource cleanup
//!
//! Per-ROM resources (cover art, screenshots) live under
//! `{resources}/roms/{rom_id}/`. Directories whose id the library no longer
//! knows are deleted. Anything that is not a numeric directory is left alone.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use super::parse_args;
use crate::error::WorkerResult;
use crate::progress::BulkOutcome;
use crate::registry::{JobContext, TaskHandler};
use crate::store::LibraryStore;

/// Arguments accepted on manual runs
#[derive(Debug, Default, Deserialize)]
struct CleanupArgs {
    /// Report what would be deleted without deleting it
    #[serde(default)]
    dry_run: bool,
}

/// Task deleting resources of ROMs removed from the library
pub struct CleanupOrphanedResourcesTask {
    resources_path: PathBuf,
    library: Arc<dyn LibraryStore>,
}

impl CleanupOrphanedResourcesTask {
    pub fn new(resources_path: impl Into<PathBuf>, library: Arc<dyn LibraryStore>) -> Self {
        Self {
            resources_path: resources_path.into(),
            library,
        }
    }

    fn roms_dir(&self) -> PathBuf {
        self.resources_path.join("roms")
    }

    /// Resource directories whose ROM id is unknown to the library
    async fn orphans(&self, known: &HashSet<i64>) -> WorkerResult<Vec<(i64, PathBuf)>> {
        let dir = self.roms_dir();
        if tokio::fs::metadata(&dir).await.is_err() {
            return Ok(Vec::new());
        }

        let mut orphans = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let Some(id) = entry.file_name().to_str().and_then(|n| n.parse::<i64>().ok()) else {
                continue;
            };
            if !known.contains(&id) {
                orphans.push((id, entry.path()));
            }
        }
        orphans.sort();
        Ok(orphans)
    }
}

#[async_trait]
impl TaskHandler for CleanupOrphanedResourcesTask {
    async fn run(&self, ctx: &JobContext, args: Value) -> WorkerResult<()> {
        let args: CleanupArgs = parse_args(args)?;

        let known = self.library.rom_ids().await?;
        let orphans = self.orphans(&known).await?;
        tracing::info!(
            job_id = %ctx.job.id,
            known = known.len(),
            orphans = orphans.len(),
            dry_run = args.dry_run,
            "Cleaning up orphaned resources"
        );

        let mut outcome = BulkOutcome::new();
        let mut removed = Vec::new();
        for (id, path) in &orphans {
            if args.dry_run {
                outcome.record_success();
                removed.push(Value::from(*id));
                continue;
            }
            match tokio::fs::remove_dir_all(path).await {
                Ok(()) => {
                    tracing::debug!(rom_id = id, path = %path.display(), "Removed orphaned resources");
                    outcome.record_success();
                    removed.push(Value::from(*id));
                }
                Err(e) => {
                    tracing::warn!(rom_id = id, error = %e, "Failed to remove orphaned resources");
                    outcome.record_failure(format!("roms/{}", id), e);
                }
            }
        }

        let mut meta = outcome.to_meta();
        meta.insert("removed".to_string(), Value::Array(removed));
        meta.insert("dry_run".to_string(), Value::from(args.dry_run));
        ctx.progress.report(meta).await
    }
}
