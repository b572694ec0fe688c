//! Library scan
//!
//! Walks the ROM library (`{library}/{platform}/...`), fingerprints every
//! file and upserts it into the library database. Hidden files and folders
//! are skipped. One unreadable file never aborts the scan; it is recorded in
//! the job's `errors` metadata instead.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use super::parse_args;
use crate::error::{WorkerError, WorkerResult};
use crate::progress::{BatchedProgress, BulkOutcome};
use crate::registry::{JobContext, TaskHandler};
use crate::store::{LibraryStore, RomUpsert};

/// A ROM file found on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredRom {
    pub platform_slug: String,
    /// Path inside the platform folder, `/`-separated
    pub file_name: String,
    /// Path relative to the library root, `/`-separated
    pub relative_path: String,
    pub absolute_path: PathBuf,
    pub size: u64,
}

/// Source of ROM files
#[async_trait]
pub trait LibraryScanner: Send + Sync {
    /// List ROM files, limited to `platforms` when given
    async fn discover(&self, platforms: Option<&[String]>) -> WorkerResult<Vec<DiscoveredRom>>;

    /// Hex SHA-256 of a discovered file
    async fn fingerprint(&self, rom: &DiscoveredRom) -> WorkerResult<String>;
}

/// Scanner over the library directory on the local file system
pub struct FsLibraryScanner {
    root: PathBuf,
}

impl FsLibraryScanner {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl LibraryScanner for FsLibraryScanner {
    async fn discover(&self, platforms: Option<&[String]>) -> WorkerResult<Vec<DiscoveredRom>> {
        let root = self.root.clone();
        let platforms = platforms.map(|p| p.to_vec());
        tokio::task::spawn_blocking(move || discover_blocking(&root, platforms.as_deref()))
            .await
            .map_err(|e| WorkerError::Internal(format!("library walk aborted: {}", e)))?
    }

    async fn fingerprint(&self, rom: &DiscoveredRom) -> WorkerResult<String> {
        let path = rom.absolute_path.clone();
        tokio::task::spawn_blocking(move || compute_file_hash(&path))
            .await
            .map_err(|e| WorkerError::Internal(format!("hashing aborted: {}", e)))?
    }
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_str().map(|s| s.starts_with('.')).unwrap_or(false)
}

fn discover_blocking(root: &Path, platforms: Option<&[String]>) -> WorkerResult<Vec<DiscoveredRom>> {
    if !root.is_dir() {
        return Err(WorkerError::LibraryNotFound(root.display().to_string()));
    }

    let mut platform_dirs = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let name = entry.file_name();
        if is_hidden(&name) || !entry.path().is_dir() {
            continue;
        }
        let Some(slug) = name.to_str().map(str::to_string) else {
            tracing::warn!(path = ?entry.path(), "Skipping platform folder with non UTF-8 name");
            continue;
        };
        if let Some(wanted) = platforms {
            if !wanted.contains(&slug) {
                continue;
            }
        }
        platform_dirs.push((slug, entry.path()));
    }
    platform_dirs.sort();

    if let Some(wanted) = platforms {
        for slug in wanted {
            if !platform_dirs.iter().any(|(found, _)| found == slug) {
                tracing::warn!(platform = %slug, "Requested platform folder not found");
            }
        }
    }

    let mut roms = Vec::new();
    for (slug, dir) in platform_dirs {
        let walker = WalkDir::new(&dir)
            .min_depth(1)
            .follow_links(true)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !is_hidden(e.file_name()));

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(platform = %slug, error = %e, "Skipping unreadable library entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let Ok(inner) = entry.path().strip_prefix(&dir) else {
                continue;
            };
            let file_name = slash_path(inner);
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);

            roms.push(DiscoveredRom {
                relative_path: format!("{}/{}", slug, file_name),
                platform_slug: slug.clone(),
                file_name,
                absolute_path: entry.path().to_path_buf(),
                size,
            });
        }
    }

    Ok(roms)
}

fn slash_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Compute SHA-256 hash of a file
fn compute_file_hash(path: &Path) -> WorkerResult<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Arguments accepted on manual runs
#[derive(Debug, Default, Deserialize)]
struct ScanArgs {
    /// Only rescan these platform folders
    #[serde(default)]
    platforms: Option<Vec<String>>,
}

impl ScanArgs {
    fn validate(&self) -> WorkerResult<()> {
        for slug in self.platforms.iter().flatten() {
            let bad = slug.is_empty()
                || slug.starts_with('.')
                || slug.contains('/')
                || slug.contains('\\');
            if bad {
                return Err(WorkerError::InvalidPayload(format!(
                    "invalid platform folder '{}'",
                    slug
                )));
            }
        }
        Ok(())
    }
}

/// Task rescanning the ROM library
pub struct ScanLibraryTask {
    scanner: Arc<dyn LibraryScanner>,
    library: Arc<dyn LibraryStore>,
    progress_batch: usize,
}

impl ScanLibraryTask {
    pub fn new(
        scanner: Arc<dyn LibraryScanner>,
        library: Arc<dyn LibraryStore>,
        progress_batch: usize,
    ) -> Self {
        Self {
            scanner,
            library,
            progress_batch,
        }
    }

    async fn index(&self, rom: &DiscoveredRom) -> WorkerResult<i64> {
        let sha256 = self.scanner.fingerprint(rom).await?;
        let size = i64::try_from(rom.size)
            .map_err(|_| WorkerError::Internal(format!("file too large: {} bytes", rom.size)))?;

        self.library
            .upsert_rom(&RomUpsert {
                platform_slug: rom.platform_slug.clone(),
                file_name: rom.file_name.clone(),
                file_path: rom.relative_path.clone(),
                file_size: size,
                sha256,
            })
            .await
    }
}

#[async_trait]
impl TaskHandler for ScanLibraryTask {
    async fn run(&self, ctx: &JobContext, args: Value) -> WorkerResult<()> {
        let args: ScanArgs = parse_args(args)?;
        args.validate()?;

        let roms = self.scanner.discover(args.platforms.as_deref()).await?;
        tracing::info!(job_id = %ctx.job.id, files = roms.len(), "Starting library scan");

        let mut outcome = BulkOutcome::new();
        let mut batch = BatchedProgress::new(&ctx.progress, self.progress_batch).with_total(roms.len());
        for rom in &roms {
            match self.index(rom).await {
                Ok(_) => outcome.record_success(),
                Err(e) => {
                    tracing::warn!(path = %rom.relative_path, error = %e, "Failed to index ROM");
                    outcome.record_failure(&rom.relative_path, e);
                }
            }
            batch.advance().await?;
        }
        batch.finish().await?;

        let stats = self.library.stats().await?;
        tracing::info!(
            indexed = outcome.successful_items,
            failed = outcome.failed_items,
            platforms = stats.platforms,
            roms = stats.roms,
            "Library scan completed"
        );

        let mut meta = outcome.to_meta();
        meta.insert("stats".to_string(), serde_json::to_value(stats)?);
        ctx.progress.report(meta).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Broker;
    use crate::store::InMemoryLibraryStore;
    use crate::tasks::test_context;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn library() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("snes")).unwrap();
        fs::create_dir_all(root.join("psx/Final Fantasy VII")).unwrap();
        fs::create_dir_all(root.join(".trash")).unwrap();
        fs::write(root.join("snes/zelda.sfc"), b"zelda").unwrap();
        fs::write(root.join("snes/.DS_Store"), b"junk").unwrap();
        fs::write(root.join("psx/Final Fantasy VII/disc1.bin"), b"disc").unwrap();
        fs::write(root.join(".trash/old.sfc"), b"old").unwrap();
        fs::write(root.join("README.txt"), b"not a rom").unwrap();
        dir
    }

    #[tokio::test]
    async fn test_discover_layout() {
        let dir = library();
        let roms = FsLibraryScanner::new(dir.path()).discover(None).await.unwrap();

        let paths: Vec<_> = roms.iter().map(|r| r.relative_path.as_str()).collect();
        assert_eq!(paths, vec!["psx/Final Fantasy VII/disc1.bin", "snes/zelda.sfc"]);
        assert_eq!(roms[0].platform_slug, "psx");
        assert_eq!(roms[0].file_name, "Final Fantasy VII/disc1.bin");
        assert_eq!(roms[1].size, 5);
    }

    #[tokio::test]
    async fn test_discover_filters_platforms() {
        let dir = library();
        let wanted = vec!["snes".to_string(), "n64".to_string()];
        let roms = FsLibraryScanner::new(dir.path())
            .discover(Some(&wanted))
            .await
            .unwrap();
        assert_eq!(roms.len(), 1);
        assert_eq!(roms[0].platform_slug, "snes");
    }

    #[tokio::test]
    async fn test_missing_library_root() {
        let scanner = FsLibraryScanner::new("/definitely/not/a/library");
        assert_matches!(scanner.discover(None).await, Err(WorkerError::LibraryNotFound(_)));
    }

    #[tokio::test]
    async fn test_run_upserts_and_reports_stats() {
        let dir = library();
        let store = Arc::new(InMemoryLibraryStore::new());
        let task = ScanLibraryTask::new(Arc::new(FsLibraryScanner::new(dir.path())), store.clone(), 1);
        let (broker, ctx) = test_context("scan_library").await;

        task.run(&ctx, json!({})).await.unwrap();

        let zelda = store.rom("snes", "zelda.sfc").unwrap();
        assert_eq!(zelda.file_path, "snes/zelda.sfc");
        assert_eq!(zelda.sha256, format!("{:x}", Sha256::digest(b"zelda")));

        let job = broker.get_status(ctx.job.id).await.unwrap();
        assert_eq!(job.meta["processed"], json!(2));
        assert_eq!(job.meta["total"], json!(2));
        assert_eq!(job.meta["successful_items"], json!(2));
        assert_eq!(job.meta["failed_items"], json!(0));
        assert_eq!(job.meta["stats"]["platforms"], json!(2));
        assert_eq!(job.meta["stats"]["roms"], json!(2));
    }

    #[tokio::test]
    async fn test_rejects_path_like_platforms() {
        let dir = library();
        let task = ScanLibraryTask::new(
            Arc::new(FsLibraryScanner::new(dir.path())),
            Arc::new(InMemoryLibraryStore::new()),
            10,
        );
        let (_broker, ctx) = test_context("scan_library").await;

        for bad in ["../etc", "snes/../..", "", ".trash"] {
            assert_matches!(
                task.run(&ctx, json!({ "platforms": [bad] })).await,
                Err(WorkerError::InvalidPayload(_))
            );
        }
    }
}
