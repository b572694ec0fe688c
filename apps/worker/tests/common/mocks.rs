//! Mock services for worker integration tests
//!
//! Provides the remote file host mock, a library store that fails on chosen
//! files and a do-nothing task handler, for testing tasks without network or
//! database access.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use romvault_worker::registry::{JobContext, TaskHandler};
use romvault_worker::store::{InMemoryLibraryStore, LibraryStats, LibraryStore, RomUpsert};
use romvault_worker::{WorkerError, WorkerResult};
use serde_json::Value;

pub use romvault_test_utils::MockRemoteFileServer;

/// Library store rejecting upserts of selected file names
pub struct FlakyLibraryStore {
    inner: InMemoryLibraryStore,
    rejected: HashSet<String>,
    upsert_calls: Arc<AtomicUsize>,
}

impl FlakyLibraryStore {
    pub fn rejecting(file_names: &[&str]) -> Self {
        Self {
            inner: InMemoryLibraryStore::new(),
            rejected: file_names.iter().map(|s| s.to_string()).collect(),
            upsert_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Get the number of upsert attempts
    pub fn upsert_count(&self) -> usize {
        self.upsert_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LibraryStore for FlakyLibraryStore {
    async fn stats(&self) -> WorkerResult<LibraryStats> {
        self.inner.stats().await
    }

    async fn rom_ids(&self) -> WorkerResult<HashSet<i64>> {
        self.inner.rom_ids().await
    }

    async fn upsert_rom(&self, rom: &RomUpsert) -> WorkerResult<i64> {
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        if self.rejected.contains(&rom.file_name) {
            return Err(WorkerError::Internal(format!(
                "constraint violation on {}",
                rom.file_name
            )));
        }
        self.inner.upsert_rom(rom).await
    }
}

/// Handler that succeeds without doing anything
pub struct NoopTask;

#[async_trait]
impl TaskHandler for NoopTask {
    async fn run(&self, _ctx: &JobContext, _args: Value) -> WorkerResult<()> {
        Ok(())
    }
}
