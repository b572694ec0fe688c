//! Persistence contracts consulted by tasks
//!
//! [`LibraryStore`] is the narrow view of the relational library database
//! that tasks need. [`RunStateStore`] keeps per-task state for remote file
//! pulls between runs.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::error::WorkerResult;

/// Row counts reported after a library scan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryStats {
    pub platforms: i64,
    pub roms: i64,
    pub users: i64,
}

/// A ROM file discovered on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RomUpsert {
    /// Platform folder name, e.g. `snes`
    pub platform_slug: String,
    pub file_name: String,
    /// Path relative to the library root
    pub file_path: String,
    pub file_size: i64,
    pub sha256: String,
}

/// Library database operations used by tasks
#[async_trait]
pub trait LibraryStore: Send + Sync {
    /// Count platforms, ROMs and users
    async fn stats(&self) -> WorkerResult<LibraryStats>;

    /// Ids of every ROM the library knows about
    async fn rom_ids(&self) -> WorkerResult<HashSet<i64>>;

    /// Insert or refresh a ROM, creating its platform on first sight; returns the ROM id
    async fn upsert_rom(&self, rom: &RomUpsert) -> WorkerResult<i64>;
}

/// PostgreSQL-backed library store
#[derive(Clone)]
pub struct PgLibraryStore {
    db: PgPool,
}

impl PgLibraryStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl LibraryStore for PgLibraryStore {
    async fn stats(&self) -> WorkerResult<LibraryStats> {
        let (platforms, roms, users): (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                (SELECT COUNT(*) FROM platforms),
                (SELECT COUNT(*) FROM roms),
                (SELECT COUNT(*) FROM users)
            "#,
        )
        .fetch_one(&self.db)
        .await?;

        Ok(LibraryStats {
            platforms,
            roms,
            users,
        })
    }

    async fn rom_ids(&self) -> WorkerResult<HashSet<i64>> {
        let ids = sqlx::query_scalar::<_, i64>("SELECT id FROM roms")
            .fetch_all(&self.db)
            .await?;
        Ok(ids.into_iter().collect())
    }

    async fn upsert_rom(&self, rom: &RomUpsert) -> WorkerResult<i64> {
        // Upserts keep concurrent scans from racing on the unique keys; the
        // transaction keeps a failed ROM insert from leaving its platform behind
        let mut tx = self.db.begin().await?;

        let platform_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO platforms (slug, fs_slug, name)
            VALUES ($1, $1, $1)
            ON CONFLICT (fs_slug) DO UPDATE SET fs_slug = EXCLUDED.fs_slug
            RETURNING id
            "#,
        )
        .bind(&rom.platform_slug)
        .fetch_one(&mut *tx)
        .await?;

        let rom_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO roms (platform_id, fs_name, fs_path, fs_size_bytes, sha256_hash)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (platform_id, fs_name) DO UPDATE SET
                fs_path = EXCLUDED.fs_path,
                fs_size_bytes = EXCLUDED.fs_size_bytes,
                sha256_hash = EXCLUDED.sha256_hash,
                updated_at = NOW()
            RETURNING id
            "#,
        )
        .bind(platform_id)
        .bind(&rom.file_name)
        .bind(&rom.file_path)
        .bind(rom.file_size)
        .bind(&rom.sha256)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        tracing::debug!(rom_id, platform = %rom.platform_slug, file = %rom.file_name, "Upserted ROM");
        Ok(rom_id)
    }
}

#[derive(Default)]
struct MemoryLibrary {
    platforms: HashSet<String>,
    roms: HashMap<(String, String), (i64, RomUpsert)>,
    next_id: i64,
    users: i64,
}

/// In-process library store for single-process mode and tests
#[derive(Default)]
pub struct InMemoryLibraryStore {
    inner: Mutex<MemoryLibrary>,
}

impl InMemoryLibraryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a known ROM id, as if created by an earlier scan
    pub fn insert_rom_id(&self, id: i64) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let rom = RomUpsert {
            platform_slug: "seed".to_string(),
            file_name: format!("rom-{}", id),
            file_path: format!("seed/rom-{}", id),
            file_size: 0,
            sha256: String::new(),
        };
        inner.platforms.insert(rom.platform_slug.clone());
        inner
            .roms
            .insert((rom.platform_slug.clone(), rom.file_name.clone()), (id, rom));
        inner.next_id = inner.next_id.max(id);
    }

    pub fn set_users(&self, users: i64) {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).users = users;
    }

    /// Stored copy of a ROM by platform and file name
    pub fn rom(&self, platform_slug: &str, file_name: &str) -> Option<RomUpsert> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .roms
            .get(&(platform_slug.to_string(), file_name.to_string()))
            .map(|(_, rom)| rom.clone())
    }
}

#[async_trait]
impl LibraryStore for InMemoryLibraryStore {
    async fn stats(&self) -> WorkerResult<LibraryStats> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(LibraryStats {
            platforms: inner.platforms.len() as i64,
            roms: inner.roms.len() as i64,
            users: inner.users,
        })
    }

    async fn rom_ids(&self) -> WorkerResult<HashSet<i64>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(inner.roms.values().map(|(id, _)| *id).collect())
    }

    async fn upsert_rom(&self, rom: &RomUpsert) -> WorkerResult<i64> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.platforms.insert(rom.platform_slug.clone());

        let key = (rom.platform_slug.clone(), rom.file_name.clone());
        let id = match inner.roms.get(&key) {
            Some((id, _)) => *id,
            None => {
                inner.next_id += 1;
                inner.next_id
            }
        };
        inner.roms.insert(key, (id, rom.clone()));
        Ok(id)
    }
}

/// State a remote file pull keeps between runs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    pub last_successful_fetch_at: Option<DateTime<Utc>>,
    /// Hex SHA-256 of the last body written to the cache
    pub fingerprint: Option<String>,
    pub etag: Option<String>,
}

/// Storage for [`RunState`], keyed by task name
#[async_trait]
pub trait RunStateStore: Send + Sync {
    async fn load(&self, task_name: &str) -> WorkerResult<RunState>;
    async fn save(&self, task_name: &str, state: &RunState) -> WorkerResult<()>;
}

/// Run state stored as JSON under `{prefix}:task:{name}:run_state`
#[derive(Clone)]
pub struct RedisRunStateStore {
    conn: redis::aio::MultiplexedConnection,
    prefix: String,
}

impl RedisRunStateStore {
    pub fn new(conn: redis::aio::MultiplexedConnection, prefix: impl Into<String>) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
        }
    }

    fn key(&self, task_name: &str) -> String {
        format!("{}:task:{}:run_state", self.prefix, task_name)
    }
}

#[async_trait]
impl RunStateStore for RedisRunStateStore {
    async fn load(&self, task_name: &str) -> WorkerResult<RunState> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.key(task_name))
            .query_async(&mut conn)
            .await?;

        match raw {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(RunState::default()),
        }
    }

    async fn save(&self, task_name: &str, state: &RunState) -> WorkerResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(self.key(task_name))
            .arg(serde_json::to_string(state)?)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }
}

/// In-process run state store
#[derive(Default)]
pub struct InMemoryRunStateStore {
    states: dashmap::DashMap<String, RunState>,
}

impl InMemoryRunStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStateStore for InMemoryRunStateStore {
    async fn load(&self, task_name: &str) -> WorkerResult<RunState> {
        Ok(self
            .states
            .get(task_name)
            .map(|s| s.clone())
            .unwrap_or_default())
    }

    async fn save(&self, task_name: &str, state: &RunState) -> WorkerResult<()> {
        self.states.insert(task_name.to_string(), state.clone());
        Ok(())
    }
}
