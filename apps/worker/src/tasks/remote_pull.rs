//! Remote file pull
//!
//! Downloads a remote resource into a local cache file. The body's SHA-256
//! fingerprint is compared with the last one written so an unchanged
//! resource never rewrites the cache. When the server supplied an `ETag`,
//! the next request is conditional and a `304` also counts as unchanged.
//!
//! A failed fetch is only fatal when there is no cached copy to fall back on.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{ETAG, IF_NONE_MATCH};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::parse_args;
use crate::error::{WorkerError, WorkerResult};
use crate::queue::JobMeta;
use crate::registry::{JobContext, TaskHandler};
use crate::store::RunStateStore;

/// Result of one pull
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullOutcome {
    /// The cache file was (re)written
    Updated { fingerprint: String, bytes: usize },
    /// The remote content matches the cache
    Unchanged,
    /// The fetch failed but a cached copy remains in use
    Skipped { reason: String },
}

impl PullOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Updated { .. } => "updated",
            Self::Unchanged => "unchanged",
            Self::Skipped { .. } => "skipped",
        }
    }
}

/// Arguments accepted on manual runs
#[derive(Debug, Default, Deserialize)]
struct PullArgs {
    /// Rewrite the cache even when the content is unchanged
    #[serde(default)]
    force: bool,
}

/// Task keeping a local copy of a remote file up to date
pub struct RemoteFilePullTask {
    task_name: String,
    url: String,
    cache_path: PathBuf,
    http: reqwest::Client,
    run_state: Arc<dyn RunStateStore>,
}

impl RemoteFilePullTask {
    pub fn new(
        task_name: impl Into<String>,
        url: impl Into<String>,
        cache_path: impl Into<PathBuf>,
        http: reqwest::Client,
        run_state: Arc<dyn RunStateStore>,
    ) -> Self {
        Self {
            task_name: task_name.into(),
            url: url.into(),
            cache_path: cache_path.into(),
            http,
            run_state,
        }
    }

    pub fn cache_path(&self) -> &Path {
        &self.cache_path
    }

    /// Fetch the resource and refresh the cache if it changed
    pub async fn pull(&self, force: bool) -> WorkerResult<PullOutcome> {
        let mut state = self.run_state.load(&self.task_name).await?;
        let has_cache = tokio::fs::metadata(&self.cache_path).await.is_ok();

        let mut request = self.http.get(&self.url);
        if has_cache && !force {
            if let Some(etag) = &state.etag {
                request = request.header(IF_NONE_MATCH, etag.as_str());
            }
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return self.fetch_failed(has_cache, e.to_string()),
        };

        let status = response.status();
        if status == StatusCode::NOT_MODIFIED && has_cache {
            tracing::info!(task = %self.task_name, url = %self.url, "Remote file not modified");
            state.last_successful_fetch_at = Some(Utc::now());
            self.run_state.save(&self.task_name, &state).await?;
            return Ok(PullOutcome::Unchanged);
        }
        if !status.is_success() {
            return self.fetch_failed(has_cache, format!("HTTP {}", status));
        }

        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => return self.fetch_failed(has_cache, e.to_string()),
        };

        let fingerprint = format!("{:x}", Sha256::digest(&body));
        let unchanged = has_cache && state.fingerprint.as_deref() == Some(fingerprint.as_str());

        state.last_successful_fetch_at = Some(Utc::now());
        state.etag = etag;

        if unchanged && !force {
            tracing::info!(task = %self.task_name, fingerprint = %fingerprint, "Remote file unchanged");
            self.run_state.save(&self.task_name, &state).await?;
            return Ok(PullOutcome::Unchanged);
        }

        self.write_cache(&body).await?;
        state.fingerprint = Some(fingerprint.clone());
        self.run_state.save(&self.task_name, &state).await?;

        tracing::info!(
            task = %self.task_name,
            path = %self.cache_path.display(),
            bytes = body.len(),
            fingerprint = %fingerprint,
            "Remote file cache updated"
        );
        Ok(PullOutcome::Updated {
            fingerprint,
            bytes: body.len(),
        })
    }

    fn fetch_failed(&self, has_cache: bool, reason: String) -> WorkerResult<PullOutcome> {
        if has_cache {
            tracing::warn!(
                task = %self.task_name,
                url = %self.url,
                reason = %reason,
                "Remote fetch failed, keeping cached copy"
            );
            Ok(PullOutcome::Skipped { reason })
        } else {
            Err(WorkerError::remote_fetch(&self.url, reason))
        }
    }

    /// Replace the cache file without exposing a partially written copy
    async fn write_cache(&self, body: &[u8]) -> WorkerResult<()> {
        if let Some(parent) = self.cache_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut partial = self.cache_path.clone().into_os_string();
        partial.push(".part");
        let partial = PathBuf::from(partial);

        tokio::fs::write(&partial, body).await?;
        tokio::fs::rename(&partial, &self.cache_path).await?;
        Ok(())
    }
}

#[async_trait]
impl TaskHandler for RemoteFilePullTask {
    async fn run(&self, ctx: &JobContext, args: Value) -> WorkerResult<()> {
        let args: PullArgs = parse_args(args)?;
        ctx.progress.set("url", self.url.as_str()).await?;

        let outcome = self.pull(args.force).await?;

        let mut meta = JobMeta::new();
        meta.insert("outcome".to_string(), Value::from(outcome.as_str()));
        match &outcome {
            PullOutcome::Updated { fingerprint, bytes } => {
                meta.insert("fingerprint".to_string(), Value::from(fingerprint.as_str()));
                meta.insert("bytes".to_string(), Value::from(*bytes));
            }
            PullOutcome::Skipped { reason } => {
                meta.insert(
                    "warning".to_string(),
                    Value::from(format!("fetch failed, using cached copy: {}", reason)),
                );
            }
            PullOutcome::Unchanged => {}
        }
        ctx.progress.report(meta).await
    }
}
