//! Worker configuration loaded from environment variables
//!
//! This module provides configuration for the romvault worker and scheduler
//! processes. Configuration is loaded from environment variables with sensible
//! defaults for development environments.

use std::env;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use romvault_shared_config::{CommonConfig, DatabaseConfig, Environment, RedisConfig, TasksConfig};

/// Worker and scheduler configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Common configuration shared with other services
    pub common: CommonConfig,

    /// How long an idle slot sleeps between dequeue attempts
    pub poll_interval: Duration,

    /// Number of jobs a worker process runs at once
    pub concurrency: usize,

    /// Started jobs without a heartbeat for this long are failed by the sweep
    pub stale_job_timeout: Duration,

    /// Optional hard limit on a single job's run time
    pub job_timeout: Option<Duration>,

    /// How long terminal job records are kept; `None` keeps them forever
    pub job_retention: Option<Duration>,

    /// Items between progress reports for batch tasks
    pub progress_batch: usize,

    /// Scheduler wake-up interval
    pub scheduler_tick: Duration,

    /// Timeout for remote fetches performed by tasks
    pub http_timeout: Duration,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let common = CommonConfig::from_env()
            .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;

        let config = Self {
            common,
            poll_interval: Duration::from_secs(secs_from_env("WORKER_POLL_INTERVAL", 1)?),
            concurrency: env::var("WORKER_CONCURRENCY")
                .unwrap_or_else(|_| "2".to_string())
                .parse()
                .context("Invalid WORKER_CONCURRENCY value")?,
            stale_job_timeout: Duration::from_secs(secs_from_env("WORKER_STALE_JOB_TIMEOUT", 600)?),
            job_timeout: optional_secs_from_env("WORKER_JOB_TIMEOUT", 0)?,
            job_retention: optional_secs_from_env("WORKER_JOB_RETENTION", 86_400)?,
            progress_batch: env::var("WORKER_PROGRESS_BATCH")
                .unwrap_or_else(|_| "50".to_string())
                .parse()
                .context("Invalid WORKER_PROGRESS_BATCH value")?,
            scheduler_tick: Duration::from_secs(secs_from_env("SCHEDULER_TICK_INTERVAL", 30)?),
            http_timeout: Duration::from_secs(secs_from_env("TASK_HTTP_TIMEOUT", 120)?),
        };

        config.validate()?;
        Ok(config)
    }

    /// Configuration for tests and embedded use, rooted at the given directories
    pub fn for_paths(library_path: impl AsRef<Path>, resources_path: impl AsRef<Path>) -> Self {
        Self {
            common: CommonConfig::for_paths(library_path.as_ref(), resources_path.as_ref()),
            poll_interval: Duration::from_millis(20),
            concurrency: 2,
            stale_job_timeout: Duration::from_secs(600),
            job_timeout: None,
            job_retention: None,
            progress_batch: 50,
            scheduler_tick: Duration::from_secs(30),
            http_timeout: Duration::from_secs(10),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            anyhow::bail!("WORKER_CONCURRENCY must be at least 1");
        }
        if self.progress_batch == 0 {
            anyhow::bail!("WORKER_PROGRESS_BATCH must be at least 1");
        }
        if self.stale_job_timeout.is_zero() {
            anyhow::bail!("WORKER_STALE_JOB_TIMEOUT must be at least 1 second");
        }
        if self.scheduler_tick.is_zero() {
            anyhow::bail!("SCHEDULER_TICK_INTERVAL must be at least 1 second");
        }
        Ok(())
    }

    /// Interval at which a running job refreshes its heartbeat
    pub fn heartbeat_interval(&self) -> Duration {
        (self.stale_job_timeout / 3).max(Duration::from_millis(100))
    }

    /// Get database configuration
    pub fn database(&self) -> &DatabaseConfig {
        &self.common.database
    }

    /// Get Redis configuration
    pub fn redis(&self) -> &RedisConfig {
        &self.common.redis
    }

    /// Get recurring task configuration
    pub fn tasks(&self) -> &TasksConfig {
        &self.common.tasks
    }

    /// Get ROM library path
    pub fn library_path(&self) -> &Path {
        &self.common.library_path
    }

    /// Get downloaded resources path
    pub fn resources_path(&self) -> &Path {
        &self.common.resources_path
    }

    /// Get environment mode
    pub fn environment(&self) -> Environment {
        self.common.environment
    }
}

fn secs_from_env(name: &str, default: u64) -> Result<u64> {
    env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .with_context(|| format!("Invalid {} value", name))
}

/// Seconds from the environment where `0` means "disabled"
fn optional_secs_from_env(name: &str, default: u64) -> Result<Option<Duration>> {
    let secs = secs_from_env(name, default)?;
    Ok((secs > 0).then(|| Duration::from_secs(secs)))
}

/// Replace any password in a connection URL so it can be logged
pub fn redact_url(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                // Only fails for cannot-be-a-base URLs, which carry no password
                let _ = parsed.set_password(Some("***"));
            }
            parsed.to_string()
        }
        Err(_) => "<invalid url>".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WORKER_VARS: [&str; 8] = [
        "WORKER_POLL_INTERVAL",
        "WORKER_CONCURRENCY",
        "WORKER_STALE_JOB_TIMEOUT",
        "WORKER_JOB_TIMEOUT",
        "WORKER_JOB_RETENTION",
        "WORKER_PROGRESS_BATCH",
        "SCHEDULER_TICK_INTERVAL",
        "TASK_HTTP_TIMEOUT",
    ];

    fn with_worker_env<F: FnOnce()>(vars: &[(&str, &str)], f: F) {
        let mut all: Vec<(&str, Option<&str>)> = WORKER_VARS.iter().map(|k| (*k, None)).collect();
        for &(k, v) in vars {
            all.retain(|(name, _)| *name != k);
            all.push((k, Some(v)));
        }
        temp_env::with_vars(all, f);
    }

    #[test]
    fn test_defaults() {
        with_worker_env(&[], || {
            let config = Config::from_env().unwrap();
            assert_eq!(config.poll_interval, Duration::from_secs(1));
            assert_eq!(config.concurrency, 2);
            assert_eq!(config.stale_job_timeout, Duration::from_secs(600));
            assert!(config.job_timeout.is_none());
            assert_eq!(config.job_retention, Some(Duration::from_secs(86_400)));
            assert_eq!(config.progress_batch, 50);
            assert_eq!(config.scheduler_tick, Duration::from_secs(30));
            assert_eq!(config.http_timeout, Duration::from_secs(120));
        });
    }

    #[test]
    fn test_custom_values() {
        with_worker_env(
            &[
                ("WORKER_CONCURRENCY", "8"),
                ("WORKER_JOB_TIMEOUT", "3600"),
                ("WORKER_JOB_RETENTION", "0"),
                ("WORKER_STALE_JOB_TIMEOUT", "90"),
            ],
            || {
                let config = Config::from_env().unwrap();
                assert_eq!(config.concurrency, 8);
                assert_eq!(config.job_timeout, Some(Duration::from_secs(3600)));
                assert!(config.job_retention.is_none());
                assert_eq!(config.heartbeat_interval(), Duration::from_secs(30));
            },
        );
    }

    #[test]
    fn test_invalid_values_are_errors() {
        with_worker_env(&[("WORKER_POLL_INTERVAL", "not_a_number")], || {
            let err = Config::from_env().unwrap_err();
            assert!(err.to_string().contains("WORKER_POLL_INTERVAL"));
        });

        with_worker_env(&[("WORKER_CONCURRENCY", "-1")], || {
            assert!(Config::from_env().is_err());
        });
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        with_worker_env(&[("WORKER_CONCURRENCY", "0")], || {
            let err = Config::from_env().unwrap_err();
            assert!(err.to_string().contains("at least 1"));
        });
    }

    #[test]
    fn test_redact_url() {
        assert_eq!(
            redact_url("redis://:hunter2@cache:6379/0"),
            "redis://:***@cache:6379/0"
        );
        assert_eq!(redact_url("redis://localhost:6379"), "redis://localhost:6379");
        assert_eq!(redact_url("not a url"), "<invalid url>");
    }
}
