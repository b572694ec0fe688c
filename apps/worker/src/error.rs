//! Error handling for the romvault task subsystem
//!
//! This module provides a unified error type hierarchy using thiserror
//! for queueing, scheduling and executing background jobs.

use thiserror::Error;

use crate::queue::{JobId, JobStatus};

/// Main worker error type
#[derive(Error, Debug)]
pub enum WorkerError {
    // ========== Job Processing Errors ==========
    /// Job arguments could not be decoded into the handler's payload type
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Task name does not match any registered task
    #[error("unknown task: {0}")]
    UnknownTask(String),

    /// Task exists but cannot be triggered on demand
    #[error("task '{0}' cannot be run manually")]
    ManualRunNotAllowed(String),

    /// Job id is not known to the broker (never existed or expired)
    #[error("job not found: {0}")]
    JobNotFound(JobId),

    /// Attempted a status change the job state machine forbids
    #[error("invalid job transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    /// Job exceeded the configured execution timeout
    #[error("job timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    /// Handler panicked while running
    #[error("job handler panicked: {0}")]
    HandlerPanicked(String),

    // ========== Broker/Queue Errors ==========
    /// Redis operation failed
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Broker could not be reached at startup
    #[error("broker unavailable at {url}: {reason}")]
    BrokerUnavailable { url: String, reason: String },

    /// Queue operation failed
    #[error("queue error: {0}")]
    Queue(String),

    /// Failed to (de)serialize a job record or event
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    // ========== Scheduling Errors ==========
    /// Cron expression could not be parsed
    #[error("invalid cron expression '{expr}': {message}")]
    InvalidCron { expr: String, message: String },

    // ========== Remote Fetch Errors ==========
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Remote resource could not be fetched and no cached copy exists
    #[error("failed to fetch {url}: {reason}")]
    RemoteFetch { url: String, reason: String },

    // ========== Library Errors ==========
    /// File system access error
    #[error("filesystem error: {0}")]
    Filesystem(#[from] std::io::Error),

    /// Library path not found or inaccessible
    #[error("library path not found: {0}")]
    LibraryNotFound(String),

    /// Database query failed
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    // ========== Configuration Errors ==========
    /// Configuration error
    #[error("configuration error: {0}")]
    Configuration(String),

    // ========== Internal Errors ==========
    /// Internal worker error (catch-all for unexpected errors)
    #[error("internal worker error: {0}")]
    Internal(String),
}

impl WorkerError {
    /// Check if this error should be reported to a caller as a bad request
    /// rather than a server-side failure
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::UnknownTask(_)
                | Self::ManualRunNotAllowed(_)
                | Self::JobNotFound(_)
                | Self::InvalidPayload(_)
        )
    }

    /// Get a severity level for logging
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            // Critical errors that should alert operators
            Self::Configuration(_) | Self::BrokerUnavailable { .. } | Self::InvalidCron { .. } => {
                ErrorSeverity::Critical
            }

            // Errors that indicate service issues
            Self::Redis(_)
            | Self::Queue(_)
            | Self::Database(_)
            | Self::HandlerPanicked(_)
            | Self::InvalidTransition { .. }
            | Self::Internal(_) => ErrorSeverity::Error,

            // Warnings for expected failures
            Self::Timeout { .. } | Self::Http(_) | Self::RemoteFetch { .. } => {
                ErrorSeverity::Warning
            }

            // Info level for normal processing issues
            _ => ErrorSeverity::Info,
        }
    }

    /// Log the error with appropriate severity
    pub fn log(&self) {
        match self.severity() {
            ErrorSeverity::Critical => {
                tracing::error!(error = %self, client_error = self.is_client_error(), "Critical worker error");
            }
            ErrorSeverity::Error => {
                tracing::error!(error = %self, client_error = self.is_client_error(), "Worker error");
            }
            ErrorSeverity::Warning => {
                tracing::warn!(error = %self, client_error = self.is_client_error(), "Worker warning");
            }
            ErrorSeverity::Info => {
                tracing::info!(error = %self, client_error = self.is_client_error(), "Worker info");
            }
        }
    }

    /// Create a remote fetch error
    pub fn remote_fetch(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::RemoteFetch {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid cron error
    pub fn invalid_cron(expr: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidCron {
            expr: expr.into(),
            message: message.into(),
        }
    }
}

/// Error severity levels for logging and alerting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical errors that should trigger alerts
    Critical,
    /// Standard errors
    Error,
    /// Warnings for expected failures
    Warning,
    /// Informational messages
    Info,
}

/// Result type alias for worker operations
pub type WorkerResult<T> = Result<T, WorkerError>;

// ========== Conversion Implementations ==========

impl From<anyhow::Error> for WorkerError {
    fn from(err: anyhow::Error) -> Self {
        // Try to downcast to WorkerError first
        match err.downcast::<WorkerError>() {
            Ok(worker_err) => worker_err,
            Err(err) => Self::Internal(err.to_string()),
        }
    }
}

impl From<romvault_shared_config::ConfigError> for WorkerError {
    fn from(err: romvault_shared_config::ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}

impl From<url::ParseError> for WorkerError {
    fn from(err: url::ParseError) -> Self {
        Self::Configuration(format!("invalid URL: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_errors() {
        assert!(WorkerError::UnknownTask("nope".to_string()).is_client_error());
        assert!(WorkerError::JobNotFound(JobId::new()).is_client_error());
        assert!(WorkerError::ManualRunNotAllowed("scan_library".to_string()).is_client_error());

        assert!(!WorkerError::Queue("down".to_string()).is_client_error());
        assert!(!WorkerError::Timeout { seconds: 30 }.is_client_error());
    }

    #[test]
    fn test_severity_levels() {
        assert_eq!(
            WorkerError::Configuration("test".to_string()).severity(),
            ErrorSeverity::Critical
        );
        assert_eq!(
            WorkerError::BrokerUnavailable {
                url: "redis://localhost".to_string(),
                reason: "refused".to_string()
            }
            .severity(),
            ErrorSeverity::Critical
        );
        assert_eq!(
            WorkerError::Database(sqlx::Error::PoolClosed).severity(),
            ErrorSeverity::Error
        );
        assert_eq!(
            WorkerError::remote_fetch("http://x", "503").severity(),
            ErrorSeverity::Warning
        );
        assert_eq!(
            WorkerError::UnknownTask("x".to_string()).severity(),
            ErrorSeverity::Info
        );
    }

    #[test]
    fn test_error_display() {
        let err = WorkerError::remote_fetch("http://example.com/mame.xml", "HTTP 500");
        assert_eq!(
            err.to_string(),
            "failed to fetch http://example.com/mame.xml: HTTP 500"
        );

        let err = WorkerError::invalid_cron("* *", "too few fields");
        assert_eq!(err.to_string(), "invalid cron expression '* *': too few fields");
    }

    #[test]
    fn test_anyhow_roundtrip_keeps_variant() {
        let err: anyhow::Error = WorkerError::UnknownTask("ghost".to_string()).into();
        let back = WorkerError::from(err);
        assert!(matches!(back, WorkerError::UnknownTask(name) if name == "ghost"));
    }
}
