//! Shared configuration types for romvault services
//!
//! This crate provides common configuration types used by both the worker
//! and scheduler processes, ensuring consistency across the application.

mod database;
mod error;
mod redis;
mod tasks;

pub use database::DatabaseConfig;
pub use error::{ConfigError, ConfigResult};
pub use redis::RedisConfig;
pub use tasks::{
    parse_flag, ScheduledTaskConfig, TasksConfig, DEFAULT_MAME_XML_URL, DEFAULT_SWITCH_TITLEDB_URL,
};

use std::env;
use std::path::PathBuf;

/// Common configuration shared between all services
#[derive(Debug, Clone)]
pub struct CommonConfig {
    /// Database configuration
    pub database: DatabaseConfig,

    /// Redis configuration
    pub redis: RedisConfig,

    /// Path to the ROM library
    pub library_path: PathBuf,

    /// Path where downloaded resources (covers, fixtures, databases) live
    pub resources_path: PathBuf,

    /// Recurring task configuration
    pub tasks: TasksConfig,

    /// Environment mode (development, staging, production)
    pub environment: Environment,

    /// Log level (from RUST_LOG or LOG_LEVEL)
    pub log_level: String,
}

/// Application environment mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    #[default]
    Development,
    Staging,
    Production,
}

impl std::str::FromStr for Environment {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "production" | "prod" => Self::Production,
            "staging" | "stage" => Self::Staging,
            _ => Self::Development,
        })
    }
}

impl Environment {
    /// Check if this is a production environment
    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }

    /// Check if this is a development environment
    pub fn is_development(&self) -> bool {
        matches!(self, Self::Development)
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Development => write!(f, "development"),
            Self::Staging => write!(f, "staging"),
            Self::Production => write!(f, "production"),
        }
    }
}

impl CommonConfig {
    /// Load common configuration from environment variables
    pub fn from_env() -> ConfigResult<Self> {
        Ok(Self {
            database: DatabaseConfig::from_env()?,
            redis: RedisConfig::from_env()?,
            library_path: PathBuf::from(get_env_or_default("ROMVAULT_LIBRARY_PATH", "/romvault/library")),
            resources_path: PathBuf::from(get_env_or_default(
                "ROMVAULT_RESOURCES_PATH",
                "/romvault/resources",
            )),
            tasks: TasksConfig::from_env()?,
            environment: env::var("ENVIRONMENT")
                .unwrap_or_else(|_| "development".to_string())
                .parse()
                .unwrap_or_default(),
            log_level: env::var("RUST_LOG")
                .or_else(|_| env::var("LOG_LEVEL"))
                .unwrap_or_else(|_| "info".to_string()),
        })
    }

    /// Build a configuration rooted at the given directories (useful for testing)
    pub fn for_paths(library_path: impl Into<PathBuf>, resources_path: impl Into<PathBuf>) -> Self {
        Self {
            database: DatabaseConfig::default(),
            redis: RedisConfig::default(),
            library_path: library_path.into(),
            resources_path: resources_path.into(),
            tasks: TasksConfig::default(),
            environment: Environment::Development,
            log_level: "info".to_string(),
        }
    }
}

/// Helper function to get an optional environment variable with a default
pub fn get_env_or_default(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

/// Helper function to parse an environment variable into a specific type
pub fn parse_env<T>(name: &str, default: T) -> ConfigResult<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(val) => val
            .parse()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("{}", e))),
        Err(_) => Ok(default),
    }
}

/// Helper function to parse an optional environment variable
///
/// Unset or empty values yield `None`; anything else must parse.
pub fn parse_optional_env<T>(name: &str) -> ConfigResult<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(val) if val.trim().is_empty() => Ok(None),
        Ok(val) => val
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("{}", e))),
        Err(_) => Ok(None),
    }
}
