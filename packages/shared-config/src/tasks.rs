//! Scheduled task configuration types
//!
//! Every recurring task can be switched on or off and given its own cron
//! expression through the environment. Cron strings are accepted in the
//! classic five-field form (`min hour dom mon dow`); validation happens when
//! the scheduler builds its entries.

use crate::{get_env_or_default, ConfigError, ConfigResult};
use std::env;

/// Default source for the Nintendo Switch title database
pub const DEFAULT_SWITCH_TITLEDB_URL: &str =
    "https://raw.githubusercontent.com/blawar/titledb/master/US.en.json";

/// Default source for the MAME machine list
pub const DEFAULT_MAME_XML_URL: &str =
    "https://raw.githubusercontent.com/rommapp/romm/master/backend/handler/metadata/fixtures/mame.xml";

/// Enable flag and cron expression for one recurring task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledTaskConfig {
    /// Whether the scheduler should enqueue this task
    pub enabled: bool,

    /// Cron expression driving the schedule
    pub cron: String,
}

impl ScheduledTaskConfig {
    /// Load a task schedule from `ENABLE_SCHEDULED_<NAME>` and `SCHEDULED_<NAME>_CRON`
    pub fn from_env(name: &str, default_cron: &str) -> ConfigResult<Self> {
        let enabled_var = format!("ENABLE_SCHEDULED_{}", name);
        let cron_var = format!("SCHEDULED_{}_CRON", name);

        let cron = get_env_or_default(&cron_var, default_cron);
        if cron.trim().is_empty() {
            return Err(ConfigError::InvalidValue(
                cron_var,
                "cron expression cannot be empty".to_string(),
            ));
        }

        Ok(Self {
            enabled: parse_flag(&enabled_var, false)?,
            cron: cron.trim().to_string(),
        })
    }

    /// Create an enabled schedule (useful for testing)
    pub fn enabled(cron: impl Into<String>) -> Self {
        Self {
            enabled: true,
            cron: cron.into(),
        }
    }

    /// Create a disabled schedule (useful for testing)
    pub fn disabled(cron: impl Into<String>) -> Self {
        Self {
            enabled: false,
            cron: cron.into(),
        }
    }
}

/// Configuration for all built-in recurring tasks
#[derive(Debug, Clone)]
pub struct TasksConfig {
    /// Library rescan
    pub rescan: ScheduledTaskConfig,

    /// Switch title database refresh
    pub switch_titledb: ScheduledTaskConfig,

    /// MAME machine list refresh
    pub mame_xml: ScheduledTaskConfig,

    /// Remote location of the Switch title database
    pub switch_titledb_url: String,

    /// Remote location of the MAME machine list
    pub mame_xml_url: String,
}

impl TasksConfig {
    /// Load task scheduling configuration from environment variables
    pub fn from_env() -> ConfigResult<Self> {
        Ok(Self {
            rescan: ScheduledTaskConfig::from_env("RESCAN", "0 3 * * *")?,
            switch_titledb: ScheduledTaskConfig::from_env("UPDATE_SWITCH_TITLEDB", "0 4 * * *")?,
            mame_xml: ScheduledTaskConfig::from_env("UPDATE_MAME_XML", "0 5 * * *")?,
            switch_titledb_url: get_env_or_default("SWITCH_TITLEDB_URL", DEFAULT_SWITCH_TITLEDB_URL),
            mame_xml_url: get_env_or_default("MAME_XML_URL", DEFAULT_MAME_XML_URL),
        })
    }
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            rescan: ScheduledTaskConfig::disabled("0 3 * * *"),
            switch_titledb: ScheduledTaskConfig::disabled("0 4 * * *"),
            mame_xml: ScheduledTaskConfig::disabled("0 5 * * *"),
            switch_titledb_url: DEFAULT_SWITCH_TITLEDB_URL.to_string(),
            mame_xml_url: DEFAULT_MAME_XML_URL.to_string(),
        }
    }
}

/// Parse a boolean flag, accepting `true/false`, `1/0`, `yes/no` and `on/off`
pub fn parse_flag(name: &str, default: bool) -> ConfigResult<bool> {
    match env::var(name) {
        Ok(val) => match val.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" | "" => Ok(false),
            other => Err(ConfigError::InvalidValue(
                name.to_string(),
                format!("expected a boolean, got '{}'", other),
            )),
        },
        Err(_) => Ok(default),
    }
}
