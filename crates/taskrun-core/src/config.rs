use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const DEFAULT_RETRY_WINDOW_MINUTES: u32 = 60;
pub const DEFAULT_STALE_LOCK_MINUTES: u32 = 60;
pub const DEFAULT_RETENTION_DAYS: u32 = 30;
/// Longest time limit a task may be given.
pub const MAX_TASK_TIMEOUT_MINUTES: u8 = 9;

/// Top-level config (taskrun.toml + TASKRUN_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskrunConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Knobs for the scheduling engine itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// How far back a `RETRY_SCHEDULED` failure still claims the next pass.
    #[serde(default = "default_retry_window_minutes")]
    pub retry_window_minutes: u32,
    /// Lock rows older than this are assumed abandoned by a crashed process.
    /// Must exceed [`MAX_TASK_TIMEOUT_MINUTES`].
    #[serde(default = "default_stale_lock_minutes")]
    pub stale_lock_minutes: u32,
    /// Operator kill switch. Tasks marked `always_enabled` ignore it.
    #[serde(default)]
    pub disabled_tasks: Vec<String>,
}

impl SchedulerConfig {
    pub fn retry_window(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.retry_window_minutes))
    }

    pub fn stale_lock_after(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.stale_lock_minutes))
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            retry_window_minutes: DEFAULT_RETRY_WINDOW_MINUTES,
            stale_lock_minutes: DEFAULT_STALE_LOCK_MINUTES,
            disabled_tasks: Vec::new(),
        }
    }
}

/// Settings read by the built-in maintenance tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    /// Finished runs older than this many days are pruned.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            retention_days: DEFAULT_RETENTION_DAYS,
        }
    }
}

fn default_retry_window_minutes() -> u32 {
    DEFAULT_RETRY_WINDOW_MINUTES
}
fn default_stale_lock_minutes() -> u32 {
    DEFAULT_STALE_LOCK_MINUTES
}
fn default_retention_days() -> u32 {
    DEFAULT_RETENTION_DAYS
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.taskrun/taskrun.db", home)
}

impl TaskrunConfig {
    /// Load config from a TOML file with TASKRUN_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g.
    /// `TASKRUN_SCHEDULER__RETRY_WINDOW_MINUTES=30`. A missing file is not an
    /// error; every field has a default.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);
        debug!(path = %path, "loading config");

        Self::figment(&path)
            .extract()
            .map_err(|e| crate::error::TaskrunError::Config(e.to_string()))
    }

    /// Reject settings the scheduler cannot run safely with.
    ///
    /// A stale-lock threshold no longer than the largest task timeout would let
    /// a second process take over the lock of a run that is still executing.
    pub fn validate(&self) -> crate::error::Result<()> {
        let stale = self.scheduler.stale_lock_minutes;
        if stale <= u32::from(MAX_TASK_TIMEOUT_MINUTES) {
            return Err(crate::error::TaskrunError::Config(format!(
                "scheduler.stale_lock_minutes must exceed {MAX_TASK_TIMEOUT_MINUTES}, got {stale}"
            )));
        }
        Ok(())
    }

    /// Create the directory that will hold the run database.
    pub fn ensure_data_dir(&self) -> crate::error::Result<()> {
        if let Some(parent) = std::path::Path::new(&self.database.path).parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    fn figment(path: &str) -> Figment {
        Figment::from(Serialized::defaults(TaskrunConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("TASKRUN_").split("__"))
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.taskrun/taskrun.toml", home)
}
