use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;

/// Lifecycle state of a single execution attempt.
///
/// Only two transitions exist: `Running → Completed` and `Running → Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    /// Lock held, handler executing (or the process died mid-run).
    Running,
    /// Handler returned a result message.
    Completed,
    /// Handler failed or timed out; see `error_code`.
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Completed => "COMPLETED",
            RunStatus::Failed => "FAILED",
        }
    }

    /// Whether the run has reached a final state.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "RUNNING" => Ok(RunStatus::Running),
            "COMPLETED" => Ok(RunStatus::Completed),
            "FAILED" => Ok(RunStatus::Failed),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// What happens after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RetryPolicy {
    /// Re-attempt on the very next pass, ahead of the cron schedule.
    RetryOnFail,
    /// Record the failure and wait for the next cron occurrence.
    Ignore,
}

impl std::fmt::Display for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryPolicy::RetryOnFail => f.pad("retry-on-fail"),
            RetryPolicy::Ignore => f.pad("ignore"),
        }
    }
}

/// When a task is due.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSchedule {
    /// Five-field (`min hour dom mon dow`) or six/seven-field cron expression.
    pub cron: String,
    /// IANA timezone name the expression is evaluated in. `None` means UTC.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    /// When false the task is never scheduled.
    #[serde(default = "bool_true")]
    pub enabled: bool,
    /// Exempts the task from the operator kill switch (`scheduler.disabled_tasks`).
    #[serde(default)]
    pub always_enabled: bool,
}

impl TaskSchedule {
    pub fn cron(expr: impl Into<String>) -> Self {
        Self {
            cron: expr.into(),
            timezone: None,
            enabled: true,
            always_enabled: false,
        }
    }

    pub fn with_timezone(mut self, tz: impl Into<String>) -> Self {
        self.timezone = Some(tz.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn always_enabled(mut self) -> Self {
        self.always_enabled = true;
        self
    }
}

fn bool_true() -> bool {
    true
}

/// A persisted execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRun {
    /// UUID v7 string, primary key.
    pub id: String,
    pub task_name: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    /// Set on the terminal transition.
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub error_message: Option<String>,
    /// Only set when `status == Failed`.
    pub error_code: Option<ErrorCode>,
    /// Only set when `status == Completed`.
    pub result_message: Option<String>,
    /// Lock held while this run executed; identical for every run of a task.
    pub advisory_lock_id: i64,
    /// The `RETRY_SCHEDULED` failure this run is retrying, if any.
    pub retry_of_run_id: Option<String>,
}

impl TaskRun {
    /// True for a failed run that is waiting to be retried on the next pass.
    pub fn is_retry_scheduled(&self) -> bool {
        self.status == RunStatus::Failed && self.error_code == Some(ErrorCode::RetryScheduled)
    }
}

/// Fields supplied when a run record is created.
#[derive(Debug, Clone)]
pub struct NewTaskRun {
    pub task_name: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub advisory_lock_id: i64,
    pub retry_of_run_id: Option<String>,
}

/// Fields written on a status transition. `None` leaves the column untouched.
#[derive(Debug, Clone, Default)]
pub struct TaskRunUpdate {
    pub status: Option<RunStatus>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub error_message: Option<String>,
    pub error_code: Option<ErrorCode>,
    pub result_message: Option<String>,
}

impl TaskRunUpdate {
    pub fn completed(completed_at: DateTime<Utc>, duration_ms: i64, message: String) -> Self {
        Self {
            status: Some(RunStatus::Completed),
            completed_at: Some(completed_at),
            duration_ms: Some(duration_ms),
            result_message: Some(message),
            ..Default::default()
        }
    }

    pub fn failed(
        completed_at: DateTime<Utc>,
        duration_ms: i64,
        code: ErrorCode,
        message: String,
    ) -> Self {
        Self {
            status: Some(RunStatus::Failed),
            completed_at: Some(completed_at),
            duration_ms: Some(duration_ms),
            error_code: Some(code),
            error_message: Some(message),
            ..Default::default()
        }
    }
}

/// Outcome counts for one scheduler pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassSummary {
    /// Tasks in the registry.
    pub evaluated: usize,
    /// Tasks found due at the start of the pass.
    pub eligible: usize,
    pub completed: usize,
    pub failed: usize,
    /// Eligible tasks whose lock was held by another invocation.
    pub lock_skipped: usize,
}
