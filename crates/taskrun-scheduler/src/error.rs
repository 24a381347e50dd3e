use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable error kinds persisted in `task_runs.error_code` and printed in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    TaskTimeout,
    /// Terminal failure under the `ignore` policy.
    TaskFailed,
    /// Failure under `retry-on-fail`; picked up again by the next pass.
    RetryScheduled,
    LockAcquisitionFailed,
    DatabaseError,
    TaskNotFound,
    /// Retry chain hit the task's `max_retries` cap.
    RetryExhausted,
    RunRecordNotFound,
    InvalidTaskDefinition,
    InvalidSchedule,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::TaskTimeout => "TASK_TIMEOUT",
            ErrorCode::TaskFailed => "TASK_FAILED",
            ErrorCode::RetryScheduled => "RETRY_SCHEDULED",
            ErrorCode::LockAcquisitionFailed => "LOCK_ACQUISITION_FAILED",
            ErrorCode::DatabaseError => "DATABASE_ERROR",
            ErrorCode::TaskNotFound => "TASK_NOT_FOUND",
            ErrorCode::RetryExhausted => "RETRY_EXHAUSTED",
            ErrorCode::RunRecordNotFound => "RUN_RECORD_NOT_FOUND",
            ErrorCode::InvalidTaskDefinition => "INVALID_TASK_DEFINITION",
            ErrorCode::InvalidSchedule => "INVALID_SCHEDULE",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for ErrorCode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "TASK_TIMEOUT" => ErrorCode::TaskTimeout,
            "TASK_FAILED" => ErrorCode::TaskFailed,
            "RETRY_SCHEDULED" => ErrorCode::RetryScheduled,
            "LOCK_ACQUISITION_FAILED" => ErrorCode::LockAcquisitionFailed,
            "DATABASE_ERROR" => ErrorCode::DatabaseError,
            "TASK_NOT_FOUND" => ErrorCode::TaskNotFound,
            "RETRY_EXHAUSTED" => ErrorCode::RetryExhausted,
            "RUN_RECORD_NOT_FOUND" => ErrorCode::RunRecordNotFound,
            "INVALID_TASK_DEFINITION" => ErrorCode::InvalidTaskDefinition,
            "INVALID_SCHEDULE" => ErrorCode::InvalidSchedule,
            other => return Err(format!("unknown error code: {other}")),
        })
    }
}

/// Errors raised by a [`RunStore`](crate::store::RunStore) adapter.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// No run with the given ID exists in the store.
    #[error("Run record not found: {id}")]
    RunNotFound { id: String },

    /// A stored row could not be mapped back into a `TaskRun`.
    #[error("Invalid run record: {0}")]
    InvalidRecord(String),

    /// A thread panicked while holding the store's connection or state.
    #[error("Store state poisoned")]
    Poisoned,
}

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Task {task} timed out after {minutes} minute(s)")]
    Timeout { task: String, minutes: u8 },

    #[error("Task {task} failed: {message}")]
    TaskFailed { task: String, message: String },

    #[error("Lock {lock_id} for task {task} is held by another invocation")]
    LockAcquisitionFailed { task: String, lock_id: i64 },

    #[error("Task not found: {name}")]
    TaskNotFound { name: String },

    #[error("Run record not found: {id}")]
    RunRecordNotFound { id: String },

    #[error("Invalid task definition for {task}: {reason}")]
    InvalidTaskDefinition { task: String, reason: String },

    #[error("Invalid schedule for {task}: {reason}")]
    InvalidSchedule { task: String, reason: String },

    #[error("Store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for SchedulerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::RunNotFound { id } => SchedulerError::RunRecordNotFound { id },
            other => SchedulerError::Store(other),
        }
    }
}

impl SchedulerError {
    /// Error kind recorded against a run or logged for the failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            SchedulerError::Timeout { .. } => ErrorCode::TaskTimeout,
            SchedulerError::TaskFailed { .. } => ErrorCode::TaskFailed,
            SchedulerError::LockAcquisitionFailed { .. } => ErrorCode::LockAcquisitionFailed,
            SchedulerError::TaskNotFound { .. } => ErrorCode::TaskNotFound,
            SchedulerError::RunRecordNotFound { .. } => ErrorCode::RunRecordNotFound,
            SchedulerError::InvalidTaskDefinition { .. } => ErrorCode::InvalidTaskDefinition,
            SchedulerError::InvalidSchedule { .. } => ErrorCode::InvalidSchedule,
            SchedulerError::Store(_) => ErrorCode::DatabaseError,
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
