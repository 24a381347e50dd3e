//! Persistence boundary: run records, the per-task lock and the clock.

mod memory;
mod sqlite;

pub use memory::MemoryRunStore;
pub use sqlite::SqliteRunStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::types::{NewTaskRun, TaskRun, TaskRunUpdate};

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Durable record of task executions plus the mutual-exclusion primitive.
///
/// Implementations must be safe to share between scheduler passes running in
/// the same process; cross-process exclusion comes from the lock methods.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Any run of `task_name` currently in `RUNNING`.
    async fn find_running_task(&self, task_name: &str) -> StoreResult<Option<TaskRun>>;

    async fn create_task_run(&self, run: NewTaskRun) -> StoreResult<TaskRun>;

    /// Apply `update` to run `id`. Fails with `RunNotFound` for unknown ids.
    async fn update_task_run(&self, id: &str, update: TaskRunUpdate) -> StoreResult<TaskRun>;

    /// Try to take the lock without waiting. `false` means another owner holds it.
    async fn acquire_task_lock(&self, lock_id: i64) -> StoreResult<bool>;

    /// Drop the lock if this owner holds it. Never fails for a lock not held.
    async fn release_task_lock(&self, lock_id: i64) -> StoreResult<()>;

    /// The run whose `retry_of_run_id` equals `original_run_id`, if any.
    async fn find_retry_task_run(&self, original_run_id: &str) -> StoreResult<Option<TaskRun>>;

    /// Runs of `task_name` started strictly after `since`, newest first.
    async fn get_recent_task_runs(
        &self,
        task_name: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<TaskRun>>;

    /// Every recorded run of `task_name`, newest first.
    async fn get_task_runs(&self, task_name: &str) -> StoreResult<Vec<TaskRun>>;

    async fn find_task_run(&self, id: &str) -> StoreResult<Option<TaskRun>>;

    /// The clock every scheduling decision is made against.
    async fn current_time(&self) -> StoreResult<DateTime<Utc>>;
}

/// Apply an update in place, leaving `None` fields untouched.
pub(crate) fn apply_update(run: &mut TaskRun, update: TaskRunUpdate) {
    if let Some(status) = update.status {
        run.status = status;
    }
    if update.completed_at.is_some() {
        run.completed_at = update.completed_at;
    }
    if update.duration_ms.is_some() {
        run.duration_ms = update.duration_ms;
    }
    if update.error_message.is_some() {
        run.error_message = update.error_message;
    }
    if update.error_code.is_some() {
        run.error_code = update.error_code;
    }
    if update.result_message.is_some() {
        run.result_message = update.result_message;
    }
}
