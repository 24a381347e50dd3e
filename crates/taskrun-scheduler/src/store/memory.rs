use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use super::{apply_update, RunStore, StoreResult};
use crate::error::StoreError;
use crate::types::{NewTaskRun, RunStatus, TaskRun, TaskRunUpdate};

struct MemoryState {
    runs: Vec<TaskRun>,
    /// lock id → owner token
    locks: HashMap<i64, String>,
    now: DateTime<Utc>,
}

/// In-process run store with a lock registry and a manual clock.
///
/// The clock stands still until [`set_time`](Self::set_time) or
/// [`advance`](Self::advance) moves it. [`peer`](Self::peer) hands out another
/// handle over the same state with its own lock owner, which is how tests
/// stand in for a second scheduler process.
pub struct MemoryRunStore {
    state: Arc<Mutex<MemoryState>>,
    owner: String,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    pub fn starting_at(now: DateTime<Utc>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                runs: Vec::new(),
                locks: HashMap::new(),
                now,
            })),
            owner: Uuid::new_v4().to_string(),
        }
    }

    /// Another handle over the same runs, locks and clock, with a distinct owner.
    pub fn peer(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            owner: Uuid::new_v4().to_string(),
        }
    }

    pub fn set_time(&self, now: DateTime<Utc>) -> StoreResult<()> {
        self.state()?.now = now;
        Ok(())
    }

    pub fn advance(&self, by: Duration) -> StoreResult<()> {
        let mut state = self.state()?;
        state.now += by;
        Ok(())
    }

    /// All runs in insertion order.
    pub fn runs(&self) -> StoreResult<Vec<TaskRun>> {
        Ok(self.state()?.runs.clone())
    }

    /// Whether any owner currently holds `lock_id`.
    pub fn is_locked(&self, lock_id: i64) -> StoreResult<bool> {
        Ok(self.state()?.locks.contains_key(&lock_id))
    }

    fn state(&self) -> StoreResult<MutexGuard<'_, MemoryState>> {
        self.state.lock().map_err(|_| StoreError::Poisoned)
    }

    fn newest_first<'a>(runs: impl DoubleEndedIterator<Item = &'a TaskRun>) -> Vec<TaskRun> {
        // reversed insertion order makes the later insert win ties after the stable sort
        let mut out: Vec<TaskRun> = runs.rev().cloned().collect();
        out.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        out
    }
}

impl Default for MemoryRunStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn find_running_task(&self, task_name: &str) -> StoreResult<Option<TaskRun>> {
        Ok(self
            .state()?
            .runs
            .iter()
            .find(|r| r.task_name == task_name && r.status == RunStatus::Running)
            .cloned())
    }

    async fn create_task_run(&self, run: NewTaskRun) -> StoreResult<TaskRun> {
        let record = TaskRun {
            id: Uuid::now_v7().to_string(),
            task_name: run.task_name,
            status: run.status,
            started_at: run.started_at,
            completed_at: None,
            duration_ms: None,
            error_message: None,
            error_code: None,
            result_message: None,
            advisory_lock_id: run.advisory_lock_id,
            retry_of_run_id: run.retry_of_run_id,
        };
        self.state()?.runs.push(record.clone());
        Ok(record)
    }

    async fn update_task_run(&self, id: &str, update: TaskRunUpdate) -> StoreResult<TaskRun> {
        let mut state = self.state()?;
        let run = state
            .runs
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| StoreError::RunNotFound { id: id.to_string() })?;
        apply_update(run, update);
        Ok(run.clone())
    }

    async fn acquire_task_lock(&self, lock_id: i64) -> StoreResult<bool> {
        let mut state = self.state()?;
        if state.locks.contains_key(&lock_id) {
            return Ok(false);
        }
        state.locks.insert(lock_id, self.owner.clone());
        Ok(true)
    }

    async fn release_task_lock(&self, lock_id: i64) -> StoreResult<()> {
        let mut state = self.state()?;
        if state.locks.get(&lock_id) == Some(&self.owner) {
            state.locks.remove(&lock_id);
        }
        Ok(())
    }

    async fn find_retry_task_run(&self, original_run_id: &str) -> StoreResult<Option<TaskRun>> {
        Ok(self
            .state()?
            .runs
            .iter()
            .find(|r| r.retry_of_run_id.as_deref() == Some(original_run_id))
            .cloned())
    }

    async fn get_recent_task_runs(
        &self,
        task_name: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<TaskRun>> {
        let state = self.state()?;
        Ok(Self::newest_first(
            state
                .runs
                .iter()
                .filter(|r| r.task_name == task_name && r.started_at > since),
        ))
    }

    async fn get_task_runs(&self, task_name: &str) -> StoreResult<Vec<TaskRun>> {
        let state = self.state()?;
        Ok(Self::newest_first(
            state.runs.iter().filter(|r| r.task_name == task_name),
        ))
    }

    async fn find_task_run(&self, id: &str) -> StoreResult<Option<TaskRun>> {
        Ok(self.state()?.runs.iter().find(|r| r.id == id).cloned())
    }

    async fn current_time(&self) -> StoreResult<DateTime<Utc>> {
        Ok(self.state()?.now)
    }
}
