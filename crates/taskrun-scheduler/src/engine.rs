use std::sync::Arc;

use taskrun_core::config::SchedulerConfig;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    error::{ErrorCode, Result, SchedulerError},
    registry::{RegisteredTask, TaskRegistry},
    store::RunStore,
    task::TaskContext,
    types::{NewTaskRun, PassSummary, RetryPolicy, RunStatus, TaskRun, TaskRunUpdate},
};

/// How a single eligible task ended within a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Failed(ErrorCode),
    /// Another invocation holds the task's lock; nothing was recorded.
    LockHeld,
}

/// Runs scheduler passes over an immutable registry against a run store.
///
/// A pass evaluates every task once, then executes the eligible ones one at a
/// time. Overlapping passes (other processes, other cron firings) are safe:
/// the store's lock admits a single executor per task.
pub struct Scheduler {
    registry: Arc<TaskRegistry>,
    store: Arc<dyn RunStore>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(registry: TaskRegistry, store: Arc<dyn RunStore>, config: SchedulerConfig) -> Self {
        Self {
            registry: Arc::new(registry),
            store,
            config,
        }
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    /// Perform one full pass. Individual task failures are recorded, never returned.
    pub async fn run(&self) -> PassSummary {
        let mut summary = PassSummary {
            evaluated: self.registry.len(),
            ..Default::default()
        };
        info!(tasks = summary.evaluated, "scheduler pass started");

        // Snapshot eligibility before anything executes.
        let mut eligible = Vec::new();
        for task in self.registry.iter() {
            match self.is_task_eligible(task).await {
                Ok(true) => eligible.push(task),
                Ok(false) => {}
                Err(e) => {
                    warn!(task = %task.name(), code = %e.code(), "eligibility check failed: {e}");
                }
            }
        }
        summary.eligible = eligible.len();

        for task in eligible {
            match self.run_task(task).await {
                TaskOutcome::Completed => summary.completed += 1,
                TaskOutcome::Failed(_) => summary.failed += 1,
                TaskOutcome::LockHeld => summary.lock_skipped += 1,
            }
        }

        info!(
            eligible = summary.eligible,
            completed = summary.completed,
            failed = summary.failed,
            lock_skipped = summary.lock_skipped,
            "scheduler pass finished"
        );
        summary
    }

    /// Decide whether `task` is due in the current pass.
    pub async fn is_task_eligible(&self, task: &RegisteredTask) -> Result<bool> {
        let name = task.name();
        let schedule = &task.definition.schedule;

        if !schedule.enabled {
            debug!(task = %name, "skipped: disabled");
            return Ok(false);
        }
        if !schedule.always_enabled && self.config.disabled_tasks.iter().any(|t| t == name) {
            debug!(task = %name, "skipped: disabled by configuration");
            return Ok(false);
        }

        if let Some(running) = self.store.find_running_task(name).await? {
            debug!(task = %name, run_id = %running.id, "skipped: already running");
            return Ok(false);
        }

        if task.definition.retry_policy == RetryPolicy::RetryOnFail {
            if let Some(failed) = self.latest_retry_scheduled(name).await? {
                return match self.store.find_retry_task_run(&failed.id).await? {
                    None => {
                        info!(task = %name, failed_run = %failed.id, "eligible: retry pending");
                        Ok(true)
                    }
                    Some(retry) => {
                        debug!(
                            task = %name,
                            failed_run = %failed.id,
                            retry_run = %retry.id,
                            "skipped: recent failure already retried"
                        );
                        Ok(false)
                    }
                };
            }
        }

        let runs = self.store.get_task_runs(name).await?;
        let Some(last_started) = runs.iter().map(|r| r.started_at).max() else {
            info!(task = %name, "eligible: first run");
            return Ok(true);
        };

        let now = self.store.current_time().await?;
        let due = task.cron.is_due(last_started, now);
        if due {
            info!(task = %name, last_run = %last_started, "eligible: cron occurrence reached");
        }
        Ok(due)
    }

    /// Execute an eligible task under its lock. The lock is released on every path.
    pub async fn run_task(&self, task: &RegisteredTask) -> TaskOutcome {
        let name = task.name();
        let lock_id = task.lock_id;

        match self.store.acquire_task_lock(lock_id).await {
            Ok(true) => {}
            Ok(false) => {
                let err = SchedulerError::LockAcquisitionFailed {
                    task: name.to_string(),
                    lock_id,
                };
                info!(task = %name, lock_id, code = %err.code(), "{err}");
                return TaskOutcome::LockHeld;
            }
            Err(e) => {
                let err = SchedulerError::from(e);
                error!(task = %name, lock_id, code = %err.code(), "lock acquisition failed: {err}");
                return TaskOutcome::Failed(err.code());
            }
        }
        debug!(task = %name, lock_id, "lock acquired");

        let outcome = match self.execute_locked(task).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(task = %name, code = %e.code(), "task run aborted: {e}");
                TaskOutcome::Failed(e.code())
            }
        };

        if let Err(e) = self.store.release_task_lock(lock_id).await {
            error!(task = %name, lock_id, "lock release failed: {e}");
        } else {
            debug!(task = %name, lock_id, "lock released");
        }
        outcome
    }

    /// Mark an orphaned `RUNNING` record as failed.
    ///
    /// Takes the task's lock first, so a run that is still executing somewhere
    /// cannot be resolved out from under its owner.
    pub async fn resolve_orphaned_run(&self, run_id: &str, reason: &str) -> Result<TaskRun> {
        let run = self
            .store
            .find_task_run(run_id)
            .await?
            .ok_or_else(|| SchedulerError::RunRecordNotFound {
                id: run_id.to_string(),
            })?;
        if run.status != RunStatus::Running {
            warn!(run_id, status = %run.status, "run already finished; nothing to resolve");
            return Ok(run);
        }

        let lock_id = run.advisory_lock_id;
        if !self.store.acquire_task_lock(lock_id).await? {
            return Err(SchedulerError::LockAcquisitionFailed {
                task: run.task_name,
                lock_id,
            });
        }

        let resolved = async {
            let now = self.store.current_time().await?;
            let duration_ms = (now - run.started_at).num_milliseconds();
            let update = TaskRunUpdate::failed(
                now,
                duration_ms,
                ErrorCode::TaskFailed,
                format!("resolved externally: {reason}"),
            );
            Ok::<_, SchedulerError>(self.store.update_task_run(run_id, update).await?)
        }
        .await;

        if let Err(e) = self.store.release_task_lock(lock_id).await {
            error!(task = %run.task_name, lock_id, "lock release failed: {e}");
        }
        let resolved = resolved?;
        info!(task = %resolved.task_name, run_id, "orphaned run resolved");
        Ok(resolved)
    }

    async fn execute_locked(&self, task: &RegisteredTask) -> Result<TaskOutcome> {
        let name = task.name();

        let retry_of_run_id = self.open_retry_slot(name).await?;
        let started_at = self.store.current_time().await?;
        let run = self
            .store
            .create_task_run(NewTaskRun {
                task_name: name.to_string(),
                status: RunStatus::Running,
                started_at,
                advisory_lock_id: task.lock_id,
                retry_of_run_id: retry_of_run_id.clone(),
            })
            .await?;

        let span = info_span!("task_run", task = %name, run_id = %run.id);
        info!(
            parent: &span,
            retry_of = retry_of_run_id.as_deref().unwrap_or("-"),
            timeout_minutes = task.definition.timeout_minutes,
            "task started"
        );

        let ctx = TaskContext {
            task_name: name.to_string(),
            run_id: run.id.clone(),
            retry_of_run_id,
            started_at,
            span: span.clone(),
        };
        let result = self.execute_with_timeout(task, ctx).await;

        let recorded = self.record_outcome(task, &run, result, &span).await;
        if let Err(e) = &recorded {
            warn!(
                parent: &span,
                run_id = %run.id,
                code = %e.code(),
                "run left RUNNING, blocking the task until resolved with `taskrun resolve {}`: {e}",
                run.id
            );
        }
        recorded
    }

    /// Write the attempt's terminal state to its run record.
    async fn record_outcome(
        &self,
        task: &RegisteredTask,
        run: &TaskRun,
        result: Result<String>,
        span: &tracing::Span,
    ) -> Result<TaskOutcome> {
        let completed_at = self.store.current_time().await?;
        let duration_ms = (completed_at - run.started_at).num_milliseconds();

        match result {
            Ok(message) => {
                self.store
                    .update_task_run(
                        &run.id,
                        TaskRunUpdate::completed(completed_at, duration_ms, message),
                    )
                    .await?;
                info!(parent: span, duration_ms, "task completed");
                Ok(TaskOutcome::Completed)
            }
            Err(err) => {
                let (code, message) = self.classify_failure(task, run, &err).await;
                self.store
                    .update_task_run(
                        &run.id,
                        TaskRunUpdate::failed(completed_at, duration_ms, code, message),
                    )
                    .await?;
                warn!(
                    parent: span,
                    duration_ms,
                    cause = %err.code(),
                    code = %code,
                    "task failed: {err}"
                );
                Ok(TaskOutcome::Failed(code))
            }
        }
    }

    /// Race the handler against the task's timeout.
    ///
    /// The handler runs on its own Tokio task. When the timer wins it is left
    /// running in the background; its eventual result is discarded.
    async fn execute_with_timeout(
        &self,
        task: &RegisteredTask,
        ctx: TaskContext,
    ) -> Result<String> {
        let name = task.name().to_string();
        let minutes = task.definition.timeout_minutes;
        let handler = Arc::clone(&task.definition.handler);
        let span = ctx.span.clone();

        let handle = tokio::spawn(async move { handler.run(ctx).await }.instrument(span));
        let limit = std::time::Duration::from_secs(u64::from(minutes) * 60);

        match tokio::time::timeout(limit, handle).await {
            Ok(Ok(Ok(message))) => Ok(message),
            Ok(Ok(Err(e))) => Err(SchedulerError::TaskFailed {
                task: name,
                message: format!("{e:#}"),
            }),
            Ok(Err(join_error)) => Err(SchedulerError::TaskFailed {
                task: name,
                message: format!("handler panicked: {join_error}"),
            }),
            Err(_elapsed) => {
                warn!(task = %name, minutes, "timeout reached; handler left running in background");
                Err(SchedulerError::Timeout {
                    task: name,
                    minutes,
                })
            }
        }
    }

    /// Error code and message recorded for a failed attempt.
    async fn classify_failure(
        &self,
        task: &RegisteredTask,
        run: &TaskRun,
        err: &SchedulerError,
    ) -> (ErrorCode, String) {
        match task.definition.retry_policy {
            RetryPolicy::Ignore => (ErrorCode::TaskFailed, err.to_string()),
            RetryPolicy::RetryOnFail => {
                if let Some(max) = task.definition.max_retries {
                    let depth = self.retry_depth(run, max).await;
                    if depth >= max {
                        return (
                            ErrorCode::RetryExhausted,
                            format!("{err} (giving up after {depth} retries)"),
                        );
                    }
                }
                (
                    ErrorCode::RetryScheduled,
                    format!("{err} (retry scheduled for the next run)"),
                )
            }
        }
    }

    /// Most recent `RETRY_SCHEDULED` failure of `task_name` inside the retry window.
    async fn latest_retry_scheduled(&self, task_name: &str) -> Result<Option<TaskRun>> {
        let now = self.store.current_time().await?;
        let since = now - self.config.retry_window();
        let recent = self.store.get_recent_task_runs(task_name, since).await?;
        Ok(recent
            .into_iter()
            .filter(TaskRun::is_retry_scheduled)
            .max_by_key(|r| r.started_at))
    }

    /// The failure this attempt should be linked to as its retry, if any.
    ///
    /// Re-queried under the lock because time has passed since eligibility. A
    /// failure that already has a retry is not linked a second time.
    async fn open_retry_slot(&self, task_name: &str) -> Result<Option<String>> {
        let Some(failed) = self.latest_retry_scheduled(task_name).await? else {
            return Ok(None);
        };
        if self.store.find_retry_task_run(&failed.id).await?.is_some() {
            return Ok(None);
        }
        Ok(Some(failed.id))
    }

    /// Number of retries in the chain ending at `run`, counted up to `cap`.
    async fn retry_depth(&self, run: &TaskRun, cap: u32) -> u32 {
        let mut depth = 0;
        let mut previous = run.retry_of_run_id.clone();
        while let Some(id) = previous {
            depth += 1;
            if depth >= cap {
                break;
            }
            previous = match self.store.find_task_run(&id).await {
                Ok(Some(prior)) => prior.retry_of_run_id,
                Ok(None) => {
                    let err = SchedulerError::RunRecordNotFound { id };
                    warn!(task = %run.task_name, code = %err.code(), "retry chain broken: {err}");
                    None
                }
                Err(e) => {
                    warn!(task = %run.task_name, "retry chain lookup failed: {e}");
                    None
                }
            };
        }
        depth
    }
}
