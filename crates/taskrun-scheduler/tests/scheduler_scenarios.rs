use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use taskrun_core::config::SchedulerConfig;
use taskrun_scheduler::store::StoreResult;
use taskrun_scheduler::{
    handler_fn, lock_id_for, ErrorCode, MemoryRunStore, NewTaskRun, RetryPolicy, RunStatus,
    RunStore, Scheduler, StoreError, TaskDefinition, TaskHandler, TaskOutcome, TaskRegistry,
    TaskRun, TaskRunUpdate, TaskSchedule,
};

fn at(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 6, hour, minute, 0).unwrap()
}

fn ok_handler() -> Arc<dyn TaskHandler> {
    handler_fn(|_| async { Ok::<_, anyhow::Error>("done".to_string()) })
}

fn failing_handler() -> Arc<dyn TaskHandler> {
    handler_fn(|_| async { Err::<String, _>(anyhow::anyhow!("upstream unavailable")) })
}

/// Fails for the first `failures` calls, then succeeds.
fn flaky_handler(failures: usize) -> Arc<dyn TaskHandler> {
    let calls = Arc::new(AtomicUsize::new(0));
    handler_fn(move |_| {
        let n = calls.fetch_add(1, Ordering::SeqCst);
        async move {
            if n < failures {
                anyhow::bail!("attempt {} failed", n + 1);
            }
            Ok(format!("succeeded on attempt {}", n + 1))
        }
    })
}

fn hourly(name: &str, handler: Arc<dyn TaskHandler>) -> TaskDefinition {
    TaskDefinition::new(name, TaskSchedule::cron("0 * * * *"), handler)
}

fn scheduler(store: &Arc<MemoryRunStore>, tasks: Vec<TaskDefinition>) -> Scheduler {
    scheduler_with(store, tasks, SchedulerConfig::default())
}

fn scheduler_with(
    store: &Arc<MemoryRunStore>,
    tasks: Vec<TaskDefinition>,
    config: SchedulerConfig,
) -> Scheduler {
    let registry = TaskRegistry::new(tasks).unwrap();
    Scheduler::new(registry, Arc::clone(store) as Arc<dyn RunStore>, config)
}

async fn eligible(scheduler: &Scheduler, name: &str) -> bool {
    let task = scheduler.registry().get(name).unwrap();
    scheduler.is_task_eligible(task).await.unwrap()
}

#[tokio::test]
async fn cron_schedule_is_monotonic() {
    let store = Arc::new(MemoryRunStore::starting_at(at(10, 0)));
    let scheduler = scheduler(&store, vec![hourly("send-digest", ok_handler())]);

    let summary = scheduler.run().await;
    assert_eq!((summary.eligible, summary.completed), (1, 1));

    store.set_time(at(10, 30)).unwrap();
    assert!(!eligible(&scheduler, "send-digest").await);
    assert_eq!(scheduler.run().await.eligible, 0);

    store.set_time(at(11, 0)).unwrap();
    assert!(eligible(&scheduler, "send-digest").await);
    scheduler.run().await;

    let runs = store.runs().unwrap();
    assert_eq!(runs.len(), 2);
    assert!(runs.iter().all(|r| r.status == RunStatus::Completed));
}

#[tokio::test]
async fn retry_takes_priority_over_schedule() {
    let store = Arc::new(MemoryRunStore::starting_at(at(10, 0)));
    let task = hourly("sync-ledger", flaky_handler(1)).retry_policy(RetryPolicy::RetryOnFail);
    let scheduler = scheduler(&store, vec![task]);

    scheduler.run().await;
    let failed = store.runs().unwrap().remove(0);
    assert_eq!(failed.status, RunStatus::Failed);
    assert_eq!(failed.error_code, Some(ErrorCode::RetryScheduled));
    assert!(failed
        .error_message
        .as_deref()
        .unwrap()
        .contains("retry scheduled"));

    // not a cron occurrence, but the retry is owed
    store.set_time(at(10, 5)).unwrap();
    assert!(eligible(&scheduler, "sync-ledger").await);
    let summary = scheduler.run().await;
    assert_eq!(summary.completed, 1);

    let retry = store.runs().unwrap().remove(1);
    assert_eq!(retry.status, RunStatus::Completed);
    assert_eq!(retry.retry_of_run_id.as_deref(), Some(failed.id.as_str()));

    store.set_time(at(10, 30)).unwrap();
    assert!(!eligible(&scheduler, "sync-ledger").await);

    store.set_time(at(11, 0)).unwrap();
    assert!(eligible(&scheduler, "sync-ledger").await);
}

#[tokio::test]
async fn retry_window_expires() {
    let store = Arc::new(MemoryRunStore::starting_at(at(10, 0)));
    let task = hourly("sync-ledger", flaky_handler(1)).retry_policy(RetryPolicy::RetryOnFail);
    let scheduler = scheduler(&store, vec![task]);

    scheduler.run().await;
    store.set_time(at(12, 30)).unwrap();
    scheduler.run().await;

    let runs = store.runs().unwrap();
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[1].status, RunStatus::Completed);
    assert_eq!(runs[1].retry_of_run_id, None);
}

#[tokio::test]
async fn ignore_policy_never_retries() {
    let store = Arc::new(MemoryRunStore::starting_at(at(10, 0)));
    let scheduler = scheduler(&store, vec![hourly("ping", failing_handler())]);

    let summary = scheduler.run().await;
    assert_eq!(summary.failed, 1);
    let run = store.runs().unwrap().remove(0);
    assert_eq!(run.error_code, Some(ErrorCode::TaskFailed));
    assert!(run.error_message.unwrap().contains("upstream unavailable"));

    store.set_time(at(10, 5)).unwrap();
    assert!(!eligible(&scheduler, "ping").await);
    store.set_time(at(10, 59)).unwrap();
    assert!(!eligible(&scheduler, "ping").await);
    store.set_time(at(11, 0)).unwrap();
    assert!(eligible(&scheduler, "ping").await);
}

#[tokio::test]
async fn three_passes_fail_fail_succeed() {
    let store = Arc::new(MemoryRunStore::starting_at(at(10, 0)));
    let task = hourly("sync-ledger", flaky_handler(2)).retry_policy(RetryPolicy::RetryOnFail);
    let scheduler = scheduler(&store, vec![task]);

    for (hour, minute) in [(10, 0), (10, 30), (11, 0)] {
        store.set_time(at(hour, minute)).unwrap();
        assert_eq!(scheduler.run().await.eligible, 1, "pass at {hour}:{minute:02}");
    }

    let runs = store.runs().unwrap();
    let states: Vec<_> = runs.iter().map(|r| (r.status, r.error_code)).collect();
    assert_eq!(
        states,
        [
            (RunStatus::Failed, Some(ErrorCode::RetryScheduled)),
            (RunStatus::Failed, Some(ErrorCode::RetryScheduled)),
            (RunStatus::Completed, None),
        ]
    );
    assert_eq!(runs[1].retry_of_run_id.as_deref(), Some(runs[0].id.as_str()));
    assert_eq!(runs[2].retry_of_run_id.as_deref(), Some(runs[1].id.as_str()));
}

#[tokio::test]
async fn retry_cap_marks_exhausted() {
    let store = Arc::new(MemoryRunStore::starting_at(at(10, 0)));
    let task = hourly("sync-ledger", failing_handler())
        .retry_policy(RetryPolicy::RetryOnFail)
        .max_retries(1);
    let scheduler = scheduler(&store, vec![task]);

    scheduler.run().await;
    store.set_time(at(10, 5)).unwrap();
    scheduler.run().await;

    let runs = store.runs().unwrap();
    assert_eq!(runs[0].error_code, Some(ErrorCode::RetryScheduled));
    assert_eq!(runs[1].error_code, Some(ErrorCode::RetryExhausted));

    // the first failure already has its retry
    store.set_time(at(10, 10)).unwrap();
    assert!(!eligible(&scheduler, "sync-ledger").await);
}

#[tokio::test]
async fn held_lock_skips_without_a_record() {
    let store = Arc::new(MemoryRunStore::starting_at(at(10, 0)));
    let other_process = store.peer();
    let scheduler = scheduler(&store, vec![hourly("send-digest", ok_handler())]);

    let lock_id = lock_id_for("send-digest");
    assert!(other_process.acquire_task_lock(lock_id).await.unwrap());
    assert!(!store.acquire_task_lock(lock_id).await.unwrap());

    let summary = scheduler.run().await;
    assert_eq!(summary.eligible, 1);
    assert_eq!(summary.lock_skipped, 1);
    assert!(store.runs().unwrap().is_empty());

    // our release must not drop the peer's lock
    store.release_task_lock(lock_id).await.unwrap();
    assert!(store.is_locked(lock_id).unwrap());

    other_process.release_task_lock(lock_id).await.unwrap();
    other_process.release_task_lock(lock_id).await.unwrap();
    assert!(!store.is_locked(lock_id).unwrap());

    let task = scheduler.registry().get("send-digest").unwrap();
    assert_eq!(scheduler.run_task(task).await, TaskOutcome::Completed);
    assert!(!store.is_locked(lock_id).unwrap());
}

#[tokio::test]
async fn duration_follows_the_store_clock() {
    let store = Arc::new(MemoryRunStore::starting_at(at(10, 0)));
    let clock = Arc::new(store.peer());
    let handler = handler_fn(move |_| {
        let clock = Arc::clone(&clock);
        async move {
            clock.advance(Duration::milliseconds(5000))?;
            Ok::<_, anyhow::Error>("slow but fine".to_string())
        }
    });
    let scheduler = scheduler(&store, vec![hourly("render", handler)]);

    scheduler.run().await;
    let run = store.runs().unwrap().remove(0);
    assert_eq!(run.duration_ms, Some(5000));
    assert_eq!(run.completed_at, Some(at(10, 0) + Duration::milliseconds(5000)));
    assert_eq!(run.result_message.as_deref(), Some("slow but fine"));
}

#[tokio::test(start_paused = true)]
async fn timeout_fails_the_run_and_releases_the_lock() {
    let store = Arc::new(MemoryRunStore::starting_at(at(10, 0)));
    let handler = handler_fn(|_| async {
        tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        Ok::<_, anyhow::Error>("too late".to_string())
    });
    let task = hourly("export", handler)
        .timeout_minutes(1)
        .retry_policy(RetryPolicy::RetryOnFail);
    let scheduler = scheduler(&store, vec![task]);

    let summary = scheduler.run().await;
    assert_eq!(summary.failed, 1);

    let run = store.runs().unwrap().remove(0);
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error_code, Some(ErrorCode::RetryScheduled));
    assert!(run.error_message.unwrap().contains("timed out after 1 minute"));
    assert!(!store.is_locked(lock_id_for("export")).unwrap());
}

#[tokio::test]
async fn panicking_handler_is_a_task_failure() {
    let store = Arc::new(MemoryRunStore::starting_at(at(10, 0)));
    let handler = handler_fn(|_| async {
        if true {
            panic!("handler bug");
        }
        Ok::<_, anyhow::Error>(String::new())
    });
    let scheduler = scheduler(&store, vec![hourly("buggy", handler)]);

    assert_eq!(scheduler.run().await.failed, 1);
    let run = store.runs().unwrap().remove(0);
    assert_eq!(run.error_code, Some(ErrorCode::TaskFailed));
    assert!(run.error_message.unwrap().contains("panicked"));
}

#[tokio::test]
async fn running_record_blocks_eligibility() {
    let store = Arc::new(MemoryRunStore::starting_at(at(10, 0)));
    let scheduler = scheduler(&store, vec![hourly("send-digest", ok_handler())]);

    store
        .create_task_run(NewTaskRun {
            task_name: "send-digest".into(),
            status: RunStatus::Running,
            started_at: at(8, 0),
            advisory_lock_id: lock_id_for("send-digest"),
            retry_of_run_id: None,
        })
        .await
        .unwrap();

    assert!(!eligible(&scheduler, "send-digest").await);
    assert_eq!(scheduler.run().await.eligible, 0);
}

#[tokio::test]
async fn disabled_and_kill_switch() {
    let store = Arc::new(MemoryRunStore::starting_at(at(10, 0)));
    let config = SchedulerConfig {
        disabled_tasks: vec!["report".into(), "heartbeat".into()],
        ..Default::default()
    };
    let tasks = vec![
        TaskDefinition::new("paused", TaskSchedule::cron("0 * * * *").disabled(), ok_handler()),
        hourly("report", ok_handler()),
        TaskDefinition::new(
            "heartbeat",
            TaskSchedule::cron("0 * * * *").always_enabled(),
            ok_handler(),
        ),
        TaskDefinition::new(
            "pinned-but-off",
            TaskSchedule::cron("0 * * * *").always_enabled().disabled(),
            ok_handler(),
        ),
    ];
    let scheduler = scheduler_with(&store, tasks, config);

    assert!(!eligible(&scheduler, "paused").await);
    assert!(!eligible(&scheduler, "report").await);
    assert!(eligible(&scheduler, "heartbeat").await);
    assert!(!eligible(&scheduler, "pinned-but-off").await);
}

#[tokio::test]
async fn resolving_an_orphaned_run() {
    let store = Arc::new(MemoryRunStore::starting_at(at(10, 0)));
    let scheduler = scheduler(&store, vec![hourly("send-digest", ok_handler())]);
    let lock_id = lock_id_for("send-digest");

    let orphan = store
        .create_task_run(NewTaskRun {
            task_name: "send-digest".into(),
            status: RunStatus::Running,
            started_at: at(9, 0),
            advisory_lock_id: lock_id,
            retry_of_run_id: None,
        })
        .await
        .unwrap();

    // still executing elsewhere
    let owner = store.peer();
    owner.acquire_task_lock(lock_id).await.unwrap();
    let err = scheduler
        .resolve_orphaned_run(&orphan.id, "host lost")
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::LockAcquisitionFailed);
    owner.release_task_lock(lock_id).await.unwrap();

    let resolved = scheduler
        .resolve_orphaned_run(&orphan.id, "host lost")
        .await
        .unwrap();
    assert_eq!(resolved.status, RunStatus::Failed);
    assert_eq!(resolved.error_code, Some(ErrorCode::TaskFailed));
    assert_eq!(resolved.duration_ms, Some(3_600_000));
    assert!(resolved.error_message.unwrap().contains("host lost"));
    assert!(!store.is_locked(lock_id).unwrap());

    assert!(eligible(&scheduler, "send-digest").await);

    let err = scheduler
        .resolve_orphaned_run("no-such-run", "typo")
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::RunRecordNotFound);
}

/// Memory store that fails every lookup for one task name.
struct BrokenForTask {
    inner: MemoryRunStore,
    broken: &'static str,
}

impl BrokenForTask {
    fn check(&self, task_name: &str) -> StoreResult<()> {
        if task_name == self.broken {
            return Err(StoreError::InvalidRecord(format!("corrupt rows for {task_name}")));
        }
        Ok(())
    }
}

#[async_trait]
impl RunStore for BrokenForTask {
    async fn find_running_task(&self, task_name: &str) -> StoreResult<Option<TaskRun>> {
        self.check(task_name)?;
        self.inner.find_running_task(task_name).await
    }

    async fn create_task_run(&self, run: NewTaskRun) -> StoreResult<TaskRun> {
        self.inner.create_task_run(run).await
    }

    async fn update_task_run(&self, id: &str, update: TaskRunUpdate) -> StoreResult<TaskRun> {
        self.inner.update_task_run(id, update).await
    }

    async fn acquire_task_lock(&self, lock_id: i64) -> StoreResult<bool> {
        self.inner.acquire_task_lock(lock_id).await
    }

    async fn release_task_lock(&self, lock_id: i64) -> StoreResult<()> {
        self.inner.release_task_lock(lock_id).await
    }

    async fn find_retry_task_run(&self, original_run_id: &str) -> StoreResult<Option<TaskRun>> {
        self.inner.find_retry_task_run(original_run_id).await
    }

    async fn get_recent_task_runs(
        &self,
        task_name: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<TaskRun>> {
        self.check(task_name)?;
        self.inner.get_recent_task_runs(task_name, since).await
    }

    async fn get_task_runs(&self, task_name: &str) -> StoreResult<Vec<TaskRun>> {
        self.check(task_name)?;
        self.inner.get_task_runs(task_name).await
    }

    async fn find_task_run(&self, id: &str) -> StoreResult<Option<TaskRun>> {
        self.inner.find_task_run(id).await
    }

    async fn current_time(&self) -> StoreResult<DateTime<Utc>> {
        self.inner.current_time().await
    }
}

#[tokio::test]
async fn eligibility_error_does_not_block_other_tasks() {
    let inner = MemoryRunStore::starting_at(at(10, 0));
    let observer = inner.peer();
    let store = Arc::new(BrokenForTask {
        inner,
        broken: "corrupt",
    });
    let registry = TaskRegistry::new(vec![
        hourly("corrupt", ok_handler()),
        hourly("healthy", ok_handler()),
    ])
    .unwrap();
    let scheduler = Scheduler::new(registry, store, SchedulerConfig::default());

    let task = scheduler.registry().get("corrupt").unwrap();
    let err = scheduler.is_task_eligible(task).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::DatabaseError);

    let summary = scheduler.run().await;
    assert_eq!(summary.evaluated, 2);
    assert_eq!((summary.eligible, summary.completed), (1, 1));

    let runs = observer.runs().unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].task_name, "healthy");
}

/// Memory store whose run-record writes can be made to fail.
struct FailingWrites {
    inner: MemoryRunStore,
    fail_create: bool,
    fail_update: bool,
}

impl FailingWrites {
    fn write_error(op: &str) -> StoreError {
        StoreError::InvalidRecord(format!("disk full during {op}"))
    }
}

#[async_trait]
impl RunStore for FailingWrites {
    async fn find_running_task(&self, task_name: &str) -> StoreResult<Option<TaskRun>> {
        self.inner.find_running_task(task_name).await
    }

    async fn create_task_run(&self, run: NewTaskRun) -> StoreResult<TaskRun> {
        if self.fail_create {
            return Err(Self::write_error("insert"));
        }
        self.inner.create_task_run(run).await
    }

    async fn update_task_run(&self, id: &str, update: TaskRunUpdate) -> StoreResult<TaskRun> {
        if self.fail_update {
            return Err(Self::write_error("update"));
        }
        self.inner.update_task_run(id, update).await
    }

    async fn acquire_task_lock(&self, lock_id: i64) -> StoreResult<bool> {
        self.inner.acquire_task_lock(lock_id).await
    }

    async fn release_task_lock(&self, lock_id: i64) -> StoreResult<()> {
        self.inner.release_task_lock(lock_id).await
    }

    async fn find_retry_task_run(&self, original_run_id: &str) -> StoreResult<Option<TaskRun>> {
        self.inner.find_retry_task_run(original_run_id).await
    }

    async fn get_recent_task_runs(
        &self,
        task_name: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<TaskRun>> {
        self.inner.get_recent_task_runs(task_name, since).await
    }

    async fn get_task_runs(&self, task_name: &str) -> StoreResult<Vec<TaskRun>> {
        self.inner.get_task_runs(task_name).await
    }

    async fn find_task_run(&self, id: &str) -> StoreResult<Option<TaskRun>> {
        self.inner.find_task_run(id).await
    }

    async fn current_time(&self) -> StoreResult<DateTime<Utc>> {
        self.inner.current_time().await
    }
}

/// Run `send-digest` once against a store with the given write failures.
/// Returns the outcome and a handle that observes the shared state.
async fn run_with_failing_writes(
    fail_create: bool,
    fail_update: bool,
) -> (TaskOutcome, MemoryRunStore) {
    let inner = MemoryRunStore::starting_at(at(10, 0));
    let observer = inner.peer();
    let store = Arc::new(FailingWrites {
        inner,
        fail_create,
        fail_update,
    });
    let registry = TaskRegistry::new(vec![hourly("send-digest", ok_handler())]).unwrap();
    let scheduler = Scheduler::new(registry, store, SchedulerConfig::default());

    let task = scheduler.registry().get("send-digest").unwrap();
    (scheduler.run_task(task).await, observer)
}

#[tokio::test]
async fn lock_released_when_run_creation_fails() {
    let (outcome, observer) = run_with_failing_writes(true, false).await;

    assert_eq!(outcome, TaskOutcome::Failed(ErrorCode::DatabaseError));
    assert!(!observer.is_locked(lock_id_for("send-digest")).unwrap());
    assert!(observer.runs().unwrap().is_empty());
}

#[tokio::test]
async fn lock_released_when_status_update_fails() {
    let (outcome, observer) = run_with_failing_writes(false, true).await;

    assert_eq!(outcome, TaskOutcome::Failed(ErrorCode::DatabaseError));
    assert!(!observer.is_locked(lock_id_for("send-digest")).unwrap());

    // the record stays RUNNING until resolved by hand
    let runs = observer.runs().unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Running);
}
