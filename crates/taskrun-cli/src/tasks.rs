//! Built-in maintenance tasks that keep the run database itself healthy.

use std::sync::Arc;

use chrono::Duration;
use taskrun_core::config::MaintenanceConfig;
use taskrun_scheduler::{handler_fn, RetryPolicy, SqliteRunStore, TaskDefinition, TaskSchedule};
use tracing::info;

pub const PRUNE_TASK_RUNS: &str = "prune-task-runs";
pub const OPTIMIZE_DATABASE: &str = "optimize-database";

/// Every task this binary registers, in the order a pass evaluates them.
pub fn builtin_tasks(
    store: Arc<SqliteRunStore>,
    maintenance: &MaintenanceConfig,
) -> Vec<TaskDefinition> {
    vec![
        prune_task_runs(Arc::clone(&store), maintenance.retention_days),
        optimize_database(store),
    ]
}

/// Daily at 03:30 UTC: drop finished runs past the retention period.
fn prune_task_runs(store: Arc<SqliteRunStore>, retention_days: u32) -> TaskDefinition {
    let handler = handler_fn(move |ctx| {
        let store = Arc::clone(&store);
        async move {
            let cutoff = ctx.started_at - Duration::days(i64::from(retention_days));
            let removed = store.prune_runs(cutoff)?;
            info!(removed, %cutoff, "old task runs pruned");
            Ok::<_, anyhow::Error>(format!("pruned {removed} run(s) started before {cutoff}"))
        }
    });

    TaskDefinition::new(PRUNE_TASK_RUNS, TaskSchedule::cron("30 3 * * *"), handler)
        .timeout_minutes(5)
        .retry_policy(RetryPolicy::Ignore)
}

/// Sundays at 04:00 UTC: refresh planner statistics and compact the file.
fn optimize_database(store: Arc<SqliteRunStore>) -> TaskDefinition {
    let handler = handler_fn(move |_ctx| {
        let store = Arc::clone(&store);
        async move {
            store.optimize()?;
            Ok::<_, anyhow::Error>("database optimized".to_string())
        }
    });

    TaskDefinition::new(OPTIMIZE_DATABASE, TaskSchedule::cron("0 4 * * 0"), handler)
        .timeout_minutes(9)
        .retry_policy(RetryPolicy::RetryOnFail)
        .max_retries(3)
}
