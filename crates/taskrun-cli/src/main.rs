use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use taskrun_core::config::TaskrunConfig;
use taskrun_scheduler::{RunStore, Scheduler, SqliteRunStore, TaskRegistry};
use tracing::info;

mod tasks;

#[derive(Parser)]
#[command(name = "taskrun", version, about = "Cron-driven task runner")]
struct Cli {
    /// Config file (falls back to TASKRUN_CONFIG, then ~/.taskrun/taskrun.toml)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Perform one scheduler pass over every registered task.
    Run,
    /// List registered tasks with their lock ids and next occurrence.
    Tasks,
    /// List recorded runs, newest first.
    Runs {
        #[arg(long)]
        task: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Mark an orphaned RUNNING record as failed.
    Resolve {
        run_id: String,
        #[arg(long, default_value = "resolved by operator")]
        message: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "taskrun=info,taskrun_scheduler=info".into()),
        )
        .init();

    let cli = Cli::parse();

    // explicit --config > TASKRUN_CONFIG env > ~/.taskrun/taskrun.toml
    let config_path = cli.config.or_else(|| std::env::var("TASKRUN_CONFIG").ok());
    let config = TaskrunConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        tracing::warn!(code = e.code(), "Config load failed ({}), using defaults", e);
        TaskrunConfig::default()
    });
    config.validate()?;

    let db_path = &config.database.path;
    config.ensure_data_dir()?;
    info!(path = %db_path, "opening SQLite database");

    let db = rusqlite::Connection::open(db_path)?;
    db.execute_batch("PRAGMA journal_mode=WAL;")?;
    let store = Arc::new(
        SqliteRunStore::new(db)?.with_stale_lock_after(config.scheduler.stale_lock_after()),
    );

    // a malformed built-in definition stops the process here
    let registry = TaskRegistry::new(tasks::builtin_tasks(
        Arc::clone(&store),
        &config.maintenance,
    ))?;
    let scheduler = Scheduler::new(
        registry,
        Arc::clone(&store) as Arc<dyn RunStore>,
        config.scheduler.clone(),
    );

    match cli.command {
        Command::Run => {
            let summary = scheduler.run().await;
            info!(
                evaluated = summary.evaluated,
                eligible = summary.eligible,
                completed = summary.completed,
                failed = summary.failed,
                lock_skipped = summary.lock_skipped,
                "pass complete"
            );
        }
        Command::Tasks => print_tasks(&scheduler),
        Command::Runs { task, limit } => {
            for run in store.list_runs(task.as_deref(), limit)? {
                let outcome = run
                    .error_code
                    .map(|c| c.to_string())
                    .or(run.result_message)
                    .unwrap_or_default();
                println!(
                    "{}  {:<20} {:<9} {}  {:>8}  {}",
                    run.id,
                    run.task_name,
                    run.status,
                    run.started_at.format("%Y-%m-%d %H:%M:%S"),
                    run.duration_ms
                        .map(|ms| format!("{ms}ms"))
                        .unwrap_or_else(|| "-".to_string()),
                    outcome,
                );
            }
        }
        Command::Resolve { run_id, message } => {
            let run = scheduler.resolve_orphaned_run(&run_id, &message).await?;
            println!("{} {} {}", run.id, run.task_name, run.status);
        }
    }

    Ok(())
}

fn print_tasks(scheduler: &Scheduler) {
    let now = Utc::now();
    for task in scheduler.registry().iter() {
        let def = &task.definition;
        let next = task
            .cron
            .next_after(now)
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "{:<20} {:<14} {:<12} {:<13} {}m  lock={}  next={}",
            def.name,
            task.cron.expression(),
            task.cron.timezone(),
            def.retry_policy,
            def.timeout_minutes,
            task.lock_id,
            next,
        );
    }
}
