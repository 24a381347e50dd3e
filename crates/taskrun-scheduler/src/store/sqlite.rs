use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::{RunStore, StoreResult};
use crate::db::init_db;
use crate::error::{ErrorCode, StoreError};
use crate::types::{NewTaskRun, RunStatus, TaskRun, TaskRunUpdate};

const RUN_COLUMNS: &str = "id, task_name, status, started_at, completed_at, duration_ms,
     error_message, error_code, result_message, advisory_lock_id, retry_of_run_id";

/// SQLite-backed run store.
///
/// Every scheduler process opens its own connection to the same database
/// file; the `task_locks` table is the shared mutual-exclusion slot. A lock
/// row older than `stale_lock_after` is treated as left behind by a crashed
/// process and may be taken over.
pub struct SqliteRunStore {
    db: Mutex<Connection>,
    owner: String,
    stale_lock_after: Duration,
}

impl SqliteRunStore {
    /// Wrap `conn`, creating the schema if needed.
    pub fn new(conn: Connection) -> StoreResult<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
            owner: Uuid::new_v4().to_string(),
            stale_lock_after: Duration::minutes(60),
        })
    }

    pub fn with_stale_lock_after(mut self, after: Duration) -> Self {
        self.stale_lock_after = after;
        self
    }

    /// Most recent runs, optionally restricted to one task.
    #[instrument(skip(self))]
    pub fn list_runs(&self, task_name: Option<&str>, limit: usize) -> StoreResult<Vec<TaskRun>> {
        let db = self.conn()?;
        let mut stmt = db.prepare_cached(&format!(
            "SELECT {RUN_COLUMNS} FROM task_runs
             WHERE ?1 IS NULL OR task_name = ?1
             ORDER BY started_at DESC
             LIMIT ?2"
        ))?;
        let rows = stmt.query_map(rusqlite::params![task_name, limit as i64], row_to_run)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Delete finished runs that started before `before`. Returns the count removed.
    ///
    /// `RUNNING` rows are kept so an orphaned run stays visible until resolved.
    /// Each task's newest run is kept too; the cron check measures the next
    /// occurrence from it.
    #[instrument(skip(self))]
    pub fn prune_runs(&self, before: DateTime<Utc>) -> StoreResult<usize> {
        let db = self.conn()?;
        let n = db.execute(
            "DELETE FROM task_runs
             WHERE status != 'RUNNING'
               AND started_at < ?1
               AND started_at < (SELECT MAX(latest.started_at) FROM task_runs AS latest
                                 WHERE latest.task_name = task_runs.task_name)",
            [fmt_ts(before)],
        )?;
        debug!(removed = n, "pruned task runs");
        Ok(n)
    }

    /// Refresh planner statistics and compact the database file.
    #[instrument(skip(self))]
    pub fn optimize(&self) -> StoreResult<()> {
        self.conn()?.execute_batch("PRAGMA optimize; VACUUM;")?;
        Ok(())
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.db.lock().map_err(|_| StoreError::Poisoned)
    }

    fn query_runs<P: rusqlite::Params>(&self, sql: &str, params: P) -> StoreResult<Vec<TaskRun>> {
        let db = self.conn()?;
        let mut stmt = db.prepare_cached(sql)?;
        let rows = stmt.query_map(params, row_to_run)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn query_run<P: rusqlite::Params>(&self, sql: &str, params: P) -> StoreResult<Option<TaskRun>> {
        let db = self.conn()?;
        Ok(db.query_row(sql, params, row_to_run).optional()?)
    }
}

#[async_trait]
impl RunStore for SqliteRunStore {
    #[instrument(skip(self))]
    async fn find_running_task(&self, task_name: &str) -> StoreResult<Option<TaskRun>> {
        self.query_run(
            &format!(
                "SELECT {RUN_COLUMNS} FROM task_runs
                 WHERE task_name = ?1 AND status = 'RUNNING'
                 ORDER BY started_at DESC LIMIT 1"
            ),
            [task_name],
        )
    }

    #[instrument(skip(self, run), fields(task = %run.task_name))]
    async fn create_task_run(&self, run: NewTaskRun) -> StoreResult<TaskRun> {
        let id = Uuid::now_v7().to_string();
        {
            let db = self.conn()?;
            db.execute(
                "INSERT INTO task_runs
                 (id, task_name, status, started_at, advisory_lock_id, retry_of_run_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    id,
                    run.task_name,
                    run.status.as_str(),
                    fmt_ts(run.started_at),
                    run.advisory_lock_id,
                    run.retry_of_run_id,
                ],
            )?;
        }
        self.find_task_run(&id)
            .await?
            .ok_or(StoreError::RunNotFound { id })
    }

    #[instrument(skip(self, update))]
    async fn update_task_run(&self, id: &str, update: TaskRunUpdate) -> StoreResult<TaskRun> {
        let changed = {
            let db = self.conn()?;
            db.execute(
                "UPDATE task_runs SET
                    status         = COALESCE(?2, status),
                    completed_at   = COALESCE(?3, completed_at),
                    duration_ms    = COALESCE(?4, duration_ms),
                    error_message  = COALESCE(?5, error_message),
                    error_code     = COALESCE(?6, error_code),
                    result_message = COALESCE(?7, result_message)
                 WHERE id = ?1",
                rusqlite::params![
                    id,
                    update.status.map(|s| s.as_str()),
                    update.completed_at.map(fmt_ts),
                    update.duration_ms,
                    update.error_message,
                    update.error_code.map(|c| c.as_str()),
                    update.result_message,
                ],
            )?
        };
        if changed == 0 {
            return Err(StoreError::RunNotFound { id: id.to_string() });
        }
        self.find_task_run(id)
            .await?
            .ok_or_else(|| StoreError::RunNotFound { id: id.to_string() })
    }

    #[instrument(skip(self))]
    async fn acquire_task_lock(&self, lock_id: i64) -> StoreResult<bool> {
        let now = Utc::now();
        let db = self.conn()?;

        let broken = db.execute(
            "DELETE FROM task_locks WHERE lock_id = ?1 AND acquired_at < ?2",
            rusqlite::params![lock_id, fmt_ts(now - self.stale_lock_after)],
        )?;
        if broken > 0 {
            warn!(lock_id, "took over stale task lock");
        }

        let inserted = db.execute(
            "INSERT OR IGNORE INTO task_locks (lock_id, owner, acquired_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![lock_id, self.owner, fmt_ts(now)],
        )?;
        Ok(inserted == 1)
    }

    #[instrument(skip(self))]
    async fn release_task_lock(&self, lock_id: i64) -> StoreResult<()> {
        let db = self.conn()?;
        db.execute(
            "DELETE FROM task_locks WHERE lock_id = ?1 AND owner = ?2",
            rusqlite::params![lock_id, self.owner],
        )?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn find_retry_task_run(&self, original_run_id: &str) -> StoreResult<Option<TaskRun>> {
        self.query_run(
            &format!(
                "SELECT {RUN_COLUMNS} FROM task_runs
                 WHERE retry_of_run_id = ?1
                 ORDER BY started_at DESC LIMIT 1"
            ),
            [original_run_id],
        )
    }

    #[instrument(skip(self))]
    async fn get_recent_task_runs(
        &self,
        task_name: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<TaskRun>> {
        self.query_runs(
            &format!(
                "SELECT {RUN_COLUMNS} FROM task_runs
                 WHERE task_name = ?1 AND started_at > ?2
                 ORDER BY started_at DESC"
            ),
            rusqlite::params![task_name, fmt_ts(since)],
        )
    }

    #[instrument(skip(self))]
    async fn get_task_runs(&self, task_name: &str) -> StoreResult<Vec<TaskRun>> {
        self.query_runs(
            &format!(
                "SELECT {RUN_COLUMNS} FROM task_runs
                 WHERE task_name = ?1
                 ORDER BY started_at DESC"
            ),
            [task_name],
        )
    }

    async fn find_task_run(&self, id: &str) -> StoreResult<Option<TaskRun>> {
        self.query_run(
            &format!("SELECT {RUN_COLUMNS} FROM task_runs WHERE id = ?1"),
            [id],
        )
    }

    async fn current_time(&self) -> StoreResult<DateTime<Utc>> {
        Ok(Utc::now())
    }
}

/// Fixed-width UTC timestamps so lexical order in SQLite is chronological order.
fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, format!("bad timestamp {raw:?}: {e}")))
}

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, msg.into())
}

/// Map a SQLite row (selected with `RUN_COLUMNS`) to a `TaskRun`.
fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRun> {
    let status: String = row.get(2)?;
    let started_at: String = row.get(3)?;
    let completed_at: Option<String> = row.get(4)?;
    let error_code: Option<String> = row.get(7)?;

    Ok(TaskRun {
        id: row.get(0)?,
        task_name: row.get(1)?,
        status: status
            .parse::<RunStatus>()
            .map_err(|e| conversion_error(2, e))?,
        started_at: parse_ts(3, &started_at)?,
        completed_at: completed_at.as_deref().map(|s| parse_ts(4, s)).transpose()?,
        duration_ms: row.get(5)?,
        error_message: row.get(6)?,
        error_code: error_code
            .as_deref()
            .map(|s| s.parse::<ErrorCode>().map_err(|e| conversion_error(7, e)))
            .transpose()?,
        result_message: row.get(8)?,
        advisory_lock_id: row.get(9)?,
        retry_of_run_id: row.get(10)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn store() -> SqliteRunStore {
        SqliteRunStore::new(Connection::open_in_memory().unwrap()).unwrap()
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, m, 0).unwrap()
    }

    fn running(name: &str, started_at: DateTime<Utc>, retry_of: Option<String>) -> NewTaskRun {
        NewTaskRun {
            task_name: name.to_string(),
            status: RunStatus::Running,
            started_at,
            advisory_lock_id: 1234,
            retry_of_run_id: retry_of,
        }
    }

    #[tokio::test]
    async fn create_then_complete() {
        let store = store();
        let run = store.create_task_run(running("digest", at(10, 0), None)).await.unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.advisory_lock_id, 1234);
        assert!(store.find_running_task("digest").await.unwrap().is_some());

        let done = store
            .update_task_run(
                &run.id,
                TaskRunUpdate::completed(at(10, 1), 60_000, "sent 3 emails".into()),
            )
            .await
            .unwrap();
        assert_eq!(done.status, RunStatus::Completed);
        assert_eq!(done.completed_at, Some(at(10, 1)));
        assert_eq!(done.duration_ms, Some(60_000));
        assert_eq!(done.result_message.as_deref(), Some("sent 3 emails"));
        assert_eq!(done.error_code, None);
        assert!(store.find_running_task("digest").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failure_code_roundtrips() {
        let store = store();
        let run = store.create_task_run(running("billing", at(10, 0), None)).await.unwrap();
        let failed = store
            .update_task_run(
                &run.id,
                TaskRunUpdate::failed(at(10, 0), 5, ErrorCode::RetryScheduled, "boom".into()),
            )
            .await
            .unwrap();
        assert!(failed.is_retry_scheduled());
    }

    #[tokio::test]
    async fn retry_lookup_follows_back_reference() {
        let store = store();
        let first = store.create_task_run(running("billing", at(10, 0), None)).await.unwrap();
        assert!(store.find_retry_task_run(&first.id).await.unwrap().is_none());

        let retry = store
            .create_task_run(running("billing", at(10, 5), Some(first.id.clone())))
            .await
            .unwrap();
        let found = store.find_retry_task_run(&first.id).await.unwrap().unwrap();
        assert_eq!(found.id, retry.id);
    }

    #[tokio::test]
    async fn recent_runs_are_windowed_and_ordered() {
        let store = store();
        for m in [0, 20, 40] {
            store.create_task_run(running("t", at(10, m), None)).await.unwrap();
        }
        let recent = store.get_recent_task_runs("t", at(10, 0)).await.unwrap();
        let starts: Vec<_> = recent.iter().map(|r| r.started_at).collect();
        assert_eq!(starts, vec![at(10, 40), at(10, 20)]);
        assert_eq!(store.get_task_runs("t").await.unwrap().len(), 3);
        assert!(store.get_task_runs("other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_unknown_run_is_not_found() {
        let err = store()
            .update_task_run("nope", TaskRunUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::RunNotFound { .. }));
    }

    #[tokio::test]
    async fn lock_is_exclusive_between_connections() {
        let dir = std::env::temp_dir().join(format!("taskrun-lock-{}.db", Uuid::new_v4()));
        let a = SqliteRunStore::new(Connection::open(&dir).unwrap()).unwrap();
        let b = SqliteRunStore::new(Connection::open(&dir).unwrap()).unwrap();

        assert!(a.acquire_task_lock(77).await.unwrap());
        assert!(!b.acquire_task_lock(77).await.unwrap());

        // b does not own the lock, so its release changes nothing
        b.release_task_lock(77).await.unwrap();
        assert!(!b.acquire_task_lock(77).await.unwrap());

        a.release_task_lock(77).await.unwrap();
        assert!(b.acquire_task_lock(77).await.unwrap());
        b.release_task_lock(77).await.unwrap();

        drop(a);
        drop(b);
        let _ = std::fs::remove_file(&dir);
    }

    #[tokio::test]
    async fn stale_lock_is_taken_over() {
        let store = store().with_stale_lock_after(Duration::minutes(60));
        {
            let db = store.conn().unwrap();
            db.execute(
                "INSERT INTO task_locks (lock_id, owner, acquired_at) VALUES (5, 'dead', ?1)",
                [fmt_ts(Utc::now() - Duration::hours(2))],
            )
            .unwrap();
        }
        assert!(store.acquire_task_lock(5).await.unwrap());
    }

    #[tokio::test]
    async fn prune_keeps_running_rows() {
        let store = store();
        let old = store.create_task_run(running("t", at(1, 0), None)).await.unwrap();
        store
            .update_task_run(&old.id, TaskRunUpdate::completed(at(1, 1), 1, "ok".into()))
            .await
            .unwrap();
        store.create_task_run(running("t", at(2, 0), None)).await.unwrap();

        let removed = store.prune_runs(at(12, 0)).unwrap();
        assert_eq!(removed, 1);
        let left = store.list_runs(Some("t"), 10).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].status, RunStatus::Running);
        store.optimize().unwrap();
    }

    #[tokio::test]
    async fn prune_keeps_each_tasks_newest_run() {
        let store = store();
        for (name, hour) in [("yearly", 1), ("daily", 1), ("daily", 2)] {
            let run = store.create_task_run(running(name, at(hour, 0), None)).await.unwrap();
            store
                .update_task_run(&run.id, TaskRunUpdate::completed(at(hour, 1), 1, "ok".into()))
                .await
                .unwrap();
        }

        assert_eq!(store.prune_runs(at(12, 0)).unwrap(), 1);

        let yearly = store.get_task_runs("yearly").await.unwrap();
        assert_eq!(yearly.len(), 1);
        assert_eq!(yearly[0].started_at, at(1, 0));
        let daily = store.get_task_runs("daily").await.unwrap();
        assert_eq!(daily.len(), 1);
        assert_eq!(daily[0].started_at, at(2, 0));
    }
}
