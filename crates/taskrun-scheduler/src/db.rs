use rusqlite::Connection;

use crate::error::StoreError;

/// Initialise the run-record schema in `conn`.
///
/// Creates `task_runs` and `task_locks` (idempotent). The composite index on
/// `(task_name, started_at)` serves every eligibility query; the lock table is
/// keyed by the derived lock id so a conditional insert is the try-acquire.
pub fn init_db(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS task_runs (
            id               TEXT    NOT NULL PRIMARY KEY,
            task_name        TEXT    NOT NULL,
            status           TEXT    NOT NULL,   -- RUNNING | COMPLETED | FAILED
            started_at       TEXT    NOT NULL,   -- RFC 3339, millisecond precision, UTC
            completed_at     TEXT,
            duration_ms      INTEGER,
            error_message    TEXT,
            error_code       TEXT,
            result_message   TEXT,
            advisory_lock_id INTEGER NOT NULL,
            retry_of_run_id  TEXT
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_task_runs_task_started
            ON task_runs (task_name, started_at DESC);
        CREATE INDEX IF NOT EXISTS idx_task_runs_retry_of
            ON task_runs (retry_of_run_id);

        CREATE TABLE IF NOT EXISTS task_locks (
            lock_id     INTEGER NOT NULL PRIMARY KEY,
            owner       TEXT    NOT NULL,
            acquired_at TEXT    NOT NULL
        ) STRICT;
        ",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        init_db(&conn).unwrap();
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master
                 WHERE type = 'table' AND name IN ('task_runs', 'task_locks')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 2);
    }
}
