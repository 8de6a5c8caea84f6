//! SQLite schema. Timestamps are integer milliseconds since the Unix epoch.

use rusqlite::Connection;

use crate::error::StoreError;

pub(crate) const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tasks (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    task_type     TEXT    NOT NULL,
    parameters    TEXT    NOT NULL,
    priority      INTEGER NOT NULL DEFAULT 0,
    status        TEXT    NOT NULL DEFAULT 'queued'
                  CHECK (status IN ('queued', 'claimed', 'running', 'completed', 'failed', 'cancelled')),
    retry_count   INTEGER NOT NULL DEFAULT 0,
    max_retries   INTEGER NOT NULL DEFAULT 3,
    run_after     INTEGER,
    created_at    INTEGER NOT NULL,
    claimed_at    INTEGER,
    completed_at  INTEGER,
    claimed_by    TEXT,
    error_message TEXT,
    result_data   TEXT
);

CREATE INDEX IF NOT EXISTS idx_tasks_claim ON tasks (status, priority, created_at);

CREATE TABLE IF NOT EXISTS task_logs (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id    INTEGER NOT NULL REFERENCES tasks (id),
    event      TEXT    NOT NULL,
    worker_id  TEXT,
    message    TEXT,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_task_logs_task ON task_logs (task_id, id);

CREATE TABLE IF NOT EXISTS worker_heartbeats (
    worker_id       TEXT    PRIMARY KEY,
    last_heartbeat  INTEGER NOT NULL,
    tasks_processed INTEGER NOT NULL DEFAULT 0,
    tasks_failed    INTEGER NOT NULL DEFAULT 0,
    current_task_id INTEGER,
    strategy        TEXT    NOT NULL
);
";

/// Create missing tables and stamp `user_version`. A database written by a
/// newer schema is refused rather than guessed at.
pub(crate) fn bootstrap(conn: &Connection) -> Result<(), StoreError> {
    let found: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if found > SCHEMA_VERSION {
        return Err(StoreError::SchemaVersion {
            found,
            supported: SCHEMA_VERSION,
        });
    }
    conn.execute_batch(SCHEMA)?;
    if found < SCHEMA_VERSION {
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    }
    Ok(())
}
