//! Database schema management.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;

/// Apply connection pragmas and create tables if missing.
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    // journal_mode reports the resulting mode as a row.
    conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
    conn.execute_batch(PRAGMAS)?;
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

/// Fixed-width UTC timestamps so that text comparison in SQL matches time order.
pub fn encode_ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn decode_ts(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|dt| dt.with_timezone(&Utc))
}

const PRAGMAS: &str = r#"
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;
"#;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS queues (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    status TEXT NOT NULL,
    instructions TEXT NOT NULL DEFAULT '',
    project_id TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS task_classes (
    name TEXT PRIMARY KEY,
    timeout_secs INTEGER NOT NULL CHECK (timeout_secs > 0),
    updated_at TEXT NOT NULL
);

-- seq breaks created_at ties so FIFO order is total
CREATE TABLE IF NOT EXISTS tasks (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    queue_id TEXT NOT NULL REFERENCES queues(id) ON DELETE CASCADE,
    status TEXT NOT NULL,
    task_class TEXT NOT NULL,
    payload TEXT NOT NULL,
    result TEXT,
    error TEXT,
    worker_id TEXT,
    session_id TEXT,
    created_at TEXT NOT NULL,
    claimed_at TEXT,
    started_at TEXT,
    finished_at TEXT,
    stale_warned_at TEXT,
    attempts INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_tasks_queue_status ON tasks(queue_id, status, created_at, seq);
CREATE INDEX IF NOT EXISTS idx_tasks_status_finished ON tasks(status, finished_at);

-- Append-only
CREATE TABLE IF NOT EXISTS audit_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    operation TEXT NOT NULL,
    target_id TEXT NOT NULL,
    detail TEXT,
    recorded_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS runner_leases (
    name TEXT PRIMARY KEY,
    holder TEXT NOT NULL,
    acquired_at TEXT NOT NULL,
    heartbeat_at TEXT NOT NULL,
    expires_at TEXT NOT NULL
);
"#;
