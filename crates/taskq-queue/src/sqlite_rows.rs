//! Row mapping and audit helpers shared by the SQLite store.

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, Row};
use uuid::Uuid;

use crate::audit::AuditEntry;
use crate::queue::Queue;
use crate::schema::{decode_ts, encode_ts};
use crate::task::{Task, TaskPayload};
use crate::task_class::TaskClass;

pub(super) const QUEUE_COLUMNS: &str =
    "id, name, status, instructions, project_id, created_at";

pub(super) const TASK_COLUMNS: &str = "id, queue_id, status, task_class, payload, result, error, \
     worker_id, session_id, created_at, claimed_at, started_at, finished_at, stale_warned_at, attempts";

fn conversion_error<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

pub(super) fn parse_uuid(idx: usize, raw: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| conversion_error(idx, e))
}

fn uuid_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    parse_uuid(idx, &raw)
}

fn ts_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    decode_ts(&raw).map_err(|e| conversion_error(idx, e))
}

fn opt_ts_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| decode_ts(&s).map_err(|e| conversion_error(idx, e)))
        .transpose()
}

fn parsed_at<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>().map_err(|e| conversion_error(idx, e))
}

pub(super) fn queue_from_row(row: &Row<'_>) -> rusqlite::Result<Queue> {
    Ok(Queue {
        id: uuid_at(row, 0)?,
        name: row.get(1)?,
        status: parsed_at(row, 2)?,
        instructions: row.get(3)?,
        project_id: row.get(4)?,
        created_at: ts_at(row, 5)?,
    })
}

pub(super) fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    let payload: String = row.get(4)?;
    let payload: TaskPayload = serde_json::from_str(&payload).map_err(|e| conversion_error(4, e))?;

    let result: Option<String> = row.get(5)?;
    let result = result
        .map(|raw| serde_json::from_str::<serde_json::Value>(&raw).map_err(|e| conversion_error(5, e)))
        .transpose()?;

    Ok(Task {
        id: uuid_at(row, 0)?,
        queue_id: uuid_at(row, 1)?,
        status: parsed_at(row, 2)?,
        task_class: row.get(3)?,
        payload,
        result,
        error: row.get(6)?,
        worker_id: row.get(7)?,
        session_id: row.get(8)?,
        created_at: ts_at(row, 9)?,
        claimed_at: opt_ts_at(row, 10)?,
        started_at: opt_ts_at(row, 11)?,
        finished_at: opt_ts_at(row, 12)?,
        stale_warned_at: opt_ts_at(row, 13)?,
        attempts: row.get(14)?,
    })
}

pub(super) fn class_from_row(row: &Row<'_>) -> rusqlite::Result<TaskClass> {
    let timeout: i64 = row.get(1)?;
    Ok(TaskClass {
        name: row.get(0)?,
        timeout_secs: timeout.max(0) as u64,
    })
}

pub(super) fn audit_from_row(row: &Row<'_>) -> rusqlite::Result<AuditEntry> {
    Ok(AuditEntry {
        id: row.get(0)?,
        operation: row.get(1)?,
        target_id: row.get(2)?,
        detail: row.get(3)?,
        recorded_at: ts_at(row, 4)?,
    })
}

/// Append an audit entry. Call inside the mutation's transaction.
pub(super) fn record_audit(
    conn: &Connection,
    operation: &str,
    target_id: &str,
    detail: Option<&str>,
    at: &DateTime<Utc>,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO audit_log (operation, target_id, detail, recorded_at) VALUES (?1, ?2, ?3, ?4)",
        params![operation, target_id, detail, encode_ts(at)],
    )?;
    Ok(())
}
