//! SQLite task store.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, OptionalExtension, TransactionBehavior};
use tokio_rusqlite::Connection;
use tracing::{debug, info};
use uuid::Uuid;

use crate::audit::AuditEntry;
use crate::config::StoreConfig;
use crate::error::QueueError;
use crate::queue::{NewQueue, Queue, QueueStats, QueueStatus};
use crate::schema::{encode_ts, init_schema};
use crate::store::{TaskStore, TransitionOutcome};
use crate::task::{NewTask, Task, TaskFilter, TaskStatus, Transition};
use crate::task_class::TaskClass;

#[path = "sqlite_rows.rs"]
mod rows;
use rows::{
    audit_from_row, class_from_row, parse_uuid, queue_from_row, record_audit, task_from_row,
    QUEUE_COLUMNS, TASK_COLUMNS,
};

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;

/// Ids per `DELETE ... IN (...)` statement.
const DELETE_CHUNK: usize = 500;

/// SQLite-backed store.
///
/// All statements for one store go through a single background connection. Writers in
/// other connections (or processes) sharing the file serialize on SQLite's write lock;
/// every mutation opens an `IMMEDIATE` transaction so the lock is taken up front.
pub struct SqliteTaskStore {
    conn: Connection,
}

impl SqliteTaskStore {
    /// Create a new in-memory database.
    pub async fn in_memory() -> Result<Self, QueueError> {
        let conn = Connection::open_in_memory().await?;
        Self::init(conn, None).await
    }

    /// Open (or create) a file-backed database.
    pub async fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self, QueueError> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    QueueError::Database(format!(
                        "Failed to create database directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let conn = Connection::open(path.clone()).await?;
        let store = Self::init(conn, Some(busy_timeout)).await?;
        info!("SQLite task store opened at {}", path.display());
        Ok(store)
    }

    pub async fn open_with_config(config: &StoreConfig) -> Result<Self, QueueError> {
        Self::open(&config.db_path, config.busy_timeout()).await
    }

    async fn init(conn: Connection, busy_timeout: Option<Duration>) -> Result<Self, QueueError> {
        conn.call(move |conn| {
            if let Some(timeout) = busy_timeout {
                conn.busy_timeout(timeout)?;
            }
            init_schema(conn)?;
            Ok(())
        })
        .await?;

        Ok(Self { conn })
    }

    /// Underlying connection handle, shared with [`RunnerLease`](crate::lease::RunnerLease).
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn create_queue(&self, queue: NewQueue, now: DateTime<Utc>) -> Result<Queue, QueueError> {
        let record = Queue {
            id: Uuid::new_v4(),
            name: queue.name,
            status: QueueStatus::Active,
            instructions: queue.instructions,
            project_id: queue.project_id,
            // Stored with microsecond precision.
            created_at: now.trunc_subsecs(6),
        };

        let row = record.clone();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

                let taken = tx
                    .query_row("SELECT 1 FROM queues WHERE name = ?1", [&row.name], |_| Ok(()))
                    .optional()?
                    .is_some();
                if taken {
                    return Ok(Err(QueueError::Conflict(row.name)));
                }

                let id = row.id.to_string();
                tx.execute(
                    "INSERT INTO queues (id, name, status, instructions, project_id, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        id,
                        row.name,
                        row.status.as_str(),
                        row.instructions,
                        row.project_id,
                        encode_ts(&row.created_at)
                    ],
                )?;
                record_audit(&tx, "create_queue", &id, Some(&row.name), &row.created_at)?;

                tx.commit()?;
                Ok(Ok(()))
            })
            .await??;

        debug!("Created queue '{}' ({})", record.name, record.id);
        Ok(record)
    }

    async fn get_queue(&self, id: &Uuid) -> Result<Option<Queue>, QueueError> {
        let id = id.to_string();
        let queue = self
            .conn
            .call(move |conn| {
                let sql = format!("SELECT {} FROM queues WHERE id = ?1", QUEUE_COLUMNS);
                Ok(conn.query_row(&sql, [&id], queue_from_row).optional()?)
            })
            .await?;
        Ok(queue)
    }

    async fn get_queue_by_name(&self, name: &str) -> Result<Option<Queue>, QueueError> {
        let name = name.to_string();
        let queue = self
            .conn
            .call(move |conn| {
                let sql = format!("SELECT {} FROM queues WHERE name = ?1", QUEUE_COLUMNS);
                Ok(conn.query_row(&sql, [&name], queue_from_row).optional()?)
            })
            .await?;
        Ok(queue)
    }

    async fn list_queues(&self) -> Result<Vec<Queue>, QueueError> {
        let queues = self
            .conn
            .call(|conn| {
                let sql = format!(
                    "SELECT {} FROM queues ORDER BY created_at ASC, name ASC",
                    QUEUE_COLUMNS
                );
                let mut stmt = conn.prepare(&sql)?;
                let queues = stmt
                    .query_map([], queue_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(queues)
            })
            .await?;
        Ok(queues)
    }

    async fn set_queue_status(
        &self,
        id: &Uuid,
        status: QueueStatus,
        now: DateTime<Utc>,
    ) -> Result<Queue, QueueError> {
        let queue_id = *id;
        let queue = self
            .conn
            .call(move |conn| {
                let id = queue_id.to_string();
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

                let changed = tx.execute(
                    "UPDATE queues SET status = ?1 WHERE id = ?2",
                    params![status.as_str(), id],
                )?;
                if changed == 0 {
                    return Ok(Err(QueueError::queue_not_found(queue_id)));
                }
                record_audit(&tx, "set_queue_status", &id, Some(status.as_str()), &now)?;

                let sql = format!("SELECT {} FROM queues WHERE id = ?1", QUEUE_COLUMNS);
                let queue = tx.query_row(&sql, [&id], queue_from_row)?;
                tx.commit()?;
                Ok(Ok(queue))
            })
            .await??;
        Ok(queue)
    }

    async fn delete_queue(&self, id: &Uuid, now: DateTime<Utc>) -> Result<u64, QueueError> {
        let queue_id = *id;
        let removed = self
            .conn
            .call(move |conn| {
                let id = queue_id.to_string();
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

                let tasks = tx.execute("DELETE FROM tasks WHERE queue_id = ?1", [&id])?;
                let queues = tx.execute("DELETE FROM queues WHERE id = ?1", [&id])?;
                if queues == 0 {
                    return Ok(Err(QueueError::queue_not_found(queue_id)));
                }
                let detail = format!("{} tasks", tasks);
                record_audit(&tx, "delete_queue", &id, Some(&detail), &now)?;

                tx.commit()?;
                Ok(Ok(tasks as u64))
            })
            .await??;

        info!("Deleted queue {} ({} tasks)", id, removed);
        Ok(removed)
    }

    async fn queue_stats(&self, id: &Uuid) -> Result<QueueStats, QueueError> {
        let queue_id = *id;
        let stats = self
            .conn
            .call(move |conn| {
                let id = queue_id.to_string();
                let exists = conn
                    .query_row("SELECT 1 FROM queues WHERE id = ?1", [&id], |_| Ok(()))
                    .optional()?
                    .is_some();
                if !exists {
                    return Ok(Err(QueueError::queue_not_found(queue_id)));
                }

                let mut stmt = conn.prepare(
                    "SELECT status, COUNT(*) FROM tasks WHERE queue_id = ?1 GROUP BY status",
                )?;
                let rows = stmt
                    .query_map([&id], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;

                let mut stats = QueueStats::default();
                for (status, count) in rows {
                    match status.parse::<TaskStatus>() {
                        Ok(status) => stats.add(status, count.max(0) as u64),
                        Err(e) => return Ok(Err(e)),
                    }
                }
                Ok(Ok(stats))
            })
            .await??;
        Ok(stats)
    }

    async fn upsert_task_class(&self, class: &TaskClass, now: DateTime<Utc>) -> Result<(), QueueError> {
        let class = class.clone();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                tx.execute(
                    "INSERT INTO task_classes (name, timeout_secs, updated_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(name) DO UPDATE SET
                        timeout_secs = excluded.timeout_secs,
                        updated_at = excluded.updated_at",
                    params![class.name, class.timeout_secs as i64, encode_ts(&now)],
                )?;
                let detail = format!("{}s", class.timeout_secs);
                record_audit(&tx, "upsert_task_class", &class.name, Some(&detail), &now)?;
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn get_task_class(&self, name: &str) -> Result<Option<TaskClass>, QueueError> {
        let name = name.to_string();
        let class = self
            .conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT name, timeout_secs FROM task_classes WHERE name = ?1",
                        [&name],
                        class_from_row,
                    )
                    .optional()?)
            })
            .await?;
        Ok(class)
    }

    async fn list_task_classes(&self) -> Result<Vec<TaskClass>, QueueError> {
        let classes = self
            .conn
            .call(|conn| {
                let mut stmt =
                    conn.prepare("SELECT name, timeout_secs FROM task_classes ORDER BY name")?;
                let classes = stmt
                    .query_map([], class_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(classes)
            })
            .await?;
        Ok(classes)
    }

    async fn create_task(&self, task: NewTask, now: DateTime<Utc>) -> Result<Task, QueueError> {
        let payload_json = serde_json::to_string(&task.payload)
            .map_err(|e| QueueError::Validation(format!("payload is not serializable: {}", e)))?;

        let record = Task {
            id: Uuid::new_v4(),
            queue_id: task.queue_id,
            status: TaskStatus::Queued,
            task_class: task.task_class,
            payload: task.payload,
            result: None,
            error: None,
            worker_id: None,
            session_id: task.session_id,
            created_at: now.trunc_subsecs(6),
            claimed_at: None,
            started_at: None,
            finished_at: None,
            stale_warned_at: None,
            attempts: 0,
        };

        let row = record.clone();
        self.conn
            .call(move |conn| {
                let queue_id = row.queue_id.to_string();
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

                let status: Option<String> = tx
                    .query_row("SELECT status FROM queues WHERE id = ?1", [&queue_id], |r| r.get(0))
                    .optional()?;
                let status = match status.map(|s| s.parse::<QueueStatus>()) {
                    None => return Ok(Err(QueueError::queue_not_found(row.queue_id))),
                    Some(Err(e)) => return Ok(Err(e)),
                    Some(Ok(status)) => status,
                };
                if !status.accepts_tasks() {
                    return Ok(Err(QueueError::queue_not_found(row.queue_id)));
                }

                let id = row.id.to_string();
                tx.execute(
                    "INSERT INTO tasks (id, queue_id, status, task_class, payload, session_id, created_at, attempts)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0)",
                    params![
                        id,
                        queue_id,
                        row.status.as_str(),
                        row.task_class,
                        payload_json,
                        row.session_id,
                        encode_ts(&row.created_at)
                    ],
                )?;
                record_audit(&tx, "create_task", &id, Some(&queue_id), &row.created_at)?;

                tx.commit()?;
                Ok(Ok(()))
            })
            .await??;

        debug!("Created task {} in queue {}", record.id, record.queue_id);
        Ok(record)
    }

    async fn get_task(&self, id: &Uuid) -> Result<Option<Task>, QueueError> {
        let id = id.to_string();
        let task = self
            .conn
            .call(move |conn| {
                let sql = format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS);
                Ok(conn.query_row(&sql, [&id], task_from_row).optional()?)
            })
            .await?;
        Ok(task)
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, QueueError> {
        let mut sql = format!("SELECT {} FROM tasks WHERE 1 = 1", TASK_COLUMNS);
        let mut values: Vec<Value> = Vec::new();

        if let Some(queue_id) = filter.queue_id {
            values.push(Value::Text(queue_id.to_string()));
            sql.push_str(&format!(" AND queue_id = ?{}", values.len()));
        }
        if let Some(status) = filter.status {
            values.push(Value::Text(status.as_str().to_string()));
            sql.push_str(&format!(" AND status = ?{}", values.len()));
        }
        sql.push_str(" ORDER BY created_at ASC, seq ASC");
        if let Some(limit) = filter.limit {
            values.push(Value::Integer(limit.min(i64::MAX as usize) as i64));
            sql.push_str(&format!(" LIMIT ?{}", values.len()));
        }

        let tasks = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let tasks = stmt
                    .query_map(params_from_iter(values.iter()), task_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(tasks)
            })
            .await?;
        Ok(tasks)
    }

    async fn oldest_queued(&self, queue_id: &Uuid) -> Result<Option<Task>, QueueError> {
        let queue_id = queue_id.to_string();
        let task = self
            .conn
            .call(move |conn| {
                let sql = format!(
                    "SELECT {} FROM tasks WHERE queue_id = ?1 AND status = ?2
                     ORDER BY created_at ASC, seq ASC LIMIT 1",
                    TASK_COLUMNS
                );
                Ok(conn
                    .query_row(&sql, params![queue_id, TaskStatus::Queued.as_str()], task_from_row)
                    .optional()?)
            })
            .await?;
        Ok(task)
    }

    async fn apply_transition(
        &self,
        task_id: &Uuid,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, QueueError> {
        let id = task_id.to_string();
        let action = transition.action();
        let from = transition.from_status().as_str();
        let to = transition.to_status().as_str();

        let outcome = self
            .conn
            .call(move |conn| {
                let at = encode_ts(&now);
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

                let (changed, detail) = match &transition {
                    Transition::Claim { worker_id } => (
                        tx.execute(
                            "UPDATE tasks SET status = ?1, claimed_at = ?2, started_at = ?2,
                                attempts = attempts + 1, worker_id = ?3
                             WHERE id = ?4 AND status = ?5",
                            params![to, at, worker_id, id, from],
                        )?,
                        Some(worker_id.clone()),
                    ),
                    Transition::Complete { result } => (
                        tx.execute(
                            "UPDATE tasks SET status = ?1, finished_at = ?2, result = ?3
                             WHERE id = ?4 AND status = ?5",
                            params![to, at, result.to_string(), id, from],
                        )?,
                        None,
                    ),
                    Transition::Fail { error } => (
                        tx.execute(
                            "UPDATE tasks SET status = ?1, finished_at = ?2, error = ?3
                             WHERE id = ?4 AND status = ?5",
                            params![to, at, error, id, from],
                        )?,
                        Some(error.clone()),
                    ),
                    Transition::AutoFail { reason, attempts } => (
                        tx.execute(
                            "UPDATE tasks SET status = ?1, finished_at = ?2, error = ?3
                             WHERE id = ?4 AND status = ?5 AND attempts = ?6",
                            params![to, at, reason, id, from, *attempts as i64],
                        )?,
                        Some(reason.clone()),
                    ),
                    Transition::Requeue => (
                        tx.execute(
                            "UPDATE tasks SET status = ?1, claimed_at = NULL, started_at = NULL,
                                finished_at = NULL, stale_warned_at = NULL, worker_id = NULL,
                                result = NULL, error = NULL
                             WHERE id = ?2 AND status = ?3",
                            params![to, id, from],
                        )?,
                        None,
                    ),
                };

                let sql = format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS);
                let current = tx.query_row(&sql, [&id], task_from_row).optional()?;

                let outcome = match current {
                    None => TransitionOutcome::Missing,
                    Some(task) if changed > 0 => {
                        record_audit(&tx, action, &id, detail.as_deref(), &now)?;
                        TransitionOutcome::Applied(task)
                    }
                    Some(task) => TransitionOutcome::Rejected(task),
                };

                tx.commit()?;
                Ok(outcome)
            })
            .await?;
        Ok(outcome)
    }

    async fn mark_stale_warned(
        &self,
        task_id: &Uuid,
        attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<bool, QueueError> {
        let id = task_id.to_string();
        let warned = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let changed = tx.execute(
                    "UPDATE tasks SET stale_warned_at = ?1
                     WHERE id = ?2 AND status = ?3 AND attempts = ?4 AND stale_warned_at IS NULL",
                    params![
                        encode_ts(&now),
                        id,
                        TaskStatus::Running.as_str(),
                        attempts as i64
                    ],
                )?;
                if changed > 0 {
                    record_audit(&tx, "stale_warn", &id, None, &now)?;
                }
                tx.commit()?;
                Ok(changed > 0)
            })
            .await?;
        Ok(warned)
    }

    async fn delete_task(&self, id: &Uuid, now: DateTime<Utc>) -> Result<bool, QueueError> {
        let id = id.to_string();
        let deleted = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let changed = tx.execute("DELETE FROM tasks WHERE id = ?1", [&id])?;
                if changed > 0 {
                    record_audit(&tx, "delete_task", &id, None, &now)?;
                }
                tx.commit()?;
                Ok(changed > 0)
            })
            .await?;
        Ok(deleted)
    }

    async fn delete_tasks(
        &self,
        ids: &[Uuid],
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, QueueError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let ids: Vec<String> = ids.iter().map(Uuid::to_string).collect();
        let deleted = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let mut deleted = 0usize;

                let cutoff = encode_ts(&cutoff);
                for chunk in ids.chunks(DELETE_CHUNK) {
                    let placeholders = (4..chunk.len() + 4)
                        .map(|i| format!("?{}", i))
                        .collect::<Vec<_>>()
                        .join(", ");
                    // Re-checked here: a task may have been requeued and finished again
                    // since it was selected.
                    let sql = format!(
                        "DELETE FROM tasks
                         WHERE status IN (?1, ?2) AND finished_at IS NOT NULL AND finished_at < ?3
                           AND id IN ({})",
                        placeholders
                    );
                    let values = [
                        TaskStatus::Succeeded.as_str(),
                        TaskStatus::Failed.as_str(),
                        cutoff.as_str(),
                    ]
                    .into_iter()
                    .chain(chunk.iter().map(String::as_str));
                    deleted += tx.execute(&sql, params_from_iter(values))?;
                }

                if deleted > 0 {
                    let detail = format!("{} tasks", deleted);
                    record_audit(&tx, "purge", "tasks", Some(&detail), &now)?;
                }
                tx.commit()?;
                Ok(deleted as u64)
            })
            .await?;
        Ok(deleted)
    }

    async fn finished_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Uuid>, QueueError> {
        let ids = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id FROM tasks
                     WHERE status IN (?1, ?2) AND finished_at IS NOT NULL AND finished_at < ?3
                     ORDER BY finished_at ASC",
                )?;
                let ids = stmt
                    .query_map(
                        params![
                            TaskStatus::Succeeded.as_str(),
                            TaskStatus::Failed.as_str(),
                            encode_ts(&cutoff)
                        ],
                        |row| {
                            let raw: String = row.get(0)?;
                            parse_uuid(0, &raw)
                        },
                    )?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(ids)
            })
            .await?;
        Ok(ids)
    }

    async fn audit_entries(&self, limit: usize) -> Result<Vec<AuditEntry>, QueueError> {
        let limit = limit.min(i64::MAX as usize) as i64;
        let entries = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, operation, target_id, detail, recorded_at
                     FROM audit_log ORDER BY id DESC LIMIT ?1",
                )?;
                let entries = stmt
                    .query_map([limit], audit_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(entries)
            })
            .await?;
        Ok(entries)
    }
}
