//! Task persistence store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::audit::AuditEntry;
use crate::error::QueueError;
use crate::queue::{NewQueue, Queue, QueueStats, QueueStatus};
use crate::task::{NewTask, Task, TaskFilter, Transition};
use crate::task_class::TaskClass;

/// Result of a conditional status update.
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    /// The task was in the expected state and has been updated.
    Applied(Task),
    /// The task was not in the expected state; carries its current row, unchanged.
    Rejected(Task),
    /// No task with that id.
    Missing,
}

/// Persistent store for queues, tasks, task classes and the audit trail.
///
/// Every mutating method runs in a single transaction and appends an audit entry in it.
/// Timestamps are supplied by the caller so the store never reads a clock.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Create a queue. Fails with `Conflict` if the name is taken.
    async fn create_queue(&self, queue: NewQueue, now: DateTime<Utc>) -> Result<Queue, QueueError>;

    async fn get_queue(&self, id: &Uuid) -> Result<Option<Queue>, QueueError>;

    async fn get_queue_by_name(&self, name: &str) -> Result<Option<Queue>, QueueError>;

    /// All queues, oldest first.
    async fn list_queues(&self) -> Result<Vec<Queue>, QueueError>;

    /// Set a queue's status. The caller validates the transition.
    async fn set_queue_status(
        &self,
        id: &Uuid,
        status: QueueStatus,
        now: DateTime<Utc>,
    ) -> Result<Queue, QueueError>;

    /// Hard delete a queue and its tasks. Returns the number of tasks removed.
    async fn delete_queue(&self, id: &Uuid, now: DateTime<Utc>) -> Result<u64, QueueError>;

    async fn queue_stats(&self, id: &Uuid) -> Result<QueueStats, QueueError>;

    /// Insert or update a task class.
    async fn upsert_task_class(&self, class: &TaskClass, now: DateTime<Utc>) -> Result<(), QueueError>;

    async fn get_task_class(&self, name: &str) -> Result<Option<TaskClass>, QueueError>;

    async fn list_task_classes(&self) -> Result<Vec<TaskClass>, QueueError>;

    /// Create a task in `queued` state. Fails with `NotFound` if the queue does not
    /// exist or has ended.
    async fn create_task(&self, task: NewTask, now: DateTime<Utc>) -> Result<Task, QueueError>;

    async fn get_task(&self, id: &Uuid) -> Result<Option<Task>, QueueError>;

    /// Tasks matching the filter, ordered by `created_at` ascending.
    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, QueueError>;

    /// The oldest `queued` task of a queue, if any.
    async fn oldest_queued(&self, queue_id: &Uuid) -> Result<Option<Task>, QueueError>;

    /// Apply a transition only if the task is still in `transition.from_status()`
    /// (and, for auto-fail, still on the same claim cycle).
    async fn apply_transition(
        &self,
        task_id: &Uuid,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, QueueError>;

    /// Set `stale_warned_at` on a running, not yet warned task of the given claim cycle.
    /// Returns false when nothing matched.
    async fn mark_stale_warned(
        &self,
        task_id: &Uuid,
        attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<bool, QueueError>;

    /// Hard delete one task, whatever its status. Returns false if it did not exist.
    async fn delete_task(&self, id: &Uuid, now: DateTime<Utc>) -> Result<bool, QueueError>;

    /// Hard delete terminal tasks by id whose `finished_at` is still strictly
    /// before `cutoff`; anything else is left alone. Returns the number of rows removed.
    async fn delete_tasks(
        &self,
        ids: &[Uuid],
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, QueueError>;

    /// Ids of terminal tasks whose `finished_at` is strictly before `cutoff`.
    async fn finished_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Uuid>, QueueError>;

    /// Most recent audit entries, newest first.
    async fn audit_entries(&self, limit: usize) -> Result<Vec<AuditEntry>, QueueError>;
}
