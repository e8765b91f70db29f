//! Task lifecycle engine.
//!
//! Enforces the queue and task state machines on top of a [`TaskStore`]. Every
//! task transition is a compare-and-swap on the task's current status, so the
//! sweepers and external workers can race on the same task without either side
//! overwriting the other's terminal state.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::AuditEntry;
use crate::clock::{Clock, SystemClock};
use crate::error::QueueError;
use crate::queue::{NewQueue, Queue, QueueStats, QueueStatus};
use crate::store::{TaskStore, TransitionOutcome};
use crate::task::{NewTask, Task, TaskFilter, TaskPayload, TaskStatus, Transition};
use crate::task_class::TaskClass;

#[cfg(test)]
#[path = "lifecycle_tests.rs"]
mod tests;

/// Claim selections per call: the first try plus one retry after a lost race.
const CLAIM_ATTEMPTS: usize = 2;

/// Lifecycle engine over a shared store.
pub struct TaskEngine {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
}

impl TaskEngine {
    pub fn new(store: Arc<dyn TaskStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Engine reading the wall clock.
    pub fn with_system_clock(store: Arc<dyn TaskStore>) -> Self {
        Self::new(store, Arc::new(SystemClock))
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub async fn create_queue(
        &self,
        name: impl Into<String>,
        instructions: impl Into<String>,
    ) -> Result<Queue, QueueError> {
        self.create_queue_with(NewQueue::new(name, instructions)).await
    }

    pub async fn create_queue_with(&self, queue: NewQueue) -> Result<Queue, QueueError> {
        queue.validate()?;
        let queue = self.store.create_queue(queue, self.now()).await?;
        info!("Queue '{}' created ({})", queue.name, queue.id);
        Ok(queue)
    }

    pub async fn get_queue(&self, id: &Uuid) -> Result<Queue, QueueError> {
        self.store
            .get_queue(id)
            .await?
            .ok_or_else(|| QueueError::queue_not_found(id))
    }

    pub async fn get_queue_by_name(&self, name: &str) -> Result<Queue, QueueError> {
        self.store
            .get_queue_by_name(name)
            .await?
            .ok_or_else(|| QueueError::queue_not_found(name))
    }

    pub async fn list_queues(&self) -> Result<Vec<Queue>, QueueError> {
        self.store.list_queues().await
    }

    /// Move a queue between `active` and `archived`, or end it. `ended` is final.
    pub async fn set_queue_status(&self, id: &Uuid, status: QueueStatus) -> Result<Queue, QueueError> {
        let current = self.get_queue(id).await?;
        if current.status == status {
            return Ok(current);
        }
        if !current.status.can_transition_to(status) {
            return Err(QueueError::Validation(format!(
                "queue '{}' cannot move from {} to {}",
                current.name, current.status, status
            )));
        }

        let queue = self.store.set_queue_status(id, status, self.now()).await?;
        info!("Queue '{}' is now {}", queue.name, queue.status);
        Ok(queue)
    }

    /// Hard delete a queue with all of its tasks.
    pub async fn delete_queue(&self, id: &Uuid) -> Result<u64, QueueError> {
        self.store.delete_queue(id, self.now()).await
    }

    pub async fn queue_stats(&self, id: &Uuid) -> Result<QueueStats, QueueError> {
        self.store.queue_stats(id).await
    }

    pub async fn register_task_class(&self, class: TaskClass) -> Result<(), QueueError> {
        class.validate()?;
        self.store.upsert_task_class(&class, self.now()).await?;
        debug!("Task class {} registered ({}s)", class.name, class.timeout_secs);
        Ok(())
    }

    /// Upsert every configured class. Returns how many were written.
    pub async fn seed_task_classes(&self, classes: &BTreeMap<String, u64>) -> Result<usize, QueueError> {
        for (name, timeout_secs) in classes {
            self.register_task_class(TaskClass::new(name.clone(), *timeout_secs))
                .await?;
        }
        info!("Seeded {} task classes", classes.len());
        Ok(classes.len())
    }

    pub async fn list_task_classes(&self) -> Result<Vec<TaskClass>, QueueError> {
        self.store.list_task_classes().await
    }

    pub async fn create_task(
        &self,
        queue_id: &Uuid,
        payload: TaskPayload,
        task_class: impl Into<String>,
    ) -> Result<Task, QueueError> {
        self.create_task_with(NewTask::new(*queue_id, payload, task_class))
            .await
    }

    /// Create a task in `queued` state.
    ///
    /// Fails with `Validation` for a malformed payload or unknown task class, and
    /// with `NotFound` if the queue does not exist or has ended.
    pub async fn create_task_with(&self, task: NewTask) -> Result<Task, QueueError> {
        task.payload.validate()?;
        if self.store.get_task_class(&task.task_class).await?.is_none() {
            return Err(QueueError::Validation(format!(
                "unknown task class '{}'",
                task.task_class
            )));
        }

        let task = self.store.create_task(task, self.now()).await?;
        debug!(
            "Task {} queued in {} ({}, tool: {})",
            task.id, task.queue_id, task.task_class, task.payload.tool
        );
        Ok(task)
    }

    pub async fn get_task(&self, id: &Uuid) -> Result<Task, QueueError> {
        self.store
            .get_task(id)
            .await?
            .ok_or_else(|| QueueError::task_not_found(id))
    }

    pub async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, QueueError> {
        self.store.list_tasks(filter).await
    }

    /// Hand the oldest queued task of a queue to `worker_id`.
    ///
    /// Returns `None` when the queue is empty or does not exist, or when the
    /// selection lost the race twice in a row.
    pub async fn claim(&self, queue_id: &Uuid, worker_id: &str) -> Result<Option<Task>, QueueError> {
        if worker_id.trim().is_empty() {
            return Err(QueueError::Validation("worker id is empty".to_string()));
        }

        for attempt in 0..CLAIM_ATTEMPTS {
            let Some(candidate) = self.store.oldest_queued(queue_id).await? else {
                return Ok(None);
            };

            let transition = Transition::Claim {
                worker_id: worker_id.to_string(),
            };
            match self
                .store
                .apply_transition(&candidate.id, transition, self.now())
                .await?
            {
                TransitionOutcome::Applied(task) => {
                    debug!("Task {} claimed by {} (attempt {})", task.id, worker_id, task.attempts);
                    return Ok(Some(task));
                }
                TransitionOutcome::Rejected(_) | TransitionOutcome::Missing => {
                    debug!(
                        "Lost claim race for task {} in queue {} (try {})",
                        candidate.id,
                        queue_id,
                        attempt + 1
                    );
                }
            }
        }

        Ok(None)
    }

    /// running → succeeded.
    pub async fn complete(&self, task_id: &Uuid, result: serde_json::Value) -> Result<Task, QueueError> {
        let task = self.transition(task_id, Transition::Complete { result }).await?;
        debug!("Task {} succeeded", task.id);
        Ok(task)
    }

    /// running → failed.
    pub async fn fail(&self, task_id: &Uuid, error: impl Into<String>) -> Result<Task, QueueError> {
        let task = self
            .transition(task_id, Transition::Fail { error: error.into() })
            .await?;
        debug!("Task {} failed: {}", task.id, task.error.as_deref().unwrap_or_default());
        Ok(task)
    }

    /// failed → queued, keeping `attempts` and `created_at`.
    pub async fn requeue(&self, task_id: &Uuid) -> Result<Task, QueueError> {
        let task = self.transition(task_id, Transition::Requeue).await?;
        info!("Task {} requeued after {} attempts", task.id, task.attempts);
        Ok(task)
    }

    async fn transition(&self, task_id: &Uuid, transition: Transition) -> Result<Task, QueueError> {
        let action = transition.action();
        match self
            .store
            .apply_transition(task_id, transition, self.now())
            .await?
        {
            TransitionOutcome::Applied(task) => Ok(task),
            TransitionOutcome::Rejected(current) => Err(QueueError::InvalidStateTransition {
                task_id: current.id,
                status: current.status,
                action,
            }),
            TransitionOutcome::Missing => Err(QueueError::task_not_found(task_id)),
        }
    }

    /// Fail a running task on behalf of the stale sweeper.
    ///
    /// Only applies to the claim cycle observed in `task`; returns `None` if the
    /// task has since finished, been requeued or been claimed again.
    pub async fn auto_fail(&self, task: &Task, reason: &str) -> Result<Option<Task>, QueueError> {
        let transition = Transition::AutoFail {
            reason: reason.to_string(),
            attempts: task.attempts,
        };
        match self.store.apply_transition(&task.id, transition, self.now()).await? {
            TransitionOutcome::Applied(failed) => {
                warn!(
                    "Task {} auto-failed after {} attempts: {}",
                    failed.id, failed.attempts, reason
                );
                Ok(Some(failed))
            }
            TransitionOutcome::Rejected(current) => {
                debug!(
                    "Auto-fail of task {} skipped: now {} (attempt {})",
                    current.id, current.status, current.attempts
                );
                Ok(None)
            }
            TransitionOutcome::Missing => Ok(None),
        }
    }

    /// Record the one-time stale warning for the claim cycle observed in `task`.
    pub async fn warn_stale(&self, task: &Task) -> Result<bool, QueueError> {
        let warned = self
            .store
            .mark_stale_warned(&task.id, task.attempts, self.now())
            .await?;
        if warned {
            warn!(
                "Task {} ({}) has been running past its timeout (worker: {})",
                task.id,
                task.task_class,
                task.worker_id.as_deref().unwrap_or("unknown")
            );
        }
        Ok(warned)
    }

    /// Hard delete one task regardless of status.
    pub async fn delete_task(&self, task_id: &Uuid) -> Result<(), QueueError> {
        if self.store.delete_task(task_id, self.now()).await? {
            debug!("Task {} deleted", task_id);
            Ok(())
        } else {
            Err(QueueError::task_not_found(task_id))
        }
    }

    /// Delete terminal tasks that finished more than `older_than` ago.
    pub async fn purge(&self, older_than: Duration) -> Result<u64, QueueError> {
        if older_than < Duration::zero() {
            return Err(QueueError::Validation(format!(
                "purge window must not be negative: {}",
                older_than
            )));
        }

        // A window reaching past the earliest representable instant has nothing old enough.
        let Some(cutoff) = self.now().checked_sub_signed(older_than) else {
            debug!("Purge window {} predates every task, nothing to delete", older_than);
            return Ok(0);
        };
        let ids = self.store.finished_before(cutoff).await?;
        if ids.is_empty() {
            return Ok(0);
        }
        self.store.delete_tasks(&ids, cutoff, self.now()).await
    }

    pub async fn audit_entries(&self, limit: usize) -> Result<Vec<AuditEntry>, QueueError> {
        self.store.audit_entries(limit).await
    }

    /// Running tasks across all queues, oldest first.
    pub async fn running_tasks(&self) -> Result<Vec<Task>, QueueError> {
        self.store
            .list_tasks(&TaskFilter::all().with_status(TaskStatus::Running))
            .await
    }
}
