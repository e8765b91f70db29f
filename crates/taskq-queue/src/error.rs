//! Queue engine errors.

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::task::TaskStatus;

/// Queue engine error types.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Referenced queue or task does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Queue name already taken.
    #[error("Queue name already exists: {0}")]
    Conflict(String),

    /// Operation attempted on a task in an incompatible state.
    ///
    /// `status` is the status observed when the transition was rejected.
    #[error("Cannot {action} task {task_id}: task is {status}")]
    InvalidStateTransition {
        task_id: Uuid,
        status: TaskStatus,
        action: &'static str,
    },

    /// Malformed payload, task class reference or argument.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Lease currently held by another live holder.
    #[error("Lease '{name}' is held by {holder} until {expires_at}")]
    LeaseHeld {
        name: String,
        holder: String,
        expires_at: DateTime<Utc>,
    },

    /// Lease expired and was taken over (or released) while we believed we held it.
    #[error("Lease '{name}' is no longer held by {holder}")]
    LeaseLost { name: String, holder: String },

    /// Database error.
    #[error("Database error: {0}")]
    Database(String),
}

impl QueueError {
    pub fn queue_not_found(id: impl ToString) -> Self {
        QueueError::NotFound {
            kind: "Queue",
            id: id.to_string(),
        }
    }

    pub fn task_not_found(id: impl ToString) -> Self {
        QueueError::NotFound {
            kind: "Task",
            id: id.to_string(),
        }
    }

    /// True for the rejected-transition outcome of a lost race.
    pub fn is_invalid_transition(&self) -> bool {
        matches!(self, QueueError::InvalidStateTransition { .. })
    }
}

impl From<tokio_rusqlite::Error> for QueueError {
    fn from(e: tokio_rusqlite::Error) -> Self {
        QueueError::Database(e.to_string())
    }
}

impl From<rusqlite::Error> for QueueError {
    fn from(e: rusqlite::Error) -> Self {
        QueueError::Database(e.to_string())
    }
}
