//! Queue definition and status.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::QueueError;
use crate::task::TaskStatus;

/// Queue status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    /// Accepting and handing out tasks.
    Active,
    /// Hidden from day-to-day use; can be reactivated.
    Archived,
    /// Closed for new tasks. Final.
    Ended,
}

impl QueueStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueStatus::Active => "active",
            QueueStatus::Archived => "archived",
            QueueStatus::Ended => "ended",
        }
    }

    pub fn accepts_tasks(self) -> bool {
        !matches!(self, QueueStatus::Ended)
    }

    pub fn can_transition_to(self, next: QueueStatus) -> bool {
        matches!(
            (self, next),
            (QueueStatus::Active, QueueStatus::Archived)
                | (QueueStatus::Archived, QueueStatus::Active)
                | (QueueStatus::Active, QueueStatus::Ended)
                | (QueueStatus::Archived, QueueStatus::Ended)
        )
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(QueueStatus::Active),
            "archived" => Ok(QueueStatus::Archived),
            "ended" => Ok(QueueStatus::Ended),
            other => Err(QueueError::Validation(format!("unknown queue status '{}'", other))),
        }
    }
}

/// A named FIFO queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Queue {
    pub id: Uuid,
    /// Unique across all queues, whatever their status.
    pub name: String,
    pub status: QueueStatus,
    /// Free-text instructions for workers.
    pub instructions: String,
    /// Pass-through project identifier, never interpreted.
    pub project_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Request to create a queue.
#[derive(Debug, Clone)]
pub struct NewQueue {
    pub name: String,
    pub instructions: String,
    pub project_id: Option<String>,
}

impl NewQueue {
    pub fn new(name: impl Into<String>, instructions: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instructions: instructions.into(),
            project_id: None,
        }
    }

    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn validate(&self) -> Result<(), QueueError> {
        if self.name.trim().is_empty() {
            return Err(QueueError::Validation("queue name is empty".to_string()));
        }
        if self.name.trim() != self.name {
            return Err(QueueError::Validation(format!(
                "queue name '{}' has leading or trailing whitespace",
                self.name
            )));
        }
        Ok(())
    }
}

/// Task counts per status for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queued: u64,
    pub running: u64,
    pub succeeded: u64,
    pub failed: u64,
}

impl QueueStats {
    pub fn add(&mut self, status: TaskStatus, count: u64) {
        match status {
            TaskStatus::Queued => self.queued += count,
            TaskStatus::Running => self.running += count,
            TaskStatus::Succeeded => self.succeeded += count,
            TaskStatus::Failed => self.failed += count,
        }
    }

    pub fn total(&self) -> u64 {
        self.queued + self.running + self.succeeded + self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_status_transitions() {
        assert!(QueueStatus::Active.can_transition_to(QueueStatus::Archived));
        assert!(QueueStatus::Archived.can_transition_to(QueueStatus::Active));
        assert!(QueueStatus::Active.can_transition_to(QueueStatus::Ended));
        assert!(!QueueStatus::Ended.can_transition_to(QueueStatus::Active));
        assert!(!QueueStatus::Active.can_transition_to(QueueStatus::Active));
    }

    #[test]
    fn test_accepts_tasks() {
        assert!(QueueStatus::Active.accepts_tasks());
        assert!(QueueStatus::Archived.accepts_tasks());
        assert!(!QueueStatus::Ended.accepts_tasks());
    }

    #[test]
    fn test_new_queue_validation() {
        assert!(NewQueue::new("Q1", "").validate().is_ok());
        assert!(NewQueue::new("", "").validate().is_err());
        assert!(NewQueue::new(" Q1", "").validate().is_err());
    }

    #[test]
    fn test_stats_total() {
        let mut stats = QueueStats::default();
        stats.add(TaskStatus::Queued, 2);
        stats.add(TaskStatus::Failed, 1);
        assert_eq!(stats.queued, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.total(), 3);
    }
}
