//! Task definition, status and the lifecycle transition graph.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::QueueError;

/// Task status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting in queue.
    Queued,
    /// Claimed by a worker.
    Running,
    /// Completed successfully.
    Succeeded,
    /// Failed by its worker or auto-failed by the stale sweeper.
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 4] = [
        TaskStatus::Queued,
        TaskStatus::Running,
        TaskStatus::Succeeded,
        TaskStatus::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
        }
    }

    /// Terminal states are the only ones the purge sweeper may delete.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed)
    }

    /// Edges of the lifecycle graph. Anything else is rejected.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Queued, TaskStatus::Running)
                | (TaskStatus::Running, TaskStatus::Succeeded)
                | (TaskStatus::Running, TaskStatus::Failed)
                | (TaskStatus::Failed, TaskStatus::Queued)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(TaskStatus::Queued),
            "running" => Ok(TaskStatus::Running),
            "succeeded" => Ok(TaskStatus::Succeeded),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(QueueError::Validation(format!("unknown task status '{}'", other))),
        }
    }
}

/// Opaque work description: which tool to run and with what arguments.
///
/// The engine never executes it; an external worker does and reports back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPayload {
    pub tool: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

impl TaskPayload {
    pub fn new(tool: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            tool: tool.into(),
            args,
        }
    }

    pub fn validate(&self) -> Result<(), QueueError> {
        if self.tool.trim().is_empty() {
            return Err(QueueError::Validation("payload tool name is empty".to_string()));
        }
        match self.args {
            serde_json::Value::Object(_) | serde_json::Value::Array(_) | serde_json::Value::Null => {
                Ok(())
            }
            _ => Err(QueueError::Validation(format!(
                "payload args for '{}' must be an object, array or null",
                self.tool
            ))),
        }
    }
}

/// A task as persisted in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub queue_id: Uuid,
    pub status: TaskStatus,
    /// Task class name; determines the stale timeout.
    pub task_class: String,
    pub payload: TaskPayload,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    /// Worker holding (or last holding) the task.
    pub worker_id: Option<String>,
    /// Pass-through session identifier, never interpreted.
    pub session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub stale_warned_at: Option<DateTime<Utc>>,
    /// Number of claim cycles.
    pub attempts: u32,
}

impl Task {
    /// Time spent running, measured from `claimed_at` or, failing that, `started_at`.
    pub fn elapsed_since_claim(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.claimed_at.or(self.started_at).map(|since| now - since)
    }

    pub fn is_stale_warned(&self) -> bool {
        self.stale_warned_at.is_some()
    }
}

/// Request to create a task.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub queue_id: Uuid,
    pub payload: TaskPayload,
    pub task_class: String,
    pub session_id: Option<String>,
}

impl NewTask {
    pub fn new(queue_id: Uuid, payload: TaskPayload, task_class: impl Into<String>) -> Self {
        Self {
            queue_id,
            payload,
            task_class: task_class.into(),
            session_id: None,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

/// Filter for listing tasks. Results are always ordered by creation, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilter {
    pub queue_id: Option<Uuid>,
    pub status: Option<TaskStatus>,
    pub limit: Option<usize>,
}

impl TaskFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn in_queue(mut self, queue_id: Uuid) -> Self {
        self.queue_id = Some(queue_id);
        self
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// A lifecycle event applied to a task with compare-and-swap on its status.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// queued → running.
    Claim { worker_id: String },
    /// running → succeeded.
    Complete { result: serde_json::Value },
    /// running → failed.
    Fail { error: String },
    /// running → failed, issued by the stale sweeper for a specific claim cycle.
    AutoFail { reason: String, attempts: u32 },
    /// failed → queued, resetting all claim bookkeeping.
    Requeue,
}

impl Transition {
    pub fn from_status(&self) -> TaskStatus {
        match self {
            Transition::Claim { .. } => TaskStatus::Queued,
            Transition::Complete { .. } | Transition::Fail { .. } | Transition::AutoFail { .. } => {
                TaskStatus::Running
            }
            Transition::Requeue => TaskStatus::Failed,
        }
    }

    pub fn to_status(&self) -> TaskStatus {
        match self {
            Transition::Claim { .. } => TaskStatus::Running,
            Transition::Complete { .. } => TaskStatus::Succeeded,
            Transition::Fail { .. } | Transition::AutoFail { .. } => TaskStatus::Failed,
            Transition::Requeue => TaskStatus::Queued,
        }
    }

    /// Name used in errors and the audit log.
    pub fn action(&self) -> &'static str {
        match self {
            Transition::Claim { .. } => "claim",
            Transition::Complete { .. } => "complete",
            Transition::Fail { .. } => "fail",
            Transition::AutoFail { .. } => "auto_fail",
            Transition::Requeue => "requeue",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_graph() {
        use TaskStatus::*;

        let legal = [
            (Queued, Running),
            (Running, Succeeded),
            (Running, Failed),
            (Failed, Queued),
        ];
        for from in TaskStatus::ALL {
            for to in TaskStatus::ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    legal.contains(&(from, to)),
                    "{} -> {}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn test_transitions_follow_graph() {
        let transitions = [
            Transition::Claim { worker_id: "w".into() },
            Transition::Complete { result: serde_json::Value::Null },
            Transition::Fail { error: "boom".into() },
            Transition::AutoFail { reason: "late".into(), attempts: 1 },
            Transition::Requeue,
        ];
        for t in transitions {
            assert!(t.from_status().can_transition_to(t.to_status()), "{}", t.action());
        }
    }

    #[test]
    fn test_status_round_trip_strings() {
        for status in TaskStatus::ALL {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("archived".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(TaskStatus::Succeeded.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Queued.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
    }

    #[test]
    fn test_payload_validation() {
        assert!(TaskPayload::new("lint", serde_json::json!({"path": "."})).validate().is_ok());
        assert!(TaskPayload::new("lint", serde_json::json!(["-v"])).validate().is_ok());
        assert!(TaskPayload::new("lint", serde_json::Value::Null).validate().is_ok());

        let err = TaskPayload::new("  ", serde_json::Value::Null).validate().unwrap_err();
        assert!(matches!(err, QueueError::Validation(_)));

        let err = TaskPayload::new("lint", serde_json::json!(42)).validate().unwrap_err();
        assert!(matches!(err, QueueError::Validation(_)));
    }

    #[test]
    fn test_elapsed_falls_back_to_started_at() {
        let now = Utc::now();
        let mut task = Task {
            id: Uuid::new_v4(),
            queue_id: Uuid::new_v4(),
            status: TaskStatus::Running,
            task_class: "FAST_SCRIPT".into(),
            payload: TaskPayload::new("echo", serde_json::Value::Null),
            result: None,
            error: None,
            worker_id: Some("w1".into()),
            session_id: None,
            created_at: now,
            claimed_at: None,
            started_at: Some(now - Duration::seconds(10)),
            finished_at: None,
            stale_warned_at: None,
            attempts: 1,
        };
        assert_eq!(task.elapsed_since_claim(now), Some(Duration::seconds(10)));

        task.claimed_at = Some(now - Duration::seconds(20));
        assert_eq!(task.elapsed_since_claim(now), Some(Duration::seconds(20)));

        task.claimed_at = None;
        task.started_at = None;
        assert_eq!(task.elapsed_since_claim(now), None);
    }

    #[test]
    fn test_filter_builder() {
        let q = Uuid::new_v4();
        let filter = TaskFilter::all().in_queue(q).with_status(TaskStatus::Queued).limit(5);
        assert_eq!(filter.queue_id, Some(q));
        assert_eq!(filter.status, Some(TaskStatus::Queued));
        assert_eq!(filter.limit, Some(5));
    }
}
