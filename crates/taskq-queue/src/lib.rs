//! # taskq Queue
//!
//! Queue/task storage and lifecycle engine for a single-process, single-database
//! task queue.
//!
//! ## Features
//!
//! - Named FIFO queues persisted in SQLite (WAL)
//! - Compare-and-swap claim protocol (at most one worker per task)
//! - Task state machine: queued → running → succeeded/failed, failed → queued
//! - Stale sweep: warn at 1× class timeout, auto-fail at 2×
//! - Retention purge of terminal tasks
//! - Heartbeat leases for single-runner enforcement
//! - Append-only audit log of every mutation

pub mod audit;
pub mod clock;
pub mod config;
pub mod error;
pub mod lease;
pub mod lifecycle;
pub mod purge;
pub mod queue;
pub mod schema;
pub mod sqlite;
pub mod store;
pub mod sweeper;
pub mod task;
pub mod task_class;

pub use audit::AuditEntry;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{EngineConfig, LeaseConfig, PurgeConfig, StoreConfig, SweeperConfig};
pub use error::QueueError;
pub use lease::{LeaseInfo, RunnerLease};
pub use lifecycle::TaskEngine;
pub use purge::PurgeSweeper;
pub use queue::{NewQueue, Queue, QueueStats, QueueStatus};
pub use sqlite::SqliteTaskStore;
pub use store::{TaskStore, TransitionOutcome};
pub use sweeper::{StaleSweeper, StaleVerdict, SweepReport, STALE_TIMEOUT_REASON};
pub use task::{NewTask, Task, TaskFilter, TaskPayload, TaskStatus, Transition};
pub use task_class::{TaskClass, TaskClassRegistry};
