//! Stale/auto-fail sweeper.
//!
//! Scans running tasks and compares the time since claim against the task class
//! timeout: past 1× the task is flagged once, past 2× it is failed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Duration;
use tracing::{debug, error, info, warn};

use crate::config::SweeperConfig;
use crate::error::QueueError;
use crate::lifecycle::TaskEngine;
use crate::task::Task;
use crate::task_class::TaskClassRegistry;

#[cfg(test)]
#[path = "sweeper_tests.rs"]
mod tests;

/// Error recorded on tasks failed by the sweeper.
pub const STALE_TIMEOUT_REASON: &str = "stale timeout exceeded";

/// What a sweep should do with one running task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleVerdict {
    /// Within its timeout.
    Fresh,
    /// Past 1× timeout and not yet flagged.
    Warn,
    /// Past 1× timeout and already flagged; nothing to do until 2×.
    AlreadyWarned,
    /// Past 2× timeout.
    AutoFail,
}

impl StaleVerdict {
    /// Boundaries are inclusive: exactly 1× warns, exactly 2× fails.
    pub fn assess(elapsed: Duration, timeout: Duration, warned: bool) -> Self {
        if elapsed >= timeout * 2 {
            StaleVerdict::AutoFail
        } else if elapsed >= timeout {
            if warned {
                StaleVerdict::AlreadyWarned
            } else {
                StaleVerdict::Warn
            }
        } else {
            StaleVerdict::Fresh
        }
    }
}

/// Outcome of one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Running tasks examined.
    pub scanned: usize,
    /// Tasks newly flagged as stale.
    pub warned: usize,
    /// Tasks transitioned to failed.
    pub auto_failed: usize,
    /// Tasks that could not be assessed (unknown class, no claim time, store error)
    /// or changed state under the sweep.
    pub skipped: usize,
}

/// Periodic stale/auto-fail sweeper.
pub struct StaleSweeper {
    engine: Arc<TaskEngine>,
    registry: Arc<TaskClassRegistry>,
    config: SweeperConfig,
    passes: AtomicU64,
}

impl StaleSweeper {
    pub fn new(engine: Arc<TaskEngine>, registry: Arc<TaskClassRegistry>, config: SweeperConfig) -> Self {
        Self {
            engine,
            registry,
            config,
            passes: AtomicU64::new(0),
        }
    }

    /// Completed sweep passes.
    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }

    /// Run one pass over every running task.
    ///
    /// Per-task failures are logged and counted as skipped; only failing to list
    /// running tasks aborts the pass.
    pub async fn run_stale_sweep(&self) -> Result<SweepReport, QueueError> {
        if let Err(e) = self.registry.refresh(self.engine.store().as_ref()).await {
            warn!("Task class refresh failed, using previous snapshot: {}", e);
        }

        let running = self.engine.running_tasks().await?;
        let now = self.engine.now();
        let mut report = SweepReport {
            scanned: running.len(),
            ..SweepReport::default()
        };

        for task in &running {
            match self.sweep_task(task, now).await {
                Ok(Some(StaleVerdict::Warn)) => report.warned += 1,
                Ok(Some(StaleVerdict::AutoFail)) => report.auto_failed += 1,
                Ok(Some(_)) => {}
                Ok(None) => report.skipped += 1,
                Err(e) => {
                    warn!("Stale sweep of task {} failed: {}", task.id, e);
                    report.skipped += 1;
                }
            }
        }

        self.passes.fetch_add(1, Ordering::Relaxed);
        if report.warned > 0 || report.auto_failed > 0 {
            info!(
                "Stale sweep: {} running, {} warned, {} auto-failed",
                report.scanned, report.warned, report.auto_failed
            );
        } else {
            debug!("Stale sweep: {} running, nothing stale", report.scanned);
        }
        Ok(report)
    }

    /// Returns the verdict that was applied, or `None` when the task was skipped.
    async fn sweep_task(
        &self,
        task: &Task,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<Option<StaleVerdict>, QueueError> {
        let Some(timeout) = self.registry.timeout_for(&task.task_class) else {
            warn!(
                "Task {} references unknown task class '{}', skipping",
                task.id, task.task_class
            );
            return Ok(None);
        };
        let Some(elapsed) = task.elapsed_since_claim(now) else {
            warn!("Running task {} has no claim time, skipping", task.id);
            return Ok(None);
        };

        let verdict = StaleVerdict::assess(elapsed, timeout, task.is_stale_warned());
        match verdict {
            StaleVerdict::Fresh | StaleVerdict::AlreadyWarned => Ok(Some(verdict)),
            StaleVerdict::Warn => {
                if self.engine.warn_stale(task).await? {
                    Ok(Some(verdict))
                } else {
                    Ok(None)
                }
            }
            StaleVerdict::AutoFail => match self.engine.auto_fail(task, STALE_TIMEOUT_REASON).await? {
                Some(_) => Ok(Some(verdict)),
                None => Ok(None),
            },
        }
    }

    /// Sweep on a fixed interval until shutdown is signalled.
    pub async fn start_loop(self: Arc<Self>, mut shutdown_rx: tokio::sync::broadcast::Receiver<()>) {
        let interval = self.config.stale_interval();
        info!("Starting stale sweep loop (interval: {:?})", interval);

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.run_stale_sweep().await {
                        error!("Stale sweep failed: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Stale sweep loop shutting down");
                    break;
                }
            }
        }
    }
}
