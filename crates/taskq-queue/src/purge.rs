//! Retention purge sweeper.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Duration;
use tracing::{debug, error, info};

use crate::config::PurgeConfig;
use crate::error::QueueError;
use crate::lifecycle::TaskEngine;

#[cfg(test)]
#[path = "purge_tests.rs"]
mod tests;

/// Deletes succeeded and failed tasks once they are past the retention window.
///
/// Queued and running tasks are never touched, however old.
pub struct PurgeSweeper {
    engine: Arc<TaskEngine>,
    config: PurgeConfig,
    total_purged: AtomicU64,
}

impl PurgeSweeper {
    pub fn new(engine: Arc<TaskEngine>, config: PurgeConfig) -> Self {
        Self {
            engine,
            config,
            total_purged: AtomicU64::new(0),
        }
    }

    pub fn retention(&self) -> Duration {
        self.config.retention()
    }

    /// Tasks deleted since this sweeper was created.
    pub fn total_purged(&self) -> u64 {
        self.total_purged.load(Ordering::Relaxed)
    }

    /// One pass with the configured retention.
    pub async fn run_once(&self) -> Result<u64, QueueError> {
        self.purge_older_than(self.retention()).await
    }

    /// One pass with an explicit window.
    pub async fn purge_older_than(&self, older_than: Duration) -> Result<u64, QueueError> {
        let purged = self.engine.purge(older_than).await?;
        self.total_purged.fetch_add(purged, Ordering::Relaxed);

        if purged > 0 {
            info!(
                "Purged {} terminal tasks finished more than {}h ago",
                purged,
                older_than.num_hours()
            );
        } else {
            debug!("Purge pass: nothing older than {}h", older_than.num_hours());
        }
        Ok(purged)
    }

    /// Purge on a fixed interval until shutdown is signalled.
    pub async fn start_loop(self: Arc<Self>, mut shutdown_rx: tokio::sync::broadcast::Receiver<()>) {
        let interval = self.config.interval();
        info!(
            "Starting purge loop (interval: {:?}, retention: {}h)",
            interval, self.config.retention_hours
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.run_once().await {
                        error!("Purge pass failed: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Purge loop shutting down");
                    break;
                }
            }
        }
    }
}
