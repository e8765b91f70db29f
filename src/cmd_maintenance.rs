//! One-shot `sweep` and `purge` subcommands.

use std::sync::Arc;

use tracing::info;

use taskq_queue::{
    Clock, EngineConfig, PurgeSweeper, RunnerLease, StaleSweeper, TaskClassRegistry,
};

use crate::cmd_run::{open_engine, SWEEPER_LEASE};

/// Run one stale sweep while holding the sweeper lease.
pub(crate) async fn sweep(config: EngineConfig) -> Result<(), Box<dyn std::error::Error>> {
    let (store, engine) = open_engine(&config).await?;
    let clock: Arc<dyn Clock> = engine.clock().clone();
    let lease = RunnerLease::new(
        &store,
        SWEEPER_LEASE,
        RunnerLease::default_holder(),
        config.lease.ttl(),
        clock,
    );
    lease.try_acquire().await?;

    let sweeper = StaleSweeper::new(engine, Arc::new(TaskClassRegistry::new()), config.sweeper);
    let result = sweeper.run_stale_sweep().await;
    lease.release().await?;

    let report = result?;
    info!(
        "Stale sweep done: {} running, {} warned, {} auto-failed, {} skipped",
        report.scanned, report.warned, report.auto_failed, report.skipped
    );
    Ok(())
}

/// Run one retention purge while holding the sweeper lease.
pub(crate) async fn purge(
    config: EngineConfig,
    older_than_hours: Option<u64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let (store, engine) = open_engine(&config).await?;
    let clock: Arc<dyn Clock> = engine.clock().clone();
    let lease = RunnerLease::new(
        &store,
        SWEEPER_LEASE,
        RunnerLease::default_holder(),
        config.lease.ttl(),
        clock,
    );
    lease.try_acquire().await?;

    let mut purge_config = config.purge;
    if let Some(hours) = older_than_hours {
        purge_config.retention_hours = hours;
    }
    let sweeper = PurgeSweeper::new(engine, purge_config);
    let result = sweeper.run_once().await;
    lease.release().await?;

    info!("Purge done: {} tasks deleted", result?);
    Ok(())
}
