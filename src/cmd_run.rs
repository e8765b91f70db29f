//! `taskq run`: long-running sweeper process.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{error, info, warn};

use taskq_queue::{
    Clock, EngineConfig, PurgeSweeper, RunnerLease, SqliteTaskStore, StaleSweeper, TaskClassRegistry,
    TaskEngine,
};

/// Lease guarding the sweepers of one database.
pub(crate) const SWEEPER_LEASE: &str = "sweepers";

/// Open the store and seed task classes from config.
pub(crate) async fn open_engine(
    config: &EngineConfig,
) -> Result<(Arc<SqliteTaskStore>, Arc<TaskEngine>), Box<dyn std::error::Error>> {
    let store = Arc::new(SqliteTaskStore::open_with_config(&config.store).await?);
    let engine = Arc::new(TaskEngine::with_system_clock(store.clone()));
    engine.seed_task_classes(&config.task_classes).await?;
    Ok((store, engine))
}

/// Run both sweepers until SIGINT/SIGTERM or until the lease is lost.
pub(crate) async fn run(config: EngineConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!("Starting taskq v{}", env!("CARGO_PKG_VERSION"));
    info!("Database: {}", config.store.db_path.display());

    let (store, engine) = open_engine(&config).await?;
    let clock: Arc<dyn Clock> = engine.clock().clone();

    let lease = Arc::new(RunnerLease::new(
        &store,
        SWEEPER_LEASE,
        RunnerLease::default_holder(),
        config.lease.ttl(),
        clock,
    ));
    if let Err(e) = lease.try_acquire().await {
        error!("Another runner owns this database: {}", e);
        return Err(e.into());
    }

    let registry = Arc::new(TaskClassRegistry::new());
    let stale = Arc::new(StaleSweeper::new(
        engine.clone(),
        registry,
        config.sweeper.clone(),
    ));
    let purge = Arc::new(PurgeSweeper::new(engine.clone(), config.purge.clone()));

    // Catch up on anything that went stale or expired while no runner was up.
    if let Err(e) = stale.run_stale_sweep().await {
        warn!("Initial stale sweep failed: {}", e);
    }
    if let Err(e) = purge.run_once().await {
        warn!("Initial purge failed: {}", e);
    }

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let stale_handle = tokio::spawn(stale.clone().start_loop(shutdown_tx.subscribe()));
    let purge_handle = tokio::spawn(purge.clone().start_loop(shutdown_tx.subscribe()));
    let mut heartbeat = tokio::spawn(
        lease
            .clone()
            .heartbeat_loop(config.lease.heartbeat_interval(), shutdown_tx.subscribe()),
    );

    info!("taskq runner ready");

    let early_exit = tokio::select! {
        _ = wait_for_shutdown() => None,
        result = &mut heartbeat => Some(result),
    };
    if early_exit.is_some() {
        error!("Lease heartbeat stopped, shutting down sweepers");
    }

    let _ = shutdown_tx.send(());
    stale_handle.await?;
    purge_handle.await?;

    let heartbeat_result = match early_exit {
        Some(result) => result,
        None => heartbeat.await,
    };
    heartbeat_result??;

    info!(
        "taskq runner stopped ({} stale passes, {} tasks purged)",
        stale.passes(),
        purge.total_purged()
    );
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            info!("Received Ctrl+C");
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
        _ = sigterm.recv() => info!("Received SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Received Ctrl+C");
}
