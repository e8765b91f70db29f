//! taskq - single-writer FIFO task queue engine
//!
//! Main entry point for the taskq runner and maintenance commands.

mod cli;
mod cmd_maintenance;
mod cmd_run;
mod config_loader;

use std::path::Path;

use clap::Parser;
use tracing::{info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cli::{Cli, Commands};
use config_loader::ConfigLoader;

fn init_tracing(log_dir: &Path) -> Result<(), Box<dyn std::error::Error>> {
    std::fs::create_dir_all(log_dir)?;

    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("taskq")
        .filename_suffix("log")
        .max_log_files(14)
        .build(log_dir)?;

    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // Keeps the background writer alive for the life of the process.
    static GUARD: std::sync::OnceLock<tracing_appender::non_blocking::WorkerGuard> =
        std::sync::OnceLock::new();
    let _ = GUARD.set(guard);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true).with_ansi(true))
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .init();

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = ConfigLoader::load_or_default(&cli.config)?;
    let log_dir = config
        .store
        .db_path
        .parent()
        .map(|dir| dir.join("logs"))
        .unwrap_or_else(|| Path::new("logs").to_path_buf());
    init_tracing(&log_dir)?;

    if cli.config.exists() {
        info!("Loaded configuration from {}", cli.config.display());
    } else {
        warn!(
            "Config file {} not found, using defaults",
            cli.config.display()
        );
    }

    match cli.command {
        None | Some(Commands::Run) => cmd_run::run(config).await,
        Some(Commands::Sweep) => cmd_maintenance::sweep(config).await,
        Some(Commands::Purge { older_than_hours }) => {
            cmd_maintenance::purge(config, older_than_hours).await
        }
    }
}
