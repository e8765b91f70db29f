//! CLI definitions for taskq.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// taskq CLI.
#[derive(Parser)]
#[command(name = "taskq")]
#[command(about = "Single-writer FIFO task queue engine")]
#[command(version)]
pub(crate) struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config/default.toml", global = true, env = "TASKQ_CONFIG")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Run the stale and purge sweepers in the foreground (default)
    Run,

    /// Run a single stale sweep and exit
    Sweep,

    /// Run a single retention purge and exit
    Purge {
        /// Override the configured retention window
        #[arg(long)]
        older_than_hours: Option<u64>,
    },
}
