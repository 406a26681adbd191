use clap::{Parser, Subcommand};
use std::path::PathBuf;

use super::types::LogLevel;

// -----------------------------------------------------------------------------
// ----- Args ------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "pgboundary", version, about = "boundary <-> pgbouncer session bridge")]
pub struct Args {
    // Must exist; no defaults.
    #[arg(long = "config", short = 'c', env = "PGBOUNDARY_CONFIG_FILE")]
    pub config_file: PathBuf,

    // Not required via CLI or ENV (defaults to info).
    #[arg(long = "log", default_value = "info")]
    pub log_level: LogLevel,

    #[command(subcommand)]
    pub command: Cmd,
}

#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// Establish the broker session, start the pooler and bridge until stopped
    Start,
    /// Signal a running bridge to shut down gracefully
    Stop,
    /// Report bridge and pooler state
    Status,
}

impl Args {
    pub fn from_cli() -> Self {
        Args::try_parse().unwrap_or_else(|e| e.exit())
    }
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
