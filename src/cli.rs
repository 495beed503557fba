use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "window-counter",
    version,
    about = "Counts requests received in a trailing time window"
)]
pub struct Cli {
    /// Path to configuration file (also settable via WINDOW_COUNTER_CONFIG env var)
    #[arg(short, long, default_value = "config.toml", env = "WINDOW_COUNTER_CONFIG")]
    pub config: PathBuf,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Serve the counter over HTTP (default)
    Serve,
    /// Validate configuration and print the effective settings
    CheckConfig,
}
