//! CLI argument definitions using clap.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Pedal Relay - live cycling sensor telemetry
#[derive(Parser, Debug)]
#[command(
    name = "pedal-relay",
    author,
    version,
    about = "Live cycling sensor telemetry relay",
    long_about = "Connects to power, speed, cadence and heart-rate sensors, merges their\n\
                  readings into one ride timeline and streams it to viewers over\n\
                  WebSocket, replaying the ride so far to anyone who joins late."
)]
pub struct Cli {
    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true, env = "PEDAL_RELAY_VERBOSE")]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Log output format
    #[arg(
        long,
        value_enum,
        default_value = "pretty",
        global = true,
        env = "PEDAL_RELAY_LOG_FORMAT"
    )]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Record a ride and serve it to viewers
    Ride(RideArgs),

    /// Follow a ride served by another relay
    Watch(WatchArgs),

    /// Validate configuration file without running
    Validate(ValidateArgs),

    /// Display configuration information
    Info(InfoArgs),
}

/// Arguments for the `ride` command
#[derive(Parser, Debug, Clone)]
pub struct RideArgs {
    /// Path to configuration file (TOML or JSON)
    #[arg(short, long, default_value = "ride.toml", env = "PEDAL_RELAY_CONFIG")]
    pub config: PathBuf,

    /// Use simulated sensors instead of Bluetooth
    #[arg(long, env = "PEDAL_RELAY_SIMULATE")]
    pub simulate: bool,

    /// Override the viewer server address (host:port)
    #[arg(long, env = "PEDAL_RELAY_BIND")]
    pub bind: Option<String>,

    /// Write the completed ride to this directory
    #[arg(long, env = "PEDAL_RELAY_RECORD_DIR")]
    pub record: Option<PathBuf>,

    /// Name appended to the recorded file
    #[arg(long)]
    pub name: Option<String>,

    /// Override the ride duration in minutes
    #[arg(long)]
    pub minutes: Option<f64>,

    /// Per-device reading buffer size
    #[arg(long, default_value = "256", env = "PEDAL_RELAY_BUFFER_SIZE")]
    pub buffer_size: usize,

    /// Metrics server port (0 = disabled)
    #[arg(long, default_value = "0", env = "PEDAL_RELAY_METRICS_PORT")]
    pub metrics_port: u16,

    /// Validate configuration and exit without riding
    #[arg(long)]
    pub dry_run: bool,
}

/// Arguments for the `watch` command
#[derive(Parser, Debug, Clone)]
pub struct WatchArgs {
    /// Relay WebSocket URL
    #[arg(long, default_value = "ws://127.0.0.1:8000", env = "PEDAL_RELAY_URL")]
    pub url: String,

    /// Give up after this many consecutive failed connections (0 = never)
    #[arg(long, default_value = "0")]
    pub max_retries: u32,

    /// Wait between reconnection attempts, in seconds
    #[arg(long, default_value = "2")]
    pub retry_secs: u64,
}

/// Arguments for the `validate` command
#[derive(Parser, Debug)]
pub struct ValidateArgs {
    /// Path to configuration file to validate
    #[arg(short, long, default_value = "ride.toml")]
    pub config: PathBuf,

    /// Output validation result as JSON
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the `info` command
#[derive(Parser, Debug)]
pub struct InfoArgs {
    /// Path to configuration file
    #[arg(short, long, default_value = "ride.toml")]
    pub config: PathBuf,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,

    /// Show simulator settings per device
    #[arg(long)]
    pub simulation: bool,
}

/// Log output format
#[derive(ValueEnum, Clone, Debug, Default)]
pub enum LogFormat {
    /// JSON structured logging
    Json,
    /// Human-readable pretty format
    #[default]
    Pretty,
    /// Compact single-line format
    Compact,
}

impl From<LogFormat> for observability::LogFormat {
    fn from(format: LogFormat) -> Self {
        match format {
            LogFormat::Json => observability::LogFormat::Json,
            LogFormat::Pretty => observability::LogFormat::Pretty,
            LogFormat::Compact => observability::LogFormat::Compact,
        }
    }
}
