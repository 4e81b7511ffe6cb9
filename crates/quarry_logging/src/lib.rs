//! Shared logging utilities for Quarry binaries.
//!
//! Stdout carries MCP protocol frames, so nothing in here ever writes to it.
//! Operational logs go to a size-rotated file under `~/.quarry/logs` and to
//! stderr; optionally they are also forwarded to the connected MCP client
//! through a [`BufferedLogger`].

pub mod buffered;
pub mod file;
pub mod forward;

pub use buffered::{BufferedLogger, LogEntry, LogLevel, LogSink, SinkError, MAX_BUFFER_BYTES};
pub use file::{RotatingLog, RotationPolicy};
pub use forward::{spawn_forwarder, ForwardingLayer};

use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "quarry=info,quarry_mcp=info,quarry_logging=info";
const FORWARD_LOG_FILTER: &str = "quarry=info,quarry_mcp=info";

/// Logging configuration shared by Quarry binaries.
pub struct LogConfig<'a> {
    pub app_name: &'a str,
    pub verbose: bool,
    /// Forward events to the MCP client through a buffered logger.
    pub forward: Option<ForwardingLayer>,
}

/// Initialize tracing with a rolling file writer and stderr output.
pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    let log_dir = ensure_logs_dir().context("Failed to ensure log directory")?;
    let log_file = RotatingLog::open(log_dir, config.app_name, RotationPolicy::default())
        .with_context(|| format!("Failed to open log file for {}", config.app_name))?;

    let file_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    // stderr is visible to whoever launched the server, keep it quiet by default
    let console_filter = if config.verbose {
        file_filter.clone()
    } else {
        EnvFilter::new("warn")
    };

    let forward_layer = config
        .forward
        .map(|layer| layer.with_filter(EnvFilter::new(FORWARD_LOG_FILTER)));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(Mutex::new(log_file))
                .with_ansi(false)
                .with_filter(file_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(console_filter),
        )
        .with(forward_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(())
}

/// Get the Quarry home directory: ~/.quarry
pub fn quarry_home() -> PathBuf {
    if let Ok(override_path) = std::env::var("QUARRY_HOME") {
        return PathBuf::from(override_path);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".quarry")
}

/// Get the logs directory: ~/.quarry/logs
pub fn logs_dir() -> PathBuf {
    quarry_home().join("logs")
}

/// Ensure the logs directory exists.
pub fn ensure_logs_dir() -> Result<PathBuf> {
    let logs = logs_dir();
    fs::create_dir_all(&logs)
        .with_context(|| format!("Failed to create logs directory: {}", logs.display()))?;
    Ok(logs)
}
