//! Logging infrastructure for the engine.
//!
//! Provides dual output to both stdout and log files with configurable levels.

use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Log directory name used when no custom directory is supplied
const LOG_DIR_NAME: &str = "logs";

/// Default log level when RUST_LOG is not set
const DEFAULT_LOG_LEVEL: &str = "info";

/// Initializes the logging system with both stdout and file output.
///
/// # Arguments
///
/// * `log_dir` - Optional path to a custom log directory. If `None`, uses a default location.
///
/// # Returns
///
/// A `WorkerGuard` that must be kept alive for the duration of the program
/// to ensure logs are flushed.
pub fn init_logging(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_LEVEL));

    let log_dir = log_dir
        .map(Path::to_path_buf)
        .unwrap_or_else(default_log_dir);

    std::fs::create_dir_all(&log_dir).ok()?;

    // File appender with daily rotation
    let file_appender = tracing_appender::rolling::daily(&log_dir, "agent-session-engine.log");
    let (non_blocking_file, guard) = tracing_appender::non_blocking(file_appender);

    let stdout_layer = fmt::layer()
        .with_writer(std::io::stdout)
        .with_ansi(true)
        .with_filter(env_filter);

    let file_env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_LEVEL));
    let file_layer = fmt::layer()
        .with_writer(non_blocking_file)
        .with_ansi(false)
        .with_filter(file_env_filter);

    tracing_subscriber::registry()
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .ok()?;

    tracing::info!(
        log_dir = %log_dir.display(),
        "Logging system initialized"
    );

    Some(guard)
}

/// Platform-appropriate default log directory for the engine.
fn default_log_dir() -> PathBuf {
    dirs::state_dir()
        .or_else(dirs::data_local_dir)
        .map(|dir| dir.join("agent-session-engine").join(LOG_DIR_NAME))
        .unwrap_or_else(|| PathBuf::from(LOG_DIR_NAME))
}
