//! File logging for the CLI.
//!
//! Logs go to `~/.mutesync/logs/mutesync.log.<date>` (daily rotation) so
//! stdout stays clean for command output. `MUTESYNC_DEBUG_LOG=1` forces
//! debug level; otherwise `RUST_LOG` or `info`.

use fs_err as fs;
use mutesync_core::StorageConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const LOG_FILE_PREFIX: &str = "mutesync.log";

/// Returns the writer guard; logging stops when it is dropped. `None` when
/// the log directory is unavailable (the CLI still runs, unlogged).
pub fn init() -> Option<WorkerGuard> {
    let logs_dir = StorageConfig::resolve().ok()?.logs_dir();
    fs::create_dir_all(&logs_dir).ok()?;

    let appender = tracing_appender::rolling::daily(&logs_dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_writer(writer)
        .with_ansi(false)
        .try_init()
        .ok()?;
    Some(guard)
}

fn filter() -> EnvFilter {
    let debug_enabled = std::env::var("MUTESYNC_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}
