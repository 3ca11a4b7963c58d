// 📜 Logging - console plus an appended pipeline.log
//
// RUST_LOG wins when set; otherwise `info`, or `debug` with --verbose.

use crate::error::{ReconcileError, Result};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub const LOG_FILE_NAME: &str = "pipeline.log";

fn default_filter(verbose: bool) -> EnvFilter {
    let level = if verbose { "debug" } else { "info" };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Install the global subscriber. Returns the log file path.
pub fn init_tracing(logs_dir: &Path, verbose: bool) -> Result<PathBuf> {
    fs::create_dir_all(logs_dir)?;
    let log_path = logs_dir.join(LOG_FILE_NAME);
    let file = OpenOptions::new().create(true).append(true).open(&log_path)?;

    tracing_subscriber::registry()
        .with(default_filter(verbose))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file)),
        )
        .try_init()
        .map_err(|e| ReconcileError::Config(format!("logging already initialised: {}", e)))?;

    Ok(log_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_creates_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs");

        // A second init in the same test binary fails; the file still exists
        let path = match init_tracing(&logs, false) {
            Ok(path) => path,
            Err(_) => logs.join(LOG_FILE_NAME),
        };

        assert!(path.exists());
        assert_eq!(path.file_name().unwrap(), LOG_FILE_NAME);
    }
}
