//! Stderr and file logging.
//!
//! The file lives inside the datawarehouse and is rotated by size once the
//! run lock is held: `dwsync.log` becomes `dwsync.log.1`, and so on up to the
//! backup count. A job that loses the race for the lock never touches the
//! log of the job holding it.

use crate::config::LogConfig;
use crate::workspace::ExclusiveWorkspace;
use crate::{Result, SyncError};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

pub const LOG_FILE: &str = "dwsync.log";

pub fn log_path(datawarehouse: &Path) -> PathBuf {
    datawarehouse.join(LOG_FILE)
}

fn backup_path(path: &Path, n: usize) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{}", n));
    PathBuf::from(name)
}

/// Shift `path` into the backups when it reached `max_bytes`. Returns
/// whether a rotation happened.
pub fn rotate(path: &Path, max_bytes: u64, backup_count: usize) -> Result<bool> {
    let size = match fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    if size < max_bytes {
        return Ok(false);
    }

    if backup_count == 0 {
        fs::remove_file(path)?;
        return Ok(true);
    }

    let oldest = backup_path(path, backup_count);
    if oldest.exists() {
        fs::remove_file(&oldest)?;
    }
    for n in (1..backup_count).rev() {
        let from = backup_path(path, n);
        if from.exists() {
            fs::rename(&from, backup_path(path, n + 1))?;
        }
    }
    fs::rename(path, backup_path(path, 1))?;
    Ok(true)
}

/// Install the global subscriber: stderr gets errors (warnings with
/// `debug`), the log file gets everything at info and above. `RUST_LOG`
/// overrides both. The log goes to the published root of `workspace`.
pub fn init(workspace: &ExclusiveWorkspace, config: &LogConfig) -> Result<()> {
    let path = log_path(workspace.root());
    rotate(&path, config.max_bytes, config.backup_count)?;
    let file = OpenOptions::new().create(true).append(true).open(&path)?;

    let stderr_level = if config.debug { LevelFilter::WARN } else { LevelFilter::ERROR };
    let file_level = if config.debug { LevelFilter::DEBUG } else { LevelFilter::INFO };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(env_filter(stderr_level));
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .with_filter(env_filter(file_level));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| SyncError::Other(format!("cannot install logger: {}", e)))
}

fn env_filter(default: LevelFilter) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(default.into())
        .from_env_lossy()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_log_is_not_rotated() {
        let dir = tempfile::tempdir().unwrap();
        let path = log_path(dir.path());
        fs::write(&path, "short").unwrap();
        assert!(!rotate(&path, 1024, 3).unwrap());
        assert!(path.exists());
    }

    #[test]
    fn test_rotation_shifts_backups() {
        let dir = tempfile::tempdir().unwrap();
        let path = log_path(dir.path());
        fs::write(backup_path(&path, 1), "older").unwrap();
        fs::write(backup_path(&path, 2), "oldest").unwrap();
        fs::write(&path, "current log").unwrap();

        assert!(rotate(&path, 4, 2).unwrap());
        assert!(!path.exists());
        assert_eq!(fs::read_to_string(backup_path(&path, 1)).unwrap(), "current log");
        assert_eq!(fs::read_to_string(backup_path(&path, 2)).unwrap(), "older");
        assert!(!backup_path(&path, 3).exists());
    }

    #[test]
    fn test_missing_log_is_fine() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!rotate(&log_path(dir.path()), 1, 3).unwrap());
    }
}
