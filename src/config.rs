use crate::{Result, SyncError};
use std::path::PathBuf;
use std::str::FromStr;

pub const DEFAULT_DW_PATH: &str = "datawarehouse";
pub const DEFAULT_CATALOG: &str = "catalog.json";
pub const DEFAULT_SKIP_INVALID_BLOCKS: usize = 250;
pub const DEFAULT_PAGE_SIZE: usize = 1000;
pub const DEFAULT_LOG_MAX_BYTES: u64 = 100 * 1024 * 1024;
pub const DEFAULT_LOG_BACKUPS: usize = 3;

/// Settings taken from the environment; CLI flags override them
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    pub datawarehouse: PathBuf,
    pub catalog: PathBuf,
    pub api_key: Option<String>,
    /// Blocks behind the head that are never used as a checkpoint
    pub skip_invalid_blocks: usize,
    pub page_size: usize,
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogConfig {
    pub max_bytes: u64,
    pub backup_count: usize,
    pub debug: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_LOG_MAX_BYTES,
            backup_count: DEFAULT_LOG_BACKUPS,
            debug: false,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            datawarehouse: PathBuf::from(DEFAULT_DW_PATH),
            catalog: PathBuf::from(DEFAULT_CATALOG),
            api_key: None,
            skip_invalid_blocks: DEFAULT_SKIP_INVALID_BLOCKS,
            page_size: DEFAULT_PAGE_SIZE,
            log: LogConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Read `DWSYNC_*` variables, loading a `.env` file first when present
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Ok(Self {
            datawarehouse: non_empty("DWSYNC_DW_PATH").map(PathBuf::from).unwrap_or(defaults.datawarehouse),
            catalog: non_empty("DWSYNC_CATALOG").map(PathBuf::from).unwrap_or(defaults.catalog),
            api_key: non_empty("THE_GRAPH_API_KEY"),
            skip_invalid_blocks: parse_or("DWSYNC_SKIP_INVALID_BLOCKS", non_empty("DWSYNC_SKIP_INVALID_BLOCKS"), defaults.skip_invalid_blocks)?,
            page_size: parse_or("DWSYNC_PAGE_SIZE", non_empty("DWSYNC_PAGE_SIZE"), defaults.page_size)?,
            log: LogConfig {
                max_bytes: parse_or("DWSYNC_LOG_MAX_BYTES", non_empty("DWSYNC_LOG_MAX_BYTES"), defaults.log.max_bytes)?,
                backup_count: parse_or("DWSYNC_LOG_BACKUPS", non_empty("DWSYNC_LOG_BACKUPS"), defaults.log.backup_count)?,
                debug: non_empty("DWSYNC_DEBUG").map(|v| is_truthy(&v)).unwrap_or(false),
            },
        })
    }
}

fn parse_or<T: FromStr>(key: &str, raw: Option<String>, default: T) -> Result<T> {
    match raw {
        Some(v) => v
            .trim()
            .parse()
            .map_err(|_| SyncError::Config(format!("{} has an invalid value: {:?}", key, v))),
        None => Ok(default),
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}
