use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default transfer chunk size (64 KiB)
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
const DEFAULT_MAX_WORKERS: usize = 1;
const DEFAULT_MAX_PER_AUTHORITY: usize = 4;
const DEFAULT_IDLE_TTL_SECS: f64 = 60.0;
const DEFAULT_LOG_LEVEL: &str = "info";

#[inline]
fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

#[inline]
fn default_max_workers() -> usize {
    DEFAULT_MAX_WORKERS
}

#[inline]
fn default_max_per_authority() -> usize {
    DEFAULT_MAX_PER_AUTHORITY
}

#[inline]
fn default_idle_ttl_secs() -> f64 {
    DEFAULT_IDLE_TTL_SECS
}

#[inline]
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

/// Manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Reference relative expressions resolve against (defaults to the cwd)
    #[serde(default)]
    pub base_uri: Option<String>,

    /// Bytes per read/write step of a streamed transfer
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Sibling entries processed concurrently inside one tree (1 = sequential)
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Override case sensitivity of wildcard matching on local files
    #[serde(default)]
    pub case_insensitive_local: Option<bool>,

    #[serde(default)]
    pub pool: PoolConfig,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional log file directory (if None, only console logging)
    #[serde(default)]
    pub log_directory: Option<PathBuf>,

    /// Log file rotation strategy
    #[serde(default)]
    pub log_rotation: LogRotation,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            base_uri: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_workers: DEFAULT_MAX_WORKERS,
            case_insensitive_local: None,
            pool: PoolConfig::default(),
            log_level: default_log_level(),
            log_directory: None,
            log_rotation: LogRotation::default(),
        }
    }
}

/// Session pool limits, applied per authority
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_max_per_authority")]
    pub max_per_authority: usize,

    /// Seconds an idle session may wait before it is closed
    #[serde(default = "default_idle_ttl_secs")]
    pub idle_ttl_secs: f64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_per_authority: DEFAULT_MAX_PER_AUTHORITY,
            idle_ttl_secs: DEFAULT_IDLE_TTL_SECS,
        }
    }
}

impl PoolConfig {
    pub fn idle_ttl(&self) -> Duration {
        Duration::try_from_secs_f64(self.idle_ttl_secs).unwrap_or(Duration::ZERO)
    }
}

/// Log file rotation strategy
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LogRotation {
    /// Rotate daily
    #[default]
    Daily,
    /// Rotate hourly
    Hourly,
    /// Never rotate (single file)
    Never,
}
