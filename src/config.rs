use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Configuration captured when a [`Database`](crate::Database) is opened.
///
/// The record is immutable once the engine has started; [`Database::config`]
/// returns the effective values.
///
/// [`Database::config`]: crate::Database::config
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Number of worker threads executing transaction bodies
    /// (default: hardware concurrency)
    pub max_thread: usize,

    /// Target length of one epoch tick in milliseconds (default: 40)
    pub epoch_duration_ms: u64,

    /// Persist committed epochs to the recovery log (default: true)
    pub enable_logging: bool,

    /// Directory holding `epoch_<E>.log` segments (default: `lineairdb_logs`)
    pub log_directory: PathBuf,

    /// Capacity of the channel handing commits to the logger (default: 4096)
    pub log_channel_capacity: usize,

    /// Spins on a contended slot lock before the committer gives up and
    /// aborts (default: 256)
    pub lock_retry_limit: u32,

    /// How often engine statistics are logged (default: 10s)
    pub stats_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_thread: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            epoch_duration_ms: 40,
            enable_logging: true,
            log_directory: PathBuf::from("lineairdb_logs"),
            log_channel_capacity: 4096,
            lock_retry_limit: 256,
            stats_interval: Duration::from_secs(10),
        }
    }
}

impl Config {
    /// Create a new config with the given worker count
    pub fn new(max_thread: usize) -> Self {
        Self {
            max_thread,
            ..Default::default()
        }
    }

    /// Set the epoch tick length
    pub fn epoch_duration_ms(mut self, millis: u64) -> Self {
        self.epoch_duration_ms = millis;
        self
    }

    /// Enable or disable recovery logging
    pub fn enable_logging(mut self, enabled: bool) -> Self {
        self.enable_logging = enabled;
        self
    }

    /// Set the log directory
    pub fn log_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_directory = dir.into();
        self
    }

    /// Set the logger channel capacity
    pub fn log_channel_capacity(mut self, capacity: usize) -> Self {
        self.log_channel_capacity = capacity;
        self
    }

    /// Set the slot lock retry limit
    pub fn lock_retry_limit(mut self, limit: u32) -> Self {
        self.lock_retry_limit = limit;
        self
    }

    /// Set the stats logging interval
    pub fn stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval = interval;
        self
    }

    pub fn epoch_duration(&self) -> Duration {
        Duration::from_millis(self.epoch_duration_ms)
    }

    /// Rejects values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_thread == 0 {
            return Err(Error::InvalidConfig(
                "max_thread must be positive".to_string(),
            ));
        }
        if self.epoch_duration_ms == 0 {
            return Err(Error::InvalidConfig(
                "epoch_duration_ms must be positive".to_string(),
            ));
        }
        if self.log_channel_capacity == 0 {
            return Err(Error::InvalidConfig(
                "log_channel_capacity must be positive".to_string(),
            ));
        }
        if self.stats_interval.is_zero() {
            return Err(Error::InvalidConfig(
                "stats_interval must be positive".to_string(),
            ));
        }
        if self.enable_logging && self.log_directory.as_os_str().is_empty() {
            return Err(Error::InvalidConfig(
                "log_directory must be set when logging is enabled".to_string(),
            ));
        }
        Ok(())
    }
}
