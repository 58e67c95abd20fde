use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tracing::warn;

use super::invalid;
use crate::Result;

/// Core loop and sync task configuration
///
/// # Configuration Example
///
/// ```toml
/// [watcher]
/// request_queue_size = 1024
/// empty_log_retry_interval_ms = 10
/// skip_history = false
/// ```
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WatcherConfig {
    /// Buffer size of the core loop request queue shared by all watch handles
    ///
    /// Requests are still processed one at a time in arrival order; the
    /// buffer only decides how many handles may be parked on a full queue.
    ///
    /// **Default**: 1024
    #[serde(default = "default_request_queue_size")]
    pub request_queue_size: usize,

    /// Pause before reopening a cursor on an empty or exhausted change log
    ///
    /// An empty log is expected at startup, so the sync task retries
    /// indefinitely at this fixed interval.
    ///
    /// **Default**: 10ms
    #[serde(default = "default_empty_log_retry_interval_ms")]
    pub empty_log_retry_interval_ms: u64,

    /// Start tailing at the current end of the change log, ignoring history
    /// written before the watcher started
    ///
    /// **Default**: false
    #[serde(default)]
    pub skip_history: bool,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            request_queue_size: default_request_queue_size(),
            empty_log_retry_interval_ms: default_empty_log_retry_interval_ms(),
            skip_history: false,
        }
    }
}

impl WatcherConfig {
    /// Validates watcher configuration parameters
    pub fn validate(&self) -> Result<()> {
        if self.request_queue_size == 0 {
            return Err(invalid("watcher.request_queue_size must be greater than 0"));
        }

        if self.empty_log_retry_interval_ms == 0 {
            return Err(invalid("watcher.empty_log_retry_interval_ms must be at least 1ms"));
        }

        if self.empty_log_retry_interval_ms > 1000 {
            warn!(
                "watcher.empty_log_retry_interval_ms ({}) is large; changes on a freshly started log will be seen late",
                self.empty_log_retry_interval_ms
            );
        }

        Ok(())
    }

    pub fn empty_log_retry_interval(&self) -> Duration {
        Duration::from_millis(self.empty_log_retry_interval_ms)
    }
}

const fn default_request_queue_size() -> usize {
    1024
}

const fn default_empty_log_retry_interval_ms() -> u64 {
    10
}
