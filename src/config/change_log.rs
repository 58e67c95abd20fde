use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use super::invalid;
use crate::Result;

/// Change log adaptor configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ChangeLogConfig {
    /// Number of entries retained before the oldest ones are overwritten
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Directory of the sled-backed change log
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

impl Default for ChangeLogConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            db_path: default_db_path(),
        }
    }
}

impl ChangeLogConfig {
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(invalid("change_log.capacity must be greater than 0"));
        }

        if self.db_path.as_os_str().is_empty() {
            return Err(invalid("change_log.db_path cannot be empty"));
        }

        Ok(())
    }
}

fn default_capacity() -> usize {
    10_000
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./db/changelog")
}
