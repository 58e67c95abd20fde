//! Fleetwatch Error Hierarchy
//!
//! Errors are split by the layer that raises them: configuration loading,
//! the change log storage adaptors, and the watcher engine itself. Only
//! [`WatcherError`] ever crosses task boundaries, so it is cheap to clone.

use config::ConfigError;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration validation or loading failures
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Change log storage failures
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Watcher engine failures, including terminal errors of the core loop
    #[error(transparent)]
    Watcher(#[from] WatcherError),

    /// Unrecoverable failures requiring process termination
    #[error("Fatal error: {0}")]
    Fatal(String),
}

/// Terminal and request-level failures of the watcher engine.
///
/// A terminal error is recorded once by the core loop and then handed to
/// every outstanding and future watch handle.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WatcherError {
    /// The bounded change log dropped entries before they were read.
    /// In-memory state can no longer be trusted; the owner should rebuild.
    #[error("Change log position lost: entries were overwritten before being read")]
    PositionLost,

    /// The change log could not be read
    #[error("Change log read failed: {0}")]
    SourceFailure(String),

    /// The watcher was stopped deliberately
    #[error("Watcher stopped")]
    Stopped,

    /// Rejected at the API boundary, never reaches the core loop
    #[error("Invalid watch target: {0}")]
    InvalidTarget(String),
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Cursor position was overwritten by a wrapped-around bounded log
    #[error("Cursor position lost")]
    PositionLost,

    /// The change log has been closed
    #[error("Change log closed")]
    Closed,

    /// Embedded database errors
    #[error(transparent)]
    SledError(#[from] sled::Error),

    /// Serialization failures for persisted entries
    #[error(transparent)]
    BincodeError(#[from] bincode::Error),

    /// Stored data could not be interpreted
    #[error("Data corruption detected at {location}")]
    DataCorruption { location: String },
}

impl From<StorageError> for WatcherError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::PositionLost => WatcherError::PositionLost,
            other => WatcherError::SourceFailure(other.to_string()),
        }
    }
}

impl Error {
    /// Returns the watcher error carried by this error, if any.
    pub fn as_watcher_error(&self) -> Option<&WatcherError> {
        match self {
            Error::Watcher(e) => Some(e),
            _ => None,
        }
    }
}
