//! Core model of the change source: a bounded, forward-only log of
//! committed transactions.

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::Deserialize;
use serde::Serialize;

use crate::DocId;
use crate::StorageError;

/// Documents of one collection touched by a transaction.
///
/// `ids[i]` was written at `revnos[i]`. The two vectors are expected to
/// have the same length; the sync task skips entries where they do not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionOps {
    pub collection: String,
    pub ids: Vec<DocId>,
    pub revnos: Vec<i64>,
}

impl CollectionOps {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            ids: Vec::new(),
            revnos: Vec::new(),
        }
    }

    pub fn with(
        mut self,
        id: impl Into<DocId>,
        revno: i64,
    ) -> Self {
        self.ids.push(id.into());
        self.revnos.push(revno);
        self
    }
}

/// One committed multi-document transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Position in the log, strictly increasing
    pub seq: u64,
    pub collections: Vec<CollectionOps>,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChangeLog: Send + Sync + 'static {
    /// Opens a tailing cursor positioned after `after`, or at the oldest
    /// retained entry when `after` is `None`.
    ///
    /// An empty log is not an error: the returned cursor ends immediately
    /// and closes cleanly.
    async fn open_cursor(
        &self,
        after: Option<u64>,
    ) -> Result<Box<dyn ChangeCursor>, StorageError>;

    /// Sequence of the newest entry, if any.
    async fn last_seq(&self) -> Result<Option<u64>, StorageError>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChangeCursor: Send {
    /// Next entry in log order. Waits for new entries once the cursor has
    /// caught up; returns `None` only when the cursor is dead.
    async fn next(&mut self) -> Option<LogEntry>;

    /// Releases the cursor and reports why it died, if it failed.
    /// `StorageError::PositionLost` means the log wrapped around past the
    /// cursor.
    async fn close(&mut self) -> Result<(), StorageError>;
}
