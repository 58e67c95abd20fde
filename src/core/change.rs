use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::constants::REVNO_DELETED;

/// Identifier of a document inside a collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DocId {
    Str(String),
    Int(i64),
}

impl DocId {
    /// String ids must be non-empty; integer ids are always usable.
    pub fn is_valid(&self) -> bool {
        match self {
            DocId::Str(s) => !s.is_empty(),
            DocId::Int(_) => true,
        }
    }
}

impl fmt::Display for DocId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            DocId::Str(s) => write!(f, "{s}"),
            DocId::Int(i) => write!(f, "{i}"),
        }
    }
}

impl From<&str> for DocId {
    fn from(s: &str) -> Self {
        DocId::Str(s.to_string())
    }
}

impl From<String> for DocId {
    fn from(s: String) -> Self {
        DocId::Str(s)
    }
}

impl From<i64> for DocId {
    fn from(i: i64) -> Self {
        DocId::Int(i)
    }
}

/// A single committed document change.
///
/// `revno == -1` means the document was deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub collection: String,
    pub id: DocId,
    pub revno: i64,
}

impl Change {
    pub fn new(
        collection: impl Into<String>,
        id: impl Into<DocId>,
        revno: i64,
    ) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
            revno,
        }
    }

    pub fn is_delete(&self) -> bool {
        self.revno == REVNO_DELETED
    }
}
