// -
// Revision sentinels

/// Revno recorded for a document that has been removed.
pub const REVNO_DELETED: i64 = -1;

/// Revno of a document the watcher has never seen a change for.
pub const REVNO_MISSING: i64 = -2;

// -
// Channel sizes

/// Sync task to core loop handoff. Kept at one so the sync task can never
/// run ahead of the core loop.
pub(crate) const CHANGE_HANDOFF_CAPACITY: usize = 1;

/// Watch handle output. One pending value, the next request waits until the
/// subscriber takes it.
pub(crate) const HANDLE_OUTPUT_CAPACITY: usize = 1;

// -
// Sled namespaces

pub(crate) const CHANGE_LOG_TREE: &str = "_fleetwatch_change_log";
