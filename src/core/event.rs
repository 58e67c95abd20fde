use tokio::sync::oneshot;

use crate::Change;
use crate::DocId;

/// Identifies a collection subscription. Allocated by the watch handle
/// before registration so the handle can always unregister what it sent.
pub(crate) type SubscriptionId = u64;

/// Requests served by the core loop, strictly one at a time in arrival order.
#[derive(Debug)]
pub(crate) enum WatcherRequest {
    /// Register a long-lived collection subscription at the collection's
    /// current version.
    WatchCollection {
        collection: String,
        subscription: SubscriptionId,
    },

    /// Deliver the next undelivered change of a collection subscription.
    /// Parked in the subscription when it is caught up.
    NextCollectionChange {
        collection: String,
        subscription: SubscriptionId,
        reply: oneshot::Sender<Change>,
    },

    /// Drop a collection subscription. Idempotent.
    UnwatchCollection {
        collection: String,
        subscription: SubscriptionId,
    },

    /// One-shot: resolves with the document's revno once it is newer than
    /// `known_revno`, or once it is deleted.
    WatchDocument {
        collection: String,
        id: DocId,
        known_revno: i64,
        reply: oneshot::Sender<i64>,
    },
}
