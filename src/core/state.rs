//! In-memory watch state owned exclusively by the core loop.
//!
//! Per collection the documents form a doubly-linked list ordered by the
//! version at which they last changed, oldest at the head. Nodes live in an
//! arena (`Vec<DocumentState>`) and link through indices, so collection
//! subscription cursors are plain indices that stay valid for the lifetime
//! of the collection. Nodes are never removed: a deleted document keeps its
//! node with `revno == -1`.

use std::collections::BTreeMap;
use std::collections::HashMap;

use tokio::sync::oneshot;
use tracing::debug;
use tracing::error;
use tracing::trace;

use super::SubscriptionId;
use super::WatcherRequest;
use crate::constants::REVNO_DELETED;
use crate::constants::REVNO_MISSING;
use crate::Change;
use crate::DocId;
use crate::WatcherMetrics;

/// True when a point subscription waiting past `target` must fire for a
/// document currently at `current`.
pub(crate) fn fires(
    current: i64,
    target: i64,
) -> bool {
    current > target || (current == REVNO_DELETED && target >= 0)
}

pub(crate) struct WatchState {
    collections: HashMap<String, CollectionState>,
    metrics: WatcherMetrics,
}

struct CollectionState {
    name: String,
    /// Bumped once per accepted change. Starts at 0.
    version: i64,
    docs: Vec<DocumentState>,
    index: HashMap<DocId, usize>,
    head: Option<usize>,
    tail: Option<usize>,
    /// Ordered by id, which is also registration order.
    subscriptions: BTreeMap<SubscriptionId, CollectionSubscription>,
}

struct DocumentState {
    id: DocId,
    revno: i64,
    /// Collection version of the last accepted change; 0 until linked.
    version: i64,
    prev: Option<usize>,
    next: Option<usize>,
    linked: bool,
    waiters: Vec<PointSubscription>,
}

struct PointSubscription {
    target_revno: i64,
    reply: oneshot::Sender<i64>,
}

struct CollectionSubscription {
    last_version: i64,
    cursor: Option<usize>,
    waiting: Option<oneshot::Sender<Change>>,
}

impl WatchState {
    pub(crate) fn new(metrics: WatcherMetrics) -> Self {
        Self {
            collections: HashMap::new(),
            metrics,
        }
    }

    pub(crate) fn handle_request(
        &mut self,
        request: WatcherRequest,
    ) {
        match request {
            WatcherRequest::WatchCollection {
                collection,
                subscription,
            } => self.watch_collection(collection, subscription),
            WatcherRequest::NextCollectionChange {
                collection,
                subscription,
                reply,
            } => self.next_collection_change(&collection, subscription, reply),
            WatcherRequest::UnwatchCollection {
                collection,
                subscription,
            } => self.unwatch_collection(&collection, subscription),
            WatcherRequest::WatchDocument {
                collection,
                id,
                known_revno,
                reply,
            } => self.watch_document(collection, id, known_revno, reply),
        }
    }

    /// Applies one change in log order and wakes whoever it satisfies.
    pub(crate) fn handle_change(
        &mut self,
        change: Change,
    ) {
        let Change {
            collection,
            id,
            revno,
        } = change;

        let coll = collection_entry(&mut self.collections, collection);
        let idx = coll.doc_index(&id);

        if coll.docs[idx].revno == revno {
            trace!("discard duplicate change {}/{} at revno {}", coll.name, id, revno);
            self.metrics
                .changes_deduplicated
                .with_label_values(&[coll.name.as_str()])
                .inc();
            return;
        }

        coll.version += 1;
        let version = coll.version;
        coll.docs[idx].revno = revno;
        coll.docs[idx].version = version;
        coll.move_to_tail(idx);
        trace!("apply change {}/{} revno={} version={}", coll.name, id, revno, version);
        self.metrics
            .changes_applied
            .with_label_values(&[coll.name.as_str()])
            .inc();

        for sub in coll.subscriptions.values_mut() {
            if let Some(reply) = sub.waiting.take() {
                sub.last_version = version;
                sub.cursor = None;
                let _ = reply.send(Change {
                    collection: coll.name.clone(),
                    id: id.clone(),
                    revno,
                });
            }
        }

        let waiters = std::mem::take(&mut coll.docs[idx].waiters);
        let (fired, pending): (Vec<_>, Vec<_>) = waiters
            .into_iter()
            .partition(|w| fires(revno, w.target_revno));
        coll.docs[idx].waiters = pending;
        self.metrics.point_subscriptions.sub(fired.len() as i64);
        for waiter in fired {
            let _ = waiter.reply.send(revno);
        }
    }

    fn watch_collection(
        &mut self,
        collection: String,
        subscription: SubscriptionId,
    ) {
        let coll = collection_entry(&mut self.collections, collection);
        let last_version = coll.version;
        coll.subscriptions.insert(
            subscription,
            CollectionSubscription {
                last_version,
                cursor: None,
                waiting: None,
            },
        );
        debug!(
            "collection subscription {} registered on {} at version {}",
            subscription, coll.name, last_version
        );
        self.metrics.collection_subscriptions.inc();
    }

    fn next_collection_change(
        &mut self,
        collection: &str,
        subscription: SubscriptionId,
        reply: oneshot::Sender<Change>,
    ) {
        let Some(coll) = self.collections.get_mut(collection) else {
            error!("next change requested for unknown collection {}", collection);
            return;
        };

        match coll.take_next(subscription) {
            Some(Some(change)) => {
                let _ = reply.send(change);
            }
            Some(None) => {
                if let Some(sub) = coll.subscriptions.get_mut(&subscription) {
                    sub.waiting = Some(reply);
                }
            }
            None => {
                error!(
                    "next change requested for unknown subscription {} on {}",
                    subscription, collection
                );
            }
        }
    }

    fn unwatch_collection(
        &mut self,
        collection: &str,
        subscription: SubscriptionId,
    ) {
        let removed = self
            .collections
            .get_mut(collection)
            .and_then(|coll| coll.subscriptions.remove(&subscription));

        if removed.is_some() {
            debug!("collection subscription {} on {} removed", subscription, collection);
            self.metrics.collection_subscriptions.dec();
        }
    }

    fn watch_document(
        &mut self,
        collection: String,
        id: DocId,
        known_revno: i64,
        reply: oneshot::Sender<i64>,
    ) {
        let coll = collection_entry(&mut self.collections, collection);
        let idx = coll.doc_index(&id);
        let doc = &mut coll.docs[idx];

        if fires(doc.revno, known_revno) {
            let _ = reply.send(doc.revno);
            return;
        }

        // Handles that gave up leave their reply closed
        let before = doc.waiters.len();
        doc.waiters.retain(|w| !w.reply.is_closed());
        let pruned = before - doc.waiters.len();
        doc.waiters.push(PointSubscription {
            target_revno: known_revno,
            reply,
        });
        trace!("point subscription on {}/{} waits past revno {}", coll.name, id, known_revno);
        self.metrics.point_subscriptions.add(1 - pruned as i64);
    }
}

fn collection_entry(
    collections: &mut HashMap<String, CollectionState>,
    name: String,
) -> &mut CollectionState {
    collections
        .entry(name)
        .or_insert_with_key(|name| CollectionState::new(name.clone()))
}

impl CollectionState {
    fn new(name: String) -> Self {
        Self {
            name,
            version: 0,
            docs: Vec::new(),
            index: HashMap::new(),
            head: None,
            tail: None,
            subscriptions: BTreeMap::new(),
        }
    }

    /// Arena index of `id`, creating an unlinked never-seen node on demand.
    fn doc_index(
        &mut self,
        id: &DocId,
    ) -> usize {
        if let Some(&idx) = self.index.get(id) {
            return idx;
        }
        let idx = self.docs.len();
        self.docs.push(DocumentState {
            id: id.clone(),
            revno: REVNO_MISSING,
            version: 0,
            prev: None,
            next: None,
            linked: false,
            waiters: Vec::new(),
        });
        self.index.insert(id.clone(), idx);
        idx
    }

    fn move_to_tail(
        &mut self,
        idx: usize,
    ) {
        if self.docs[idx].linked {
            if self.tail == Some(idx) {
                return;
            }
            // Cursors parked on the moving node continue with its successor
            let successor = self.docs[idx].next;
            for sub in self.subscriptions.values_mut() {
                if sub.cursor == Some(idx) {
                    sub.cursor = successor;
                }
            }
            self.unlink(idx);
        }

        self.docs[idx].prev = self.tail;
        self.docs[idx].next = None;
        self.docs[idx].linked = true;
        match self.tail {
            Some(tail) => self.docs[tail].next = Some(idx),
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
    }

    fn unlink(
        &mut self,
        idx: usize,
    ) {
        let (prev, next) = (self.docs[idx].prev, self.docs[idx].next);
        match prev {
            Some(p) => self.docs[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.docs[n].prev = prev,
            None => self.tail = prev,
        }
        self.docs[idx].prev = None;
        self.docs[idx].next = None;
        self.docs[idx].linked = false;
    }

    /// Oldest node changed after `last_version`.
    fn find_next(
        &self,
        cursor: Option<usize>,
        last_version: i64,
    ) -> Option<usize> {
        if let Some(idx) = cursor {
            if self.docs[idx].version > last_version {
                return Some(idx);
            }
        }

        let mut candidate = None;
        let mut node = self.tail;
        while let Some(idx) = node {
            let doc = &self.docs[idx];
            if doc.version <= last_version {
                break;
            }
            candidate = Some(idx);
            node = doc.prev;
        }
        candidate
    }

    /// `None` for an unknown subscription, `Some(None)` when it is caught up.
    fn take_next(
        &mut self,
        subscription: SubscriptionId,
    ) -> Option<Option<Change>> {
        let (cursor, last_version) = {
            let sub = self.subscriptions.get(&subscription)?;
            (sub.cursor, sub.last_version)
        };

        let Some(idx) = self.find_next(cursor, last_version) else {
            return Some(None);
        };

        let doc = &self.docs[idx];
        let change = Change {
            collection: self.name.clone(),
            id: doc.id.clone(),
            revno: doc.revno,
        };
        let (version, next) = (doc.version, doc.next);

        let sub = self.subscriptions.get_mut(&subscription)?;
        sub.last_version = version;
        sub.cursor = next;
        Some(Some(change))
    }
}

#[cfg(test)]
impl WatchState {
    pub(crate) fn collection_version(
        &self,
        collection: &str,
    ) -> Option<i64> {
        self.collections.get(collection).map(|c| c.version)
    }

    pub(crate) fn document_revno(
        &self,
        collection: &str,
        id: &DocId,
    ) -> Option<i64> {
        let coll = self.collections.get(collection)?;
        coll.index.get(id).map(|&idx| coll.docs[idx].revno)
    }

    /// `(id, version)` pairs from head to tail.
    pub(crate) fn ordered_documents(
        &self,
        collection: &str,
    ) -> Vec<(DocId, i64)> {
        let mut out = Vec::new();
        if let Some(coll) = self.collections.get(collection) {
            let mut node = coll.head;
            while let Some(idx) = node {
                out.push((coll.docs[idx].id.clone(), coll.docs[idx].version));
                node = coll.docs[idx].next;
            }
        }
        out
    }

    pub(crate) fn pending_point_subscriptions(
        &self,
        collection: &str,
        id: &DocId,
    ) -> usize {
        self.collections
            .get(collection)
            .and_then(|coll| coll.index.get(id).map(|&idx| coll.docs[idx].waiters.len()))
            .unwrap_or(0)
    }

    pub(crate) fn collection_subscription_count(
        &self,
        collection: &str,
    ) -> usize {
        self.collections
            .get(collection)
            .map(|c| c.subscriptions.len())
            .unwrap_or(0)
    }
}
