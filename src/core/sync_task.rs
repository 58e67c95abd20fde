//! Tails the change log and feeds decoded changes to the core loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::trace;
use tracing::warn;

use crate::Change;
use crate::ChangeCursor;
use crate::ChangeLog;
use crate::LogEntry;
use crate::WatcherConfig;
use crate::WatcherError;
use crate::WatcherMetrics;

/// Shape problems that make a log entry unusable as a whole.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub(crate) enum MalformedEntry {
    #[error("collection {collection} lists {ids} ids but {revnos} revnos")]
    ArityMismatch {
        collection: String,
        ids: usize,
        revnos: usize,
    },

    #[error("entry names an empty collection")]
    EmptyCollection,

    #[error("entry carries no collections")]
    NoCollections,
}

/// Expands one transaction into per-document changes, preserving the order
/// of collections and of documents within each collection.
///
/// A committed transaction always touches at least one collection, so an
/// entry without any is malformed.
pub(crate) fn decode_entry(entry: &LogEntry) -> Result<Vec<Change>, MalformedEntry> {
    if entry.collections.is_empty() {
        return Err(MalformedEntry::NoCollections);
    }
    let mut changes = Vec::new();
    for ops in &entry.collections {
        if ops.collection.is_empty() {
            return Err(MalformedEntry::EmptyCollection);
        }
        if ops.ids.len() != ops.revnos.len() {
            return Err(MalformedEntry::ArityMismatch {
                collection: ops.collection.clone(),
                ids: ops.ids.len(),
                revnos: ops.revnos.len(),
            });
        }
        changes.extend(
            ops.ids
                .iter()
                .zip(&ops.revnos)
                .map(|(id, &revno)| Change::new(ops.collection.clone(), id.clone(), revno)),
        );
    }
    Ok(changes)
}

enum DrainOutcome {
    /// Cursor ended on its own; close it to learn why
    Exhausted,
    /// Cancelled, or the core loop went away
    Stopped,
}

pub(crate) struct SyncTask {
    log: Arc<dyn ChangeLog>,
    change_tx: mpsc::Sender<Change>,
    cancel: CancellationToken,
    retry_interval: Duration,
    skip_history: bool,
    last_seq: Option<u64>,
    metrics: WatcherMetrics,
}

impl SyncTask {
    pub(crate) fn new(
        log: Arc<dyn ChangeLog>,
        change_tx: mpsc::Sender<Change>,
        cancel: CancellationToken,
        config: &WatcherConfig,
        metrics: WatcherMetrics,
    ) -> Self {
        Self {
            log,
            change_tx,
            cancel,
            retry_interval: config.empty_log_retry_interval(),
            skip_history: config.skip_history,
            last_seq: None,
            metrics,
        }
    }

    /// Runs until cancelled (`Ok`) or until the log fails (`Err`).
    pub(crate) async fn run(mut self) -> Result<(), WatcherError> {
        info!("sync task started");

        let result = self.tail().await;

        match &result {
            Ok(()) => debug!("sync task stopped at seq {:?}", self.last_seq),
            Err(e) => error!("sync task failed at seq {:?}: {}", self.last_seq, e),
        }
        result
    }

    async fn tail(&mut self) -> Result<(), WatcherError> {
        if self.skip_history {
            self.last_seq = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(()),
                last = self.log.last_seq() => last?,
            };
            debug!("skipping change log history up to seq {:?}", self.last_seq);
        }

        loop {
            let mut cursor = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(()),
                opened = self.log.open_cursor(self.last_seq) => opened?,
            };

            let outcome = self.drain(cursor.as_mut()).await;
            let closed = cursor.close().await;

            if let DrainOutcome::Stopped = outcome {
                return Ok(());
            }
            closed?;

            trace!("change log exhausted after seq {:?}; reopening", self.last_seq);
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(()),
                _ = sleep(self.retry_interval) => {}
            }
        }
    }

    async fn drain(
        &mut self,
        cursor: &mut dyn ChangeCursor,
    ) -> DrainOutcome {
        loop {
            let entry = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return DrainOutcome::Stopped,
                entry = cursor.next() => entry,
            };
            let Some(entry) = entry else {
                return DrainOutcome::Exhausted;
            };
            self.last_seq = Some(entry.seq);

            let changes = match decode_entry(&entry) {
                Ok(changes) => changes,
                Err(e) => {
                    warn!("skipping malformed change log entry {}: {}", entry.seq, e);
                    self.metrics.malformed_entries.inc();
                    continue;
                }
            };

            for change in changes {
                let sent = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return DrainOutcome::Stopped,
                    sent = self.change_tx.send(change) => sent,
                };
                if sent.is_err() {
                    debug!("core loop dropped the change channel");
                    return DrainOutcome::Stopped;
                }
            }
        }
    }
}
