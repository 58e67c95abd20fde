//! The watcher engine: a single core loop owning all watch state, fed by the
//! sync task and by watch handle requests.
//!
//! ```text
//!   ChangeLog ──► SyncTask ──(change, cap 1)──► Core loop ◄──(requests)── handles
//! ```
//!
//! Lifecycle is published through a `watch` channel: `Running`, then `Dying`
//! while the sync task is torn down, then `Dead` carrying the terminal error.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::handle::spawn_collection_watch;
use super::handle::spawn_document_watch;
use super::handle::wait_dead;
use super::handle::WatcherLink;
use super::ChangeFilter;
use super::SyncTask;
use super::WatchHandle;
use super::WatchState;
use super::WatcherRequest;
use crate::constants::CHANGE_HANDOFF_CAPACITY;
use crate::Change;
use crate::ChangeLog;
use crate::DocId;
use crate::Result;
use crate::WatcherConfig;
use crate::WatcherError;
use crate::WatcherMetrics;

/// Lifecycle of the core loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatcherState {
    Running,
    /// Kill observed or the sync task ended; tearing down
    Dying,
    /// Terminal. `None` for a deliberate stop.
    Dead(Option<WatcherError>),
}

impl WatcherState {
    pub fn is_dead(&self) -> bool {
        matches!(self, WatcherState::Dead(_))
    }
}

/// Multiplexes one change log into per-document and per-collection change
/// notifications.
///
/// Dropping the watcher kills the core loop. Handles already created keep
/// their buffered value and then end with [`WatcherError::Stopped`].
pub struct Watcher {
    request_tx: mpsc::Sender<WatcherRequest>,
    state_rx: watch::Receiver<WatcherState>,
    kill: CancellationToken,
    next_subscription: Arc<AtomicU64>,
    metrics: WatcherMetrics,
}

impl std::fmt::Debug for Watcher {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("state", &*self.state_rx.borrow())
            .finish()
    }
}

impl Watcher {
    /// Spawns the sync task and the core loop. Must be called from within a
    /// Tokio runtime.
    pub fn start(
        log: Arc<dyn ChangeLog>,
        config: WatcherConfig,
    ) -> Result<Self> {
        config.validate()?;
        let metrics = WatcherMetrics::new()?;

        let (request_tx, request_rx) = mpsc::channel(config.request_queue_size);
        let (change_tx, change_rx) = mpsc::channel(CHANGE_HANDOFF_CAPACITY);
        let (state_tx, state_rx) = watch::channel(WatcherState::Running);
        let kill = CancellationToken::new();
        let sync_cancel = CancellationToken::new();

        let sync = SyncTask::new(log, change_tx, sync_cancel.clone(), &config, metrics.clone());
        let sync_handle = tokio::spawn(sync.run());

        let core = CoreLoop {
            state: WatchState::new(metrics.clone()),
            request_rx,
            change_rx,
            kill: kill.clone(),
            sync_cancel,
            state_tx,
        };
        tokio::spawn(core.run(sync_handle));
        info!("watcher started with {:?}", config);

        Ok(Self {
            request_tx,
            state_rx,
            kill,
            next_subscription: Arc::new(AtomicU64::new(1)),
            metrics,
        })
    }

    /// Waits for `id` to move past `known_revno`.
    ///
    /// The handle yields the new revno as a [`Change`] each time the
    /// document moves on, using the last delivered revno as the next
    /// baseline. A deletion is reported once as `-1`.
    pub fn watch_document(
        &self,
        collection: impl Into<String>,
        id: impl Into<DocId>,
        known_revno: i64,
    ) -> Result<WatchHandle> {
        let collection = collection.into();
        let id = id.into();
        validate_collection(&collection)?;
        if !id.is_valid() {
            return Err(WatcherError::InvalidTarget(format!("empty document id in {collection}")).into());
        }

        debug!("watch document {}/{} past revno {}", collection, id, known_revno);
        Ok(spawn_document_watch(self.link(), collection, id, known_revno))
    }

    /// Streams every change of `collection` made after this call.
    pub fn watch_collection(
        &self,
        collection: impl Into<String>,
    ) -> Result<WatchHandle> {
        self.start_collection_watch(collection.into(), None)
    }

    /// Like [`Watcher::watch_collection`], delivering only ids accepted by
    /// `filter`.
    pub fn watch_collection_filtered<F>(
        &self,
        collection: impl Into<String>,
        filter: F,
    ) -> Result<WatchHandle>
    where
        F: Fn(&DocId) -> bool + Send + Sync + 'static,
    {
        self.start_collection_watch(collection.into(), Some(Arc::new(filter)))
    }

    fn start_collection_watch(
        &self,
        collection: String,
        filter: Option<ChangeFilter>,
    ) -> Result<WatchHandle> {
        validate_collection(&collection)?;
        debug!("watch collection {}", collection);
        Ok(spawn_collection_watch(self.link(), collection, filter))
    }

    /// Kills the core loop and waits for it to finish.
    ///
    /// Returns the terminal error if the loop had already failed.
    pub async fn stop(&self) -> Result<()> {
        self.kill.cancel();
        match self.wait().await {
            None => Ok(()),
            Some(e) => Err(e.into()),
        }
    }

    /// Waits for the core loop to die and returns its terminal error.
    pub async fn wait(&self) -> Option<WatcherError> {
        let mut state_rx = self.state_rx.clone();
        wait_dead(&mut state_rx).await
    }

    /// Terminal error, once dead. `None` while running or after a clean stop.
    pub fn err(&self) -> Option<WatcherError> {
        match &*self.state_rx.borrow() {
            WatcherState::Dead(e) => e.clone(),
            _ => None,
        }
    }

    pub fn state(&self) -> WatcherState {
        self.state_rx.borrow().clone()
    }

    pub fn metrics(&self) -> &WatcherMetrics {
        &self.metrics
    }

    fn link(&self) -> WatcherLink {
        WatcherLink::new(
            self.request_tx.clone(),
            self.state_rx.clone(),
            self.next_subscription.clone(),
        )
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.kill.cancel();
    }
}

fn validate_collection(collection: &str) -> Result<()> {
    if collection.is_empty() {
        return Err(WatcherError::InvalidTarget("empty collection name".to_string()).into());
    }
    Ok(())
}

enum LoopExit {
    Killed,
    SyncEnded(std::result::Result<(), WatcherError>),
}

struct CoreLoop {
    state: WatchState,
    request_rx: mpsc::Receiver<WatcherRequest>,
    change_rx: mpsc::Receiver<Change>,
    kill: CancellationToken,
    sync_cancel: CancellationToken,
    state_tx: watch::Sender<WatcherState>,
}

impl CoreLoop {
    async fn run(
        mut self,
        mut sync_handle: JoinHandle<std::result::Result<(), WatcherError>>,
    ) {
        info!("watcher core loop started");
        let exit = self.event_loop(&mut sync_handle).await;

        self.state_tx.send_replace(WatcherState::Dying);
        self.sync_cancel.cancel();

        let terminal = match exit {
            LoopExit::Killed => {
                match sync_handle.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => debug!("sync task error during stop ignored: {}", e),
                    Err(e) => warn!("sync task did not finish cleanly: {}", e),
                }
                None
            }
            LoopExit::SyncEnded(Ok(())) => Some(WatcherError::SourceFailure(
                "sync task ended unexpectedly".to_string(),
            )),
            LoopExit::SyncEnded(Err(e)) => Some(e),
        };

        let CoreLoop {
            state,
            mut request_rx,
            change_rx,
            state_tx,
            ..
        } = self;
        request_rx.close();
        drop(change_rx);
        // Pending replies are dropped here; handles then read the terminal state
        drop(state);

        match &terminal {
            None => info!("watcher core loop stopped"),
            Some(e) => error!("watcher core loop died: {}", e),
        }
        state_tx.send_replace(WatcherState::Dead(terminal));
    }

    async fn event_loop(
        &mut self,
        sync_handle: &mut JoinHandle<std::result::Result<(), WatcherError>>,
    ) -> LoopExit {
        loop {
            tokio::select! {
                // Use biased to ensure branch order
                biased;
                // P0: kill
                _ = self.kill.cancelled() => {
                    info!("watcher kill signal received");
                    return LoopExit::Killed;
                }
                // P1: sync task ended on its own
                joined = &mut *sync_handle => {
                    let result = match joined {
                        Ok(result) => result,
                        Err(e) => Err(WatcherError::SourceFailure(format!("sync task aborted: {e}"))),
                    };
                    return LoopExit::SyncEnded(result);
                }
                // P2: handle requests
                Some(request) = self.request_rx.recv() => {
                    self.state.handle_request(request);
                }
                // P3: changes from the log
                Some(change) = self.change_rx.recv() => {
                    self.state.handle_change(change);
                }
            }
        }
    }
}
