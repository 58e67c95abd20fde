//! Watch handles: one small task per subscriber, speaking a request/response
//! protocol with the core loop and handing results to a single-slot output.

use std::fmt;
use std::pin::Pin;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use super::SubscriptionId;
use super::WatcherRequest;
use super::WatcherState;
use crate::constants::HANDLE_OUTPUT_CAPACITY;
use crate::Change;
use crate::DocId;
use crate::Error;
use crate::Result;
use crate::WatcherError;

/// Predicate deciding which document ids a collection watch surfaces.
pub type ChangeFilter = Arc<dyn Fn(&DocId) -> bool + Send + Sync>;

/// What a [`WatchHandle`] is watching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchTarget {
    Document { collection: String, id: DocId },
    Collection { collection: String },
}

impl fmt::Display for WatchTarget {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            WatchTarget::Document { collection, id } => write!(f, "{collection}/{id}"),
            WatchTarget::Collection { collection } => write!(f, "{collection}/*"),
        }
    }
}

/// Waits for the core loop to die and returns its terminal error, `None`
/// for a deliberate stop.
pub(crate) async fn wait_dead(state_rx: &mut watch::Receiver<WatcherState>) -> Option<WatcherError> {
    match state_rx.wait_for(WatcherState::is_dead).await {
        Ok(state) => match &*state {
            WatcherState::Dead(e) => e.clone(),
            _ => None,
        },
        Err(_) => Some(WatcherError::SourceFailure(
            "watcher core loop exited without reporting".to_string(),
        )),
    }
}

async fn terminal_error(state_rx: &mut watch::Receiver<WatcherState>) -> WatcherError {
    wait_dead(state_rx).await.unwrap_or(WatcherError::Stopped)
}

/// A handle task's connection to the core loop.
///
/// Every exchange returns `Ok(None)` when the handle was cancelled and
/// `Err` with the terminal error once the core loop is dead.
pub(crate) struct WatcherLink {
    request_tx: mpsc::Sender<WatcherRequest>,
    state_rx: watch::Receiver<WatcherState>,
    next_subscription: Arc<AtomicU64>,
}

impl WatcherLink {
    pub(crate) fn new(
        request_tx: mpsc::Sender<WatcherRequest>,
        state_rx: watch::Receiver<WatcherState>,
        next_subscription: Arc<AtomicU64>,
    ) -> Self {
        Self {
            request_tx,
            state_rx,
            next_subscription,
        }
    }

    fn allocate_subscription(&self) -> SubscriptionId {
        self.next_subscription.fetch_add(1, Ordering::Relaxed)
    }

    async fn send(
        &mut self,
        request: WatcherRequest,
        cancel: &CancellationToken,
    ) -> std::result::Result<Option<()>, WatcherError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Ok(None),
            sent = self.request_tx.send(request) => match sent {
                Ok(()) => Ok(Some(())),
                Err(_) => Err(terminal_error(&mut self.state_rx).await),
            },
            e = terminal_error(&mut self.state_rx) => Err(e),
        }
    }

    async fn receive<T>(
        &mut self,
        reply: oneshot::Receiver<T>,
        cancel: &CancellationToken,
    ) -> std::result::Result<Option<T>, WatcherError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            received = reply => {
                if let Ok(value) = received {
                    return Ok(Some(value));
                }
            }
            e = terminal_error(&mut self.state_rx) => return Err(e),
        }

        // Reply dropped unanswered: the core loop is going away
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Ok(None),
            e = terminal_error(&mut self.state_rx) => Err(e),
        }
    }

    /// Best effort; skipped once the core loop is dying.
    async fn unwatch(
        &mut self,
        collection: String,
        subscription: SubscriptionId,
    ) {
        let request = WatcherRequest::UnwatchCollection {
            collection,
            subscription,
        };
        tokio::select! {
            biased;
            _ = self.state_rx.wait_for(|s| *s != WatcherState::Running) => {}
            _ = self.request_tx.send(request) => {}
        }
    }

    /// Hands `change` to the subscriber. `Ok(false)` once cancelled or
    /// abandoned; core loop death wins over both.
    async fn deliver(
        &mut self,
        out: &mpsc::Sender<Change>,
        change: Change,
        cancel: &CancellationToken,
    ) -> std::result::Result<bool, WatcherError> {
        tokio::select! {
            biased;
            e = terminal_error(&mut self.state_rx) => Err(e),
            _ = cancel.cancelled() => Ok(false),
            sent = out.send(change) => Ok(sent.is_ok()),
        }
    }
}

/// Subscriber side of a document or collection watch.
///
/// Changes are buffered one at a time: the handle does not ask the core
/// loop for the next change until the pending one was taken. The output
/// ends once the handle stops, after which [`WatchHandle::err`] tells why.
pub struct WatchHandle {
    target: WatchTarget,
    changes: mpsc::Receiver<Change>,
    cancel: CancellationToken,
    task: Option<JoinHandle<std::result::Result<(), WatcherError>>>,
    terminal: Arc<Mutex<Option<WatcherError>>>,
}

impl fmt::Debug for WatchHandle {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("WatchHandle")
            .field("target", &self.target)
            .field("stopped", &self.cancel.is_cancelled())
            .finish()
    }
}

impl WatchHandle {
    fn spawn<F, Fut>(
        target: WatchTarget,
        worker: F,
    ) -> Self
    where
        F: FnOnce(mpsc::Sender<Change>, CancellationToken) -> Fut,
        Fut: std::future::Future<Output = std::result::Result<(), WatcherError>> + Send + 'static,
    {
        let (out_tx, changes) = mpsc::channel(HANDLE_OUTPUT_CAPACITY);
        let cancel = CancellationToken::new();
        let terminal = Arc::new(Mutex::new(None));

        let work = worker(out_tx.clone(), cancel.clone());
        let recorded = terminal.clone();
        let name = target.to_string();
        let task = tokio::spawn(async move {
            let result = work.await;
            match &result {
                Ok(()) => trace!("watch {} stopped", name),
                Err(e) => {
                    debug!("watch {} ended: {}", name, e);
                    *recorded.lock() = Some(e.clone());
                }
            }
            // Subscribers see the output end only once the error is readable
            drop(out_tx);
            result
        });

        Self {
            target,
            changes,
            cancel,
            task: Some(task),
            terminal,
        }
    }

    pub fn target(&self) -> &WatchTarget {
        &self.target
    }

    /// Next change, or `None` once the handle has ended.
    pub async fn next(&mut self) -> Option<Change> {
        self.changes.recv().await
    }

    /// The underlying single-slot output.
    pub fn changes(&mut self) -> &mut mpsc::Receiver<Change> {
        &mut self.changes
    }

    /// Asks the handle task to stop and waits for it.
    ///
    /// Returns the terminal error if the handle had already ended because
    /// the core loop died.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            match task.await {
                Ok(_) => {}
                Err(e) => {
                    warn!("watch {} task failed: {}", self.target, e);
                    return Err(Error::Fatal(format!("watch task failed: {e}")));
                }
            }
        }
        match self.err() {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Why the handle ended. `None` while running, or when it was stopped
    /// before the core loop died.
    pub fn err(&self) -> Option<WatcherError> {
        self.terminal.lock().clone()
    }
}

impl Stream for WatchHandle {
    type Item = Change;

    fn poll_next(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Change>> {
        self.get_mut().changes.poll_recv(cx)
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub(crate) fn spawn_document_watch(
    link: WatcherLink,
    collection: String,
    id: DocId,
    known_revno: i64,
) -> WatchHandle {
    let target = WatchTarget::Document {
        collection: collection.clone(),
        id: id.clone(),
    };
    WatchHandle::spawn(target, move |out, cancel| {
        run_document_watch(link, collection, id, known_revno, out, cancel)
    })
}

pub(crate) fn spawn_collection_watch(
    link: WatcherLink,
    collection: String,
    filter: Option<ChangeFilter>,
) -> WatchHandle {
    let target = WatchTarget::Collection {
        collection: collection.clone(),
    };
    WatchHandle::spawn(target, move |out, cancel| {
        run_collection_watch(link, collection, filter, out, cancel)
    })
}

async fn run_document_watch(
    mut link: WatcherLink,
    collection: String,
    id: DocId,
    mut known_revno: i64,
    out: mpsc::Sender<Change>,
    cancel: CancellationToken,
) -> std::result::Result<(), WatcherError> {
    loop {
        let (reply, reply_rx) = oneshot::channel();
        let request = WatcherRequest::WatchDocument {
            collection: collection.clone(),
            id: id.clone(),
            known_revno,
            reply,
        };
        if link.send(request, &cancel).await?.is_none() {
            return Ok(());
        }
        let Some(revno) = link.receive(reply_rx, &cancel).await? else {
            return Ok(());
        };

        known_revno = revno;
        let change = Change::new(collection.clone(), id.clone(), revno);
        if !link.deliver(&out, change, &cancel).await? {
            return Ok(());
        }
    }
}

async fn run_collection_watch(
    mut link: WatcherLink,
    collection: String,
    filter: Option<ChangeFilter>,
    out: mpsc::Sender<Change>,
    cancel: CancellationToken,
) -> std::result::Result<(), WatcherError> {
    let subscription = link.allocate_subscription();
    let request = WatcherRequest::WatchCollection {
        collection: collection.clone(),
        subscription,
    };
    if link.send(request, &cancel).await?.is_none() {
        return Ok(());
    }

    let result = follow_collection(&mut link, &collection, subscription, filter, &out, &cancel).await;
    if result.is_ok() {
        link.unwatch(collection, subscription).await;
    }
    result
}

async fn follow_collection(
    link: &mut WatcherLink,
    collection: &str,
    subscription: SubscriptionId,
    filter: Option<ChangeFilter>,
    out: &mpsc::Sender<Change>,
    cancel: &CancellationToken,
) -> std::result::Result<(), WatcherError> {
    loop {
        let (reply, reply_rx) = oneshot::channel();
        let request = WatcherRequest::NextCollectionChange {
            collection: collection.to_string(),
            subscription,
            reply,
        };
        if link.send(request, cancel).await?.is_none() {
            return Ok(());
        }
        let Some(change) = link.receive(reply_rx, cancel).await? else {
            return Ok(());
        };

        if let Some(filter) = &filter {
            if !filter(&change.id) {
                trace!("filtered out {}/{}", change.collection, change.id);
                continue;
            }
        }
        if !link.deliver(out, change, cancel).await? {
            return Ok(());
        }
    }
}
