//! Bounded in-memory change log.
//!
//! Behaves like a capped collection: once `capacity` entries are stored the
//! oldest entry is evicted on every append. Cursors that fall behind the
//! eviction point die with [`StorageError::PositionLost`].

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::trace;

use crate::ChangeCursor;
use crate::ChangeLog;
use crate::ChangeLogConfig;
use crate::CollectionOps;
use crate::LogEntry;
use crate::StorageError;

#[derive(Debug)]
struct MemLogState {
    capacity: usize,
    next_seq: u64,
    entries: VecDeque<LogEntry>,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<MemLogState>,
    /// Sequence of the newest entry; wakes tailing cursors
    head_tx: watch::Sender<u64>,
}

#[derive(Debug, Clone)]
pub struct MemChangeLog {
    shared: Arc<Shared>,
}

impl MemChangeLog {
    pub fn new(capacity: usize) -> Self {
        let (head_tx, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(MemLogState {
                    capacity: capacity.max(1),
                    next_seq: 1,
                    entries: VecDeque::new(),
                }),
                head_tx,
            }),
        }
    }

    pub fn from_config(config: &ChangeLogConfig) -> Self {
        Self::new(config.capacity)
    }

    /// Appends one transaction and returns its sequence.
    pub fn append(
        &self,
        collections: Vec<CollectionOps>,
    ) -> u64 {
        let seq = {
            let mut state = self.shared.state.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.entries.push_back(LogEntry { seq, collections });
            while state.entries.len() > state.capacity {
                state.entries.pop_front();
            }
            seq
        };
        trace!("mem change log append: seq={}", seq);
        self.shared.head_tx.send_replace(seq);
        seq
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sequence of the oldest retained entry.
    pub fn first_seq(&self) -> Option<u64> {
        self.shared.state.lock().entries.front().map(|e| e.seq)
    }
}

#[async_trait]
impl ChangeLog for MemChangeLog {
    async fn open_cursor(
        &self,
        after: Option<u64>,
    ) -> Result<Box<dyn ChangeCursor>, StorageError> {
        let head_rx = self.shared.head_tx.subscribe();
        let state = self.shared.state.lock();

        let Some(front) = state.entries.front() else {
            return Ok(Box::new(MemCursor::finished(self.shared.clone(), head_rx, None)));
        };

        let position = after.map(|seq| seq + 1).unwrap_or(front.seq);
        if position < front.seq {
            return Ok(Box::new(MemCursor::finished(
                self.shared.clone(),
                head_rx,
                Some(StorageError::PositionLost),
            )));
        }

        Ok(Box::new(MemCursor {
            shared: self.shared.clone(),
            head_rx,
            position,
            finished: false,
            failure: None,
        }))
    }

    async fn last_seq(&self) -> Result<Option<u64>, StorageError> {
        Ok(self.shared.state.lock().entries.back().map(|e| e.seq))
    }
}

struct MemCursor {
    shared: Arc<Shared>,
    head_rx: watch::Receiver<u64>,
    /// Sequence of the next entry to hand out
    position: u64,
    finished: bool,
    failure: Option<StorageError>,
}

impl MemCursor {
    fn finished(
        shared: Arc<Shared>,
        head_rx: watch::Receiver<u64>,
        failure: Option<StorageError>,
    ) -> Self {
        Self {
            shared,
            head_rx,
            position: 0,
            finished: true,
            failure,
        }
    }

    fn fail(
        &mut self,
        e: StorageError,
    ) {
        self.finished = true;
        self.failure = Some(e);
    }

    fn read_next(&mut self) -> Result<Option<LogEntry>, StorageError> {
        let state = self.shared.state.lock();
        let Some(front) = state.entries.front() else {
            return Ok(None);
        };
        if self.position < front.seq {
            return Err(StorageError::PositionLost);
        }
        let offset = (self.position - front.seq) as usize;
        match state.entries.get(offset) {
            Some(entry) => {
                self.position += 1;
                Ok(Some(entry.clone()))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl ChangeCursor for MemCursor {
    async fn next(&mut self) -> Option<LogEntry> {
        loop {
            if self.finished {
                return None;
            }

            // Mark the current head as seen before reading so an append racing
            // with the read still wakes us below.
            self.head_rx.borrow_and_update();

            match self.read_next() {
                Ok(Some(entry)) => return Some(entry),
                Ok(None) => {}
                Err(e) => {
                    self.fail(e);
                    return None;
                }
            }

            if self.head_rx.changed().await.is_err() {
                self.fail(StorageError::Closed);
                return None;
            }
        }
    }

    async fn close(&mut self) -> Result<(), StorageError> {
        self.finished = true;
        match self.failure.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
