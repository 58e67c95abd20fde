//! Durable capped change log on top of a sled tree.
//!
//! Keys are big-endian sequences so tree order is log order. Values are the
//! bincode-encoded `Vec<CollectionOps>` of the transaction.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use sled::IVec;
use sled::Tree;
use tokio::sync::watch;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use crate::constants::CHANGE_LOG_TREE;
use crate::ChangeCursor;
use crate::ChangeLog;
use crate::ChangeLogConfig;
use crate::CollectionOps;
use crate::LogEntry;
use crate::StorageError;

struct Shared {
    db: sled::Db,
    tree: Tree,
    capacity: u64,
    /// Guards sequence allocation together with the insert/evict pair
    next_seq: Mutex<u64>,
    head_tx: watch::Sender<u64>,
}

#[derive(Clone)]
pub struct SledChangeLog {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for SledChangeLog {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("SledChangeLog")
            .field("capacity", &self.shared.capacity)
            .field("next_seq", &*self.shared.next_seq.lock())
            .finish()
    }
}

impl SledChangeLog {
    /// Opens (or creates) the log at `path`, trimming it down to `capacity`
    /// entries if it was written with a larger capacity before.
    pub fn open(
        path: impl AsRef<Path>,
        capacity: usize,
    ) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let db = sled::open(path)?;
        let tree = db.open_tree(CHANGE_LOG_TREE)?;
        let capacity = capacity.max(1) as u64;

        while tree.len() as u64 > capacity {
            tree.pop_min()?;
        }

        let last_seq = match tree.last()? {
            Some((key, _)) => decode_seq(&key)?,
            None => 0,
        };
        info!(
            "sled change log opened at {} (last_seq={}, capacity={})",
            path.display(),
            last_seq,
            capacity
        );

        let (head_tx, _) = watch::channel(last_seq);
        Ok(Self {
            shared: Arc::new(Shared {
                db,
                tree,
                capacity,
                next_seq: Mutex::new(last_seq + 1),
                head_tx,
            }),
        })
    }

    pub fn from_config(config: &ChangeLogConfig) -> Result<Self, StorageError> {
        Self::open(&config.db_path, config.capacity)
    }

    /// Appends one transaction and returns its sequence.
    pub fn append(
        &self,
        collections: Vec<CollectionOps>,
    ) -> Result<u64, StorageError> {
        let value = bincode::serialize(&collections)?;
        self.append_value(value)
    }

    fn append_value(
        &self,
        value: Vec<u8>,
    ) -> Result<u64, StorageError> {
        let seq = {
            let mut next_seq = self.shared.next_seq.lock();
            let seq = *next_seq;
            self.shared.tree.insert(seq.to_be_bytes(), value)?;
            if seq > self.shared.capacity {
                self.shared.tree.remove((seq - self.shared.capacity).to_be_bytes())?;
            }
            *next_seq += 1;
            seq
        };
        trace!("sled change log append: seq={}", seq);
        self.shared.head_tx.send_replace(seq);
        Ok(seq)
    }

    /// Appends a raw stored value, bypassing encoding.
    #[cfg(test)]
    pub(crate) fn append_raw(
        &self,
        value: &[u8],
    ) -> Result<u64, StorageError> {
        self.append_value(value.to_vec())
    }

    pub fn len(&self) -> usize {
        self.shared.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.tree.is_empty()
    }

    pub async fn flush(&self) -> Result<(), StorageError> {
        self.shared.db.flush_async().await?;
        Ok(())
    }
}

#[async_trait]
impl ChangeLog for SledChangeLog {
    async fn open_cursor(
        &self,
        after: Option<u64>,
    ) -> Result<Box<dyn ChangeCursor>, StorageError> {
        let head_rx = self.shared.head_tx.subscribe();

        let Some((first_key, _)) = self.shared.tree.first()? else {
            return Ok(Box::new(SledCursor::finished(self.shared.clone(), head_rx, None)));
        };
        let first_seq = decode_seq(&first_key)?;

        let position = after.map(|seq| seq + 1).unwrap_or(first_seq);
        if position < first_seq {
            debug!(
                "cursor position {} is behind the oldest retained entry {}",
                position, first_seq
            );
            return Ok(Box::new(SledCursor::finished(
                self.shared.clone(),
                head_rx,
                Some(StorageError::PositionLost),
            )));
        }

        Ok(Box::new(SledCursor {
            shared: self.shared.clone(),
            head_rx,
            position,
            finished: false,
            failure: None,
        }))
    }

    async fn last_seq(&self) -> Result<Option<u64>, StorageError> {
        match self.shared.tree.last()? {
            Some((key, _)) => Ok(Some(decode_seq(&key)?)),
            None => Ok(None),
        }
    }
}

struct SledCursor {
    shared: Arc<Shared>,
    head_rx: watch::Receiver<u64>,
    position: u64,
    finished: bool,
    failure: Option<StorageError>,
}

impl SledCursor {
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

    fn read_next(&mut self) -> Result<Option<LogEntry>, StorageError> {
        let Some((first_key, _)) = self.shared.tree.first()? else {
            return Ok(None);
        };
        if self.position < decode_seq(&first_key)? {
            return Err(StorageError::PositionLost);
        }

        match self.shared.tree.get(self.position.to_be_bytes())? {
            Some(value) => {
                // An undecodable value surfaces as an entry without collections,
                // which the sync task skips as malformed
                let collections = match bincode::deserialize::<Vec<CollectionOps>>(&value) {
                    Ok(collections) => collections,
                    Err(e) => {
                        warn!("undecodable change log value at seq {}: {}", self.position, e);
                        Vec::new()
                    }
                };
                let entry = LogEntry {
                    seq: self.position,
                    collections,
                };
                self.position += 1;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl ChangeCursor for SledCursor {
    async fn next(&mut self) -> Option<LogEntry> {
        loop {
            if self.finished {
                return None;
            }

            self.head_rx.borrow_and_update();

            match self.read_next() {
                Ok(Some(entry)) => return Some(entry),
                Ok(None) => {}
                Err(e) => {
                    self.finished = true;
                    self.failure = Some(e);
                    return None;
                }
            }

            if self.head_rx.changed().await.is_err() {
                self.finished = true;
                self.failure = Some(StorageError::Closed);
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

fn decode_seq(key: &IVec) -> Result<u64, StorageError> {
    let bytes: [u8; 8] = key.as_ref().try_into().map_err(|_| StorageError::DataCorruption {
        location: format!("change log key of {} bytes", key.len()),
    })?;
    Ok(u64::from_be_bytes(bytes))
}
