//! # Local Transfer Engine
//!
//! [`TransferEngine`] that "uploads" by copying the source file into
//! `<bucket_dir>/<key>`. Copies run in chunks on their own tasks and report
//! progress after every chunk. The transfer table is persisted to
//! `engine.json`, so transfers interrupted by a restart come back as
//! `Paused` and can be resumed from the last copied byte.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::engine::{TransferEngine, TransferEventKind, TransferEventSink, TransferInfo};
use super::task::{TransferId, TransferState};
use crate::error::{RecorderError, Result};

/// Bytes copied between progress reports
const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredTransfer {
    key: String,
    source: PathBuf,
    state: TransferState,
    bytes_current: u64,
    bytes_total: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct EngineTable {
    next_id: u64,
    transfers: BTreeMap<u64, StoredTransfer>,
}

struct Shared {
    bucket_dir: PathBuf,
    table_path: PathBuf,
    chunk_size: usize,
    sink: TransferEventSink,
    table: Mutex<EngineTable>,
    copies: Mutex<HashMap<TransferId, JoinHandle<()>>>,
}

/// Filesystem-backed transfer engine
#[derive(Clone)]
pub struct LocalTransferEngine {
    shared: Arc<Shared>,
}

impl LocalTransferEngine {
    /// Open the engine, restoring its transfer table
    ///
    /// # Arguments
    ///
    /// * `bucket_dir` - Root directory objects are written under
    /// * `table_path` - Location of `engine.json`
    /// * `sink` - Where transfer events are reported
    ///
    /// # Errors
    ///
    /// Returns [`RecorderError::EngineInit`] if the bucket directory cannot
    /// be created or the table exists but cannot be read.
    pub fn open(bucket_dir: impl Into<PathBuf>, table_path: impl Into<PathBuf>, sink: TransferEventSink) -> Result<Self> {
        Self::with_chunk_size(bucket_dir, table_path, sink, DEFAULT_CHUNK_SIZE)
    }

    /// Open with a custom copy chunk size
    pub fn with_chunk_size(
        bucket_dir: impl Into<PathBuf>,
        table_path: impl Into<PathBuf>,
        sink: TransferEventSink,
        chunk_size: usize,
    ) -> Result<Self> {
        let bucket_dir = bucket_dir.into();
        let table_path = table_path.into();

        std::fs::create_dir_all(&bucket_dir).map_err(|e| {
            RecorderError::EngineInit(format!("cannot create bucket {}: {}", bucket_dir.display(), e))
        })?;

        let mut table = match std::fs::read_to_string(&table_path) {
            Ok(contents) => serde_json::from_str::<EngineTable>(&contents).map_err(|e| {
                RecorderError::EngineInit(format!("corrupt transfer table {}: {}", table_path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => EngineTable::default(),
            Err(e) => {
                return Err(RecorderError::EngineInit(format!(
                    "cannot read transfer table {}: {}",
                    table_path.display(),
                    e
                )))
            }
        };

        // Copies do not survive the process
        let mut interrupted = 0;
        for transfer in table.transfers.values_mut() {
            if matches!(
                transfer.state,
                TransferState::Waiting | TransferState::InProgress | TransferState::ResumedWaiting
            ) {
                transfer.state = TransferState::Paused;
                interrupted += 1;
            }
        }
        if interrupted > 0 {
            info!("{} interrupted transfers marked paused", interrupted);
        }

        let engine = Self {
            shared: Arc::new(Shared {
                bucket_dir,
                table_path,
                chunk_size: chunk_size.max(1),
                sink,
                table: Mutex::new(table),
                copies: Mutex::new(HashMap::new()),
            }),
        };
        engine.shared.persist();
        Ok(engine)
    }

    /// Path an object with `key` is written to
    pub fn object_path(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let safe = relative
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
        if key.is_empty() || !safe {
            return Err(RecorderError::Transfer(format!("invalid object key: {}", key)));
        }
        Ok(self.shared.bucket_dir.join(relative))
    }

    fn spawn_copy(&self, id: TransferId) {
        let shared = Arc::clone(&self.shared);
        // Held until the handle is registered, so the task's own removal cannot run first
        let (registered_tx, registered) = oneshot::channel::<()>();
        let copy = tokio::spawn(async move {
            if registered.await.is_err() {
                return;
            }
            let outcome = shared.copy(id).await;
            shared.copies.lock().remove(&id);
            match outcome {
                Ok(()) => {
                    shared.set_state(id, TransferState::Completed);
                }
                Err(e) => {
                    warn!("Transfer {} failed: {}", id, e);
                    shared.update(id, |transfer| transfer.state = TransferState::Failed);
                    shared.sink.send(id, TransferEventKind::Error(e.to_string()));
                }
            }
        });

        if let Some(previous) = self.shared.copies.lock().insert(id, copy) {
            previous.abort();
        }
        let _ = registered_tx.send(());
    }
}

impl Shared {
    fn persist(&self) {
        let table = self.table.lock();
        let result = serde_json::to_vec_pretty(&*table)
            .map_err(RecorderError::from)
            .and_then(|bytes| {
                if let Some(parent) = self.table_path.parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
                let tmp = self.table_path.with_extension("json.tmp");
                std::fs::write(&tmp, bytes)?;
                std::fs::rename(&tmp, &self.table_path)?;
                Ok(())
            });
        if let Err(e) = result {
            warn!("Could not persist transfer table: {}", e);
        }
    }

    fn get(&self, id: TransferId) -> Option<StoredTransfer> {
        self.table.lock().transfers.get(&id.0).cloned()
    }

    fn update<F>(&self, id: TransferId, change: F)
    where
        F: FnOnce(&mut StoredTransfer),
    {
        if let Some(transfer) = self.table.lock().transfers.get_mut(&id.0) {
            change(transfer);
        }
        self.persist();
    }

    fn set_state(&self, id: TransferId, state: TransferState) {
        self.update(id, |transfer| transfer.state = state);
        self.sink.send(id, TransferEventKind::StateChanged(state));
    }

    async fn copy(&self, id: TransferId) -> Result<()> {
        let transfer = self
            .get(id)
            .ok_or_else(|| RecorderError::Transfer(format!("unknown transfer {}", id)))?;
        let destination = self.bucket_dir.join(&transfer.key);
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut source = File::open(&transfer.source).await?;
        let bytes_total = source.metadata().await?.len();
        let offset = transfer.bytes_current.min(bytes_total);

        let mut target = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&destination)
            .await?;
        target.set_len(offset).await?;
        target.seek(SeekFrom::Start(offset)).await?;
        source.seek(SeekFrom::Start(offset)).await?;

        self.update(id, |transfer| transfer.bytes_total = bytes_total);
        self.set_state(id, TransferState::InProgress);
        debug!("Copying {} from byte {} of {}", transfer.key, offset, bytes_total);

        let mut buffer = vec![0u8; self.chunk_size];
        let mut bytes_current = offset;
        loop {
            let read = source.read(&mut buffer).await?;
            if read == 0 {
                break;
            }
            target.write_all(&buffer[..read]).await?;
            bytes_current += read as u64;

            if let Some(transfer) = self.table.lock().transfers.get_mut(&id.0) {
                transfer.bytes_current = bytes_current;
            }
            self.sink.send(
                id,
                TransferEventKind::Progress {
                    bytes_current,
                    bytes_total,
                },
            );
        }
        target.flush().await?;
        target.sync_all().await?;
        Ok(())
    }
}

fn info_for(id: u64, transfer: &StoredTransfer) -> TransferInfo {
    TransferInfo {
        id: TransferId(id),
        key: transfer.key.clone(),
        source: transfer.source.clone(),
        state: transfer.state,
        bytes_current: transfer.bytes_current,
        bytes_total: transfer.bytes_total,
    }
}

#[async_trait]
impl TransferEngine for LocalTransferEngine {
    async fn upload(&self, key: &str, source: &Path) -> Result<TransferId> {
        self.object_path(key)?;
        let bytes_total = tokio::fs::metadata(source)
            .await
            .map_err(|e| RecorderError::Transfer(format!("{}: {}", source.display(), e)))?
            .len();

        let id = {
            let mut table = self.shared.table.lock();
            table.next_id += 1;
            let id = table.next_id;
            table.transfers.insert(
                id,
                StoredTransfer {
                    key: key.to_string(),
                    source: source.to_path_buf(),
                    state: TransferState::Waiting,
                    bytes_current: 0,
                    bytes_total,
                },
            );
            TransferId(id)
        };
        self.shared.persist();

        debug!("Transfer {} created for {}", id, key);
        self.spawn_copy(id);
        Ok(id)
    }

    async fn pause(&self, id: TransferId) -> Result<()> {
        let transfer = self
            .shared
            .get(id)
            .ok_or_else(|| RecorderError::Transfer(format!("unknown transfer {}", id)))?;
        if transfer.state.is_terminal() {
            return Err(RecorderError::Transfer(format!(
                "transfer {} is {:?}, cannot pause",
                id, transfer.state
            )));
        }
        if let Some(copy) = self.shared.copies.lock().remove(&id) {
            copy.abort();
        }
        self.shared.set_state(id, TransferState::Paused);
        Ok(())
    }

    async fn resume(&self, id: TransferId) -> Result<()> {
        let transfer = self
            .shared
            .get(id)
            .ok_or_else(|| RecorderError::Transfer(format!("unknown transfer {}", id)))?;
        if !transfer.state.needs_resume() {
            debug!("Transfer {} is {:?}, nothing to resume", id, transfer.state);
            return Ok(());
        }

        self.shared.set_state(id, TransferState::ResumedWaiting);
        self.spawn_copy(id);
        Ok(())
    }

    async fn transfer(&self, id: TransferId) -> Result<Option<TransferInfo>> {
        Ok(self.shared.get(id).map(|transfer| info_for(id.0, &transfer)))
    }

    async fn transfers(&self) -> Result<Vec<TransferInfo>> {
        Ok(self
            .shared
            .table
            .lock()
            .transfers
            .iter()
            .map(|(id, transfer)| info_for(*id, transfer))
            .collect())
    }
}
