//! Trait abstraction over the resumable transfer engine
//!
//! Requests go through [`TransferEngine`]; state changes, progress and
//! errors come back asynchronously as [`TransferEvent`]s on the sink the
//! engine was constructed with.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

use super::task::{TransferId, TransferState};
use crate::error::Result;

/// Engine view of one transfer
#[derive(Debug, Clone, PartialEq)]
pub struct TransferInfo {
    pub id: TransferId,
    pub key: String,
    pub source: PathBuf,
    pub state: TransferState,
    pub bytes_current: u64,
    pub bytes_total: u64,
}

/// What happened to a transfer
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEventKind {
    StateChanged(TransferState),
    Progress { bytes_current: u64, bytes_total: u64 },
    Error(String),
}

/// Callback from the transfer engine
#[derive(Debug, Clone, PartialEq)]
pub struct TransferEvent {
    pub id: TransferId,
    pub kind: TransferEventKind,
}

/// Sending half handed to the engine at construction
#[derive(Debug, Clone)]
pub struct TransferEventSink(mpsc::UnboundedSender<TransferEvent>);

/// Receiving half owned by the upload queue
#[derive(Debug)]
pub struct TransferEvents(mpsc::UnboundedReceiver<TransferEvent>);

/// Create a connected sink/receiver pair
pub fn transfer_event_channel() -> (TransferEventSink, TransferEvents) {
    let (tx, rx) = mpsc::unbounded_channel();
    (TransferEventSink(tx), TransferEvents(rx))
}

impl TransferEventSink {
    /// Returns `false` once the queue has shut down
    pub fn send(&self, id: TransferId, kind: TransferEventKind) -> bool {
        self.0.send(TransferEvent { id, kind }).is_ok()
    }
}

impl TransferEvents {
    pub(crate) async fn recv(&mut self) -> Option<TransferEvent> {
        self.0.recv().await
    }
}

/// Trait for a resumable object-store transfer engine
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransferEngine: Send + Sync {
    /// Start uploading `source` under `key`
    async fn upload(&self, key: &str, source: &Path) -> Result<TransferId>;

    /// Pause a running transfer
    async fn pause(&self, id: TransferId) -> Result<()>;

    /// Resume a paused, failed or network-blocked transfer
    async fn resume(&self, id: TransferId) -> Result<()>;

    /// Look a transfer up; `None` if the engine does not know the id
    async fn transfer(&self, id: TransferId) -> Result<Option<TransferInfo>>;

    /// Every transfer the engine still tracks
    async fn transfers(&self) -> Result<Vec<TransferInfo>>;
}
