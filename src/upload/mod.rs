//! # Upload Module
//!
//! Durable, retrying delivery of trip files to an object store.
//!
//! This module handles:
//! - Upload task and event types
//! - The transfer engine seam and a filesystem-backed engine
//! - Persisted transfer records for recovery after restart
//! - The single-flight upload queue with exponential backoff

pub mod engine;
pub mod local;
pub mod queue;
pub mod store;
pub mod task;

pub use engine::{TransferEngine, TransferEvent, TransferEventKind, TransferEventSink, TransferInfo};
pub use local::LocalTransferEngine;
pub use queue::{QueueSnapshot, RetryPolicy, UploadQueue, UploadQueueHandle};
pub use store::TransferRecordStore;
pub use task::{TransferId, TransferState, UploadEvent, UploadTask};
