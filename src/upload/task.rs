//! Upload work items, engine transfer states and outbound events

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::error::{RecorderError, Result};

/// One file to deliver to the object store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTask {
    /// Absolute path of the local file
    pub source_file_path: PathBuf,

    /// Object key, e.g. `trips/42/video.mp4`
    pub destination_key: String,

    /// Trip the file belongs to
    pub correlation_id: Option<String>,

    /// Failed attempts so far
    pub attempt_count: u32,
}

/// De-duplication identity of a task; the attempt count is not part of it
pub type TaskIdentity = (PathBuf, String, Option<String>);

impl UploadTask {
    pub fn new(
        source_file_path: impl Into<PathBuf>,
        destination_key: impl Into<String>,
        correlation_id: Option<String>,
    ) -> Self {
        Self {
            source_file_path: source_file_path.into(),
            destination_key: destination_key.into(),
            correlation_id,
            attempt_count: 0,
        }
    }

    pub fn identity(&self) -> TaskIdentity {
        (
            self.source_file_path.clone(),
            self.destination_key.clone(),
            self.correlation_id.clone(),
        )
    }

    /// Reject blank paths and keys
    ///
    /// # Errors
    ///
    /// Returns [`RecorderError::InvalidTask`] naming the blank field.
    pub fn validate(&self) -> Result<()> {
        if self.source_file_path.as_os_str().is_empty() {
            return Err(RecorderError::InvalidTask("source file path is blank".to_string()));
        }
        if self.destination_key.trim().is_empty() {
            return Err(RecorderError::InvalidTask("destination key is blank".to_string()));
        }
        Ok(())
    }

    /// Copy of this task for the next attempt
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt_count: self.attempt_count + 1,
            ..self.clone()
        }
    }

    pub(crate) fn trip_id(&self) -> String {
        self.correlation_id.clone().unwrap_or_default()
    }
}

/// Identifier assigned by the transfer engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(pub u64);

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of an engine transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferState {
    Waiting,
    InProgress,
    ResumedWaiting,
    Paused,
    Failed,
    WaitingForNetwork,
    Completed,
    Canceled,
    Unknown,
}

impl TransferState {
    /// The engine can still finish this transfer
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Waiting
                | Self::InProgress
                | Self::ResumedWaiting
                | Self::Paused
                | Self::Failed
                | Self::WaitingForNetwork
        )
    }

    /// Recoverable, but only after an explicit resume
    pub fn needs_resume(&self) -> bool {
        matches!(self, Self::Paused | Self::Failed | Self::WaitingForNetwork)
    }

    /// Finished for good; neither pause nor resume applies
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Canceled)
    }
}

/// Outbound notification about a task
#[derive(Debug, Clone, PartialEq)]
pub enum UploadEvent {
    /// The file is in the object store
    Completed { trip_id: String, key: String },

    /// Every attempt failed, or the task could not be started
    Failed {
        trip_id: String,
        key: String,
        error: String,
    },

    /// Transfer progress, reported at whole steps only
    Progress {
        trip_id: String,
        key: String,
        percent: u8,
    },
}

impl UploadEvent {
    pub fn trip_id(&self) -> &str {
        match self {
            Self::Completed { trip_id, .. }
            | Self::Failed { trip_id, .. }
            | Self::Progress { trip_id, .. } => trip_id,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Self::Completed { key, .. } | Self::Failed { key, .. } | Self::Progress { key, .. } => key,
        }
    }

    /// `Completed` or `Failed`
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Progress { .. })
    }
}
