//! # Error Types
//!
//! Custom error types for Fleet Recorder using `thiserror`.

use thiserror::Error;

/// Main error type for Fleet Recorder
#[derive(Debug, Error)]
pub enum RecorderError {
    /// Wire frame shorter than the fixed record size
    #[error("Malformed frame: {len} bytes")]
    MalformedFrame { len: usize },

    /// BLE link errors (scan, connect, GATT negotiation)
    #[error("BLE link error: {0}")]
    Link(String),

    /// Transfer engine errors for a single upload
    #[error("Transfer error: {0}")]
    Transfer(String),

    /// Transfer engine could not be initialized
    #[error("Transfer engine initialization failed: {0}")]
    EngineInit(String),

    /// Upload task rejected before it was queued
    #[error("Invalid upload task: {0}")]
    InvalidTask(String),

    /// Upload gate (WiFi/geofence) is closed
    #[error("Upload gate is closed")]
    GateClosed,

    /// A trip is already being recorded
    #[error("Trip {0} is already recording")]
    TripAlreadyActive(String),

    /// No trip is being recorded
    #[error("No trip is recording")]
    TripNotActive,

    /// A background task is gone
    #[error("{0} channel closed")]
    ChannelClosed(&'static str),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding errors for persisted transfer metadata
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for Fleet Recorder
pub type Result<T> = std::result::Result<T, RecorderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_frame_message() {
        let err = RecorderError::MalformedFrame { len: 12 };
        assert_eq!(err.to_string(), "Malformed frame: 12 bytes");
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: RecorderError = io.into();
        assert!(matches!(err, RecorderError::Io(_)));
    }
}
