//! # Trip Module
//!
//! Trip sessions on top of the sensor link and the upload queue: recording,
//! flushing, upload submission and per-trip upload status, plus the system
//! status monitor that feeds the upload gate.

pub mod controller;
pub mod gate;
pub mod monitor;
pub mod tracker;

pub use controller::{TripArtifacts, TripController};
pub use gate::{AlwaysOpen, UploadGate};
pub use monitor::{StaticProbe, StatusMonitor, StatusProbe, SystemStatus};
pub use tracker::{TripUploadStatus, TripUploadTracker};
