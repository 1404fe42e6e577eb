//! # Telemetry Module
//!
//! Accumulates decoded sensor samples for the active trip and writes them
//! out as track files when the trip ends.
//!
//! This module handles:
//! - Buffering samples pushed by the frame forwarder
//! - Splitting them into a position track and an inertial track (CSV)
//! - Optionally exporting the position track as GPX

pub mod aggregator;
pub mod gpx;

pub use aggregator::{FlushSummary, SampleAggregator, TrackLayout};
