//! # Fleet Recorder Library
//!
//! Vehicle-side telemetry recorder for a road-survey fleet.
//!
//! This library receives fused GNSS + IMU frames from a BLE sensor unit,
//! keeps the link up across drops, aggregates samples per trip into track
//! files and delivers trip files to an object store through a durable,
//! retrying upload queue.

pub mod config;
pub mod error;
pub mod frame;
pub mod link;
pub mod telemetry;
pub mod trip;
pub mod upload;
