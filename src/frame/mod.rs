//! # Sensor Frame Module
//!
//! Wire format of the records streamed by the remote sensor unit.
//!
//! This module handles:
//! - Frame layout constants (fixed 44-byte little-endian record)
//! - Decoding one frame into a [`protocol::SensorSample`]
//! - Encoding samples back into frames (replay captures, tests)

pub mod protocol;
pub mod encoder;
pub mod decoder;
