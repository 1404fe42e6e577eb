//! # Sensor Frame Constants and Types
//!
//! Core definitions for the fixed-size record sent by the sensor unit.
//!
//! ```text
//! offset  size  field
//!      0     1  version          (ignored)
//!      1     1  message type     (ignored)
//!      2     2  payload length   (ignored, u16)
//!      4     4  timestamp ms     (u32)
//!      8     4  latitude         (f32)
//!     12     4  longitude        (f32)
//!     16     4  altitude         (f32)
//!     20    12  ax, ay, az       (f32 × 3)
//!     32    12  gx, gy, gz       (f32 × 3)
//! ```
//!
//! All multi-byte fields are little-endian.

use bytes::Bytes;
use chrono::{DateTime, Utc};

/// Size of one frame on the wire
pub const FRAME_SIZE: usize = 44;

/// Size of the header (version + type + payload length)
pub const FRAME_HEADER_SIZE: usize = 4;

/// Payload length written by [`crate::frame::encoder::encode_sample`]
pub const FRAME_PAYLOAD_SIZE: u16 = (FRAME_SIZE - FRAME_HEADER_SIZE) as u16;

/// Protocol version written by the encoder
pub const FRAME_VERSION: u8 = 1;

/// Message type of a fused GNSS + IMU sample
pub const FRAME_TYPE_SENSOR_SAMPLE: u8 = 1;

pub(crate) const OFFSET_TIMESTAMP: usize = 4;
pub(crate) const OFFSET_LATITUDE: usize = 8;
pub(crate) const OFFSET_LONGITUDE: usize = 12;
pub(crate) const OFFSET_ALTITUDE: usize = 16;
pub(crate) const OFFSET_AX: usize = 20;
pub(crate) const OFFSET_AY: usize = 24;
pub(crate) const OFFSET_AZ: usize = 28;
pub(crate) const OFFSET_GX: usize = 32;
pub(crate) const OFFSET_GY: usize = 36;
pub(crate) const OFFSET_GZ: usize = 40;

/// Header fields of a frame
///
/// The sensor unit fills these in but nothing downstream relies on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Protocol version
    pub version: u8,

    /// Message type
    pub message_type: u8,

    /// Declared payload length (not cross-checked against the frame size)
    pub payload_length: u16,
}

/// One decoded record from the sensor unit
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorSample {
    /// Milliseconds on the sensor unit's clock
    pub timestamp_ms: u32,

    /// Latitude in degrees
    pub latitude: f32,

    /// Longitude in degrees
    pub longitude: f32,

    /// Altitude in meters
    pub altitude: f32,

    /// Acceleration X
    pub ax: f32,

    /// Acceleration Y
    pub ay: f32,

    /// Acceleration Z
    pub az: f32,

    /// Angular rate X
    pub gx: f32,

    /// Angular rate Y
    pub gy: f32,

    /// Angular rate Z
    pub gz: f32,
}

impl SensorSample {
    /// Whether the GNSS fields carry a fix
    ///
    /// Latitude and longitude must both be finite, and the pair must not be
    /// exactly (0.0, 0.0), which the sensor unit reports before a fix.
    ///
    /// # Examples
    ///
    /// ```
    /// use fleet_recorder::frame::protocol::SensorSample;
    ///
    /// let mut sample = SensorSample::default();
    /// assert!(!sample.has_valid_gnss());
    ///
    /// sample.latitude = 13.75;
    /// sample.longitude = 100.5;
    /// assert!(sample.has_valid_gnss());
    /// ```
    pub fn has_valid_gnss(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && !(self.latitude == 0.0 && self.longitude == 0.0)
    }
}

impl Default for SensorSample {
    fn default() -> Self {
        Self {
            timestamp_ms: 0,
            latitude: 0.0,
            longitude: 0.0,
            altitude: 0.0,
            ax: 0.0,
            ay: 0.0,
            az: 0.0,
            gx: 0.0,
            gy: 0.0,
            gz: 0.0,
        }
    }
}

/// A raw notification payload as received from the link
#[derive(Debug, Clone, PartialEq)]
pub struct FramePacket {
    /// Frame bytes (exactly [`FRAME_SIZE`] long)
    pub data: Bytes,

    /// Wall-clock time the payload arrived
    pub received_at: DateTime<Utc>,
}

impl FramePacket {
    /// Wrap a payload with the current time as receipt timestamp
    pub fn new(data: Bytes) -> Self {
        Self {
            data,
            received_at: Utc::now(),
        }
    }
}
