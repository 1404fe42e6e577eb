//! # Sensor Frame Encoder
//!
//! Encodes samples into the 44-byte frame layout. The sensor unit is the
//! only producer in the field; this side is used to build replay captures.

use super::protocol::*;

/// Encode a sample into a complete frame
///
/// # Arguments
///
/// * `sample` - Sample to encode
///
/// # Returns
///
/// * `[u8; FRAME_SIZE]` - Frame with version 1, message type 1 and payload length 40
///
/// # Examples
///
/// ```
/// use fleet_recorder::frame::encoder::encode_sample;
/// use fleet_recorder::frame::protocol::{SensorSample, FRAME_SIZE};
///
/// let frame = encode_sample(&SensorSample::default());
/// assert_eq!(frame.len(), FRAME_SIZE);
/// ```
pub fn encode_sample(sample: &SensorSample) -> [u8; FRAME_SIZE] {
    let mut frame = [0u8; FRAME_SIZE];

    frame[0] = FRAME_VERSION;
    frame[1] = FRAME_TYPE_SENSOR_SAMPLE;
    frame[2..4].copy_from_slice(&FRAME_PAYLOAD_SIZE.to_le_bytes());
    frame[OFFSET_TIMESTAMP..OFFSET_TIMESTAMP + 4].copy_from_slice(&sample.timestamp_ms.to_le_bytes());

    let fields = [
        (OFFSET_LATITUDE, sample.latitude),
        (OFFSET_LONGITUDE, sample.longitude),
        (OFFSET_ALTITUDE, sample.altitude),
        (OFFSET_AX, sample.ax),
        (OFFSET_AY, sample.ay),
        (OFFSET_AZ, sample.az),
        (OFFSET_GX, sample.gx),
        (OFFSET_GY, sample.gy),
        (OFFSET_GZ, sample.gz),
    ];
    for (offset, value) in fields {
        frame[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    frame
}

/// Encode a sequence of samples into a capture buffer
///
/// Frames are concatenated back to back, which is the layout
/// [`crate::link::replay::ReplayAdapter`] reads.
pub fn encode_capture<'a, I>(samples: I) -> Vec<u8>
where
    I: IntoIterator<Item = &'a SensorSample>,
{
    samples
        .into_iter()
        .flat_map(|sample| encode_sample(sample))
        .collect()
}
