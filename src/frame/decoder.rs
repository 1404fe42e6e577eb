//! # Sensor Frame Decoder
//!
//! Decodes 44-byte sensor frames into [`SensorSample`] values.

use tracing::debug;

use super::protocol::*;
use crate::error::{RecorderError, Result};

/// Read a little-endian `u32` at `offset`
fn read_u32(frame: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        frame[offset],
        frame[offset + 1],
        frame[offset + 2],
        frame[offset + 3],
    ])
}

/// Read a little-endian `f32` at `offset`
fn read_f32(frame: &[u8], offset: usize) -> f32 {
    f32::from_bits(read_u32(frame, offset))
}

/// Decode the header fields of a frame
///
/// # Errors
///
/// Returns `MalformedFrame` if fewer than [`FRAME_HEADER_SIZE`] bytes are given.
pub fn decode_header(frame: &[u8]) -> Result<FrameHeader> {
    if frame.len() < FRAME_HEADER_SIZE {
        return Err(RecorderError::MalformedFrame { len: frame.len() });
    }

    Ok(FrameHeader {
        version: frame[0],
        message_type: frame[1],
        payload_length: u16::from_le_bytes([frame[2], frame[3]]),
    })
}

/// Decode one sensor frame
///
/// Exactly one sample is decoded per call. Bytes past [`FRAME_SIZE`] are
/// ignored, and the header is not validated.
///
/// # Arguments
///
/// * `frame` - Frame bytes, at least 44 long
///
/// # Returns
///
/// * `Result<SensorSample>` - Decoded sample
///
/// # Errors
///
/// Returns `MalformedFrame` if the input is shorter than [`FRAME_SIZE`].
///
/// # Examples
///
/// ```
/// use fleet_recorder::frame::decoder::decode;
/// use fleet_recorder::frame::encoder::encode_sample;
/// use fleet_recorder::frame::protocol::SensorSample;
///
/// let sample = SensorSample { timestamp_ms: 1500, latitude: 13.75, longitude: 100.5, ..Default::default() };
/// let decoded = decode(&encode_sample(&sample))?;
/// assert_eq!(decoded, sample);
/// # Ok::<(), fleet_recorder::error::RecorderError>(())
/// ```
pub fn decode(frame: &[u8]) -> Result<SensorSample> {
    if frame.len() < FRAME_SIZE {
        return Err(RecorderError::MalformedFrame { len: frame.len() });
    }

    Ok(SensorSample {
        timestamp_ms: read_u32(frame, OFFSET_TIMESTAMP),
        latitude: read_f32(frame, OFFSET_LATITUDE),
        longitude: read_f32(frame, OFFSET_LONGITUDE),
        altitude: read_f32(frame, OFFSET_ALTITUDE),
        ax: read_f32(frame, OFFSET_AX),
        ay: read_f32(frame, OFFSET_AY),
        az: read_f32(frame, OFFSET_AZ),
        gx: read_f32(frame, OFFSET_GX),
        gy: read_f32(frame, OFFSET_GY),
        gz: read_f32(frame, OFFSET_GZ),
    })
}

/// Decode a frame on the ingestion path
///
/// Corrupt frames are expected now and then on a noisy radio link, so a
/// short frame is logged and dropped instead of surfacing an error.
pub fn decode_lossy(frame: &[u8]) -> Option<SensorSample> {
    match decode(frame) {
        Ok(sample) => Some(sample),
        Err(e) => {
            debug!("Dropping frame: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::encoder::encode_sample;

    fn sample_frame() -> Vec<u8> {
        let mut frame = vec![
            0x01, // version
            0x01, // message type
            0x28, 0x00, // payload length: 40
            0xE8, 0x03, 0x00, 0x00, // timestamp: 1000 ms
        ];
        for value in [13.75f32, 100.5, 12.0, 0.1, -0.2, 9.81, 0.01, 0.02, -0.03] {
            frame.extend_from_slice(&value.to_le_bytes());
        }
        frame
    }

    #[test]
    fn test_decode_known_frame() {
        let frame = sample_frame();
        assert_eq!(frame.len(), FRAME_SIZE);

        let sample = decode(&frame).unwrap();
        assert_eq!(sample.timestamp_ms, 1000);
        assert_eq!(sample.latitude, 13.75);
        assert_eq!(sample.longitude, 100.5);
        assert_eq!(sample.altitude, 12.0);
        assert_eq!(sample.ax, 0.1);
        assert_eq!(sample.ay, -0.2);
        assert_eq!(sample.az, 9.81);
        assert_eq!(sample.gx, 0.01);
        assert_eq!(sample.gy, 0.02);
        assert_eq!(sample.gz, -0.03);
    }

    #[test]
    fn test_decode_every_short_length_fails() {
        let frame = sample_frame();
        for len in 0..FRAME_SIZE {
            let result = decode(&frame[..len]);
            match result {
                Err(RecorderError::MalformedFrame { len: reported }) => assert_eq!(reported, len),
                other => panic!("Expected MalformedFrame for {} bytes, got: {:?}", len, other),
            }
        }
    }

    #[test]
    fn test_decode_lossy_drops_short_frames() {
        for len in [0, 1, 4, 43] {
            assert!(decode_lossy(&vec![0xFFu8; len]).is_none());
        }
    }

    #[test]
    fn test_decode_ignores_trailing_bytes() {
        let mut frame = sample_frame();
        frame.extend_from_slice(&[0xAA; 44]);

        let sample = decode(&frame).unwrap();
        assert_eq!(sample.timestamp_ms, 1000);
        assert_eq!(sample.gz, -0.03);
    }

    #[test]
    fn test_decode_ignores_header_values() {
        let mut frame = sample_frame();
        frame[0] = 0x7F;
        frame[1] = 0x42;
        frame[2] = 0xFF;
        frame[3] = 0xFF;

        let sample = decode(&frame).unwrap();
        assert_eq!(sample.latitude, 13.75);

        let header = decode_header(&frame).unwrap();
        assert_eq!(header.version, 0x7F);
        assert_eq!(header.message_type, 0x42);
        assert_eq!(header.payload_length, 0xFFFF);
    }

    #[test]
    fn test_decode_header_too_short() {
        assert!(decode_header(&[0x01, 0x01, 0x28]).is_err());
    }

    #[test]
    fn test_decode_max_timestamp_is_unsigned() {
        let mut frame = sample_frame();
        frame[4..8].copy_from_slice(&[0xFF, 0xFF, 0xFF, 0xFF]);
        assert_eq!(decode(&frame).unwrap().timestamp_ms, u32::MAX);
    }

    #[test]
    fn test_encode_then_decode_reconstructs_sample() {
        let sample = SensorSample {
            timestamp_ms: 123_456,
            latitude: -33.8688,
            longitude: 151.2093,
            altitude: -4.5,
            ax: f32::MIN_POSITIVE,
            ay: f32::MAX,
            az: -0.0,
            gx: 1e-20,
            gy: -7.25,
            gz: f32::INFINITY,
        };

        let decoded = decode(&encode_sample(&sample)).unwrap();
        assert_eq!(decoded, sample);
        assert!(decoded.az.is_sign_negative());
    }
}
