//! # Capture Replay Adapter
//!
//! [`BleAdapter`] that plays back a recorded capture file instead of talking
//! to a radio. The capture is a plain concatenation of 44-byte frames, as
//! written by [`crate::frame::encoder::encode_capture`]. A trailing partial
//! frame is delivered as-is so the link's size check sees it.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use super::adapter::{
    BleAdapter, DeviceId, DiscoveredDevice, GattCharacteristic, GattService, LinkEvent,
    LinkEventSink, CCCD_UUID, ENABLE_NOTIFICATION_VALUE,
};
use crate::config::BleConfig;
use crate::error::Result;
use crate::frame::protocol::FRAME_SIZE;

/// Largest MTU the replayed peripheral accepts
const REPLAY_MAX_MTU: u16 = 247;

/// Default spacing between replayed notifications (50 Hz)
const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_millis(20);

/// Address reported for the replayed peripheral
const REPLAY_DEVICE_ID: &str = "replay-0";

/// Replays a capture as if it were the sensor unit
pub struct ReplayAdapter {
    sink: LinkEventSink,
    frames: Arc<Vec<Bytes>>,
    device_name: String,
    service_uuid: Uuid,
    characteristic_uuid: Uuid,
    interval: Duration,
    looping: bool,
    stream: Option<JoinHandle<()>>,
    exhausted: Arc<Notify>,
}

impl ReplayAdapter {
    /// Build an adapter from an in-memory capture
    ///
    /// The replayed peripheral advertises the configured device name and
    /// exposes the configured service and characteristic.
    pub fn new(capture: Bytes, sink: LinkEventSink, config: &BleConfig) -> Self {
        let frames = (0..capture.len())
            .step_by(FRAME_SIZE)
            .map(|start| capture.slice(start..(start + FRAME_SIZE).min(capture.len())))
            .collect();

        Self {
            sink,
            frames: Arc::new(frames),
            device_name: config.device_name.clone(),
            service_uuid: config.service_uuid,
            characteristic_uuid: config.characteristic_uuid,
            interval: DEFAULT_FRAME_INTERVAL,
            looping: false,
            stream: None,
            exhausted: Arc::new(Notify::new()),
        }
    }

    /// Load a capture file
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::RecorderError::Io`] if the file cannot be read.
    pub fn from_file<P: AsRef<Path>>(path: P, sink: LinkEventSink, config: &BleConfig) -> Result<Self> {
        let capture = std::fs::read(path.as_ref())?;
        info!(
            "Loaded capture {} ({} bytes)",
            path.as_ref().display(),
            capture.len()
        );
        Ok(Self::new(Bytes::from(capture), sink, config))
    }

    /// Spacing between notifications
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Restart from the first frame once the capture runs out
    pub fn looping(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }

    /// Number of notifications in one pass over the capture
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Signalled once a non-looping capture has been fully delivered
    pub fn exhausted(&self) -> Arc<Notify> {
        Arc::clone(&self.exhausted)
    }

    fn emit(&self, event: LinkEvent) -> Result<()> {
        if !self.sink.send(event) {
            debug!("Link event receiver dropped");
        }
        Ok(())
    }

    fn stop_stream(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.abort();
        }
    }

    fn start_stream(&mut self) {
        self.stop_stream();

        let sink = self.sink.clone();
        let frames = Arc::clone(&self.frames);
        let interval = self.interval;
        let looping = self.looping;
        let exhausted = Arc::clone(&self.exhausted);

        self.stream = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                for frame in frames.iter() {
                    ticker.tick().await;
                    if !sink.send(LinkEvent::Notification(frame.clone())) {
                        return;
                    }
                }
                if !looping || frames.is_empty() {
                    break;
                }
            }
            info!("Capture replay finished ({} frames)", frames.len());
            exhausted.notify_one();
        }));
    }

    fn services(&self) -> Vec<GattService> {
        vec![GattService {
            uuid: self.service_uuid,
            characteristics: vec![GattCharacteristic {
                uuid: self.characteristic_uuid,
                descriptors: vec![CCCD_UUID],
            }],
        }]
    }
}

impl Drop for ReplayAdapter {
    fn drop(&mut self) {
        self.stop_stream();
    }
}

#[async_trait]
impl BleAdapter for ReplayAdapter {
    async fn start_scan(&mut self, device_name: &str) -> Result<()> {
        if device_name == self.device_name {
            self.emit(LinkEvent::DeviceFound(DiscoveredDevice {
                id: DeviceId(REPLAY_DEVICE_ID.to_string()),
                name: Some(self.device_name.clone()),
                rssi: -40,
            }))?;
        }
        Ok(())
    }

    async fn stop_scan(&mut self) -> Result<()> {
        Ok(())
    }

    async fn connect(&mut self, device: &DeviceId) -> Result<()> {
        if device.0 == REPLAY_DEVICE_ID {
            self.emit(LinkEvent::Connected)
        } else {
            self.emit(LinkEvent::Disconnected)
        }
    }

    async fn request_mtu(&mut self, mtu: u16) -> Result<()> {
        self.emit(LinkEvent::MtuChanged {
            mtu: mtu.min(REPLAY_MAX_MTU),
            success: true,
        })
    }

    async fn discover_services(&mut self) -> Result<()> {
        self.emit(LinkEvent::ServicesDiscovered(Ok(self.services())))
    }

    async fn write_descriptor(
        &mut self,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<()> {
        let known = service == self.service_uuid
            && characteristic == self.characteristic_uuid
            && descriptor == CCCD_UUID;
        if !known {
            return self.emit(LinkEvent::DescriptorWritten(Err("unknown descriptor".to_string())));
        }

        self.emit(LinkEvent::DescriptorWritten(Ok(())))?;
        if value == ENABLE_NOTIFICATION_VALUE {
            self.start_stream();
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.stop_stream();
        Ok(())
    }
}
