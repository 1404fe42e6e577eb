//! Trait abstraction over the platform BLE stack to enable testing
//!
//! Requests go out through [`BleAdapter`]; results come back as
//! [`LinkEvent`]s pushed into a [`LinkEventSink`].

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::Result;

/// Client Characteristic Configuration Descriptor (0x2902)
pub const CCCD_UUID: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

/// CCCD value that enables notifications
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];

/// Platform identifier of a discovered peripheral (MAC address or handle)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceId(pub String);

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Scan result
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredDevice {
    pub id: DeviceId,
    pub name: Option<String>,
    pub rssi: i16,
}

/// GATT characteristic with the descriptors it exposes
#[derive(Debug, Clone, PartialEq)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    pub descriptors: Vec<Uuid>,
}

/// GATT service as reported by service discovery
#[derive(Debug, Clone, PartialEq)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<GattCharacteristic>,
}

/// Callback from the platform BLE stack
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// Scan matched an advertisement
    DeviceFound(DiscoveredDevice),
    /// Scan could not be started or was aborted by the stack
    ScanFailed(String),
    /// GATT connection established
    Connected,
    /// GATT connection lost, refused or closed by the peripheral
    Disconnected,
    /// MTU negotiation finished
    MtuChanged { mtu: u16, success: bool },
    /// Service discovery finished
    ServicesDiscovered(std::result::Result<Vec<GattService>, String>),
    /// Descriptor write acknowledged
    DescriptorWritten(std::result::Result<(), String>),
    /// Characteristic notification payload
    Notification(Bytes),
}

/// Sending half handed to the platform stack
#[derive(Debug, Clone)]
pub struct LinkEventSink(mpsc::UnboundedSender<LinkEvent>);

/// Receiving half owned by the link state machine
#[derive(Debug)]
pub struct LinkEvents(mpsc::UnboundedReceiver<LinkEvent>);

/// Create a connected sink/receiver pair
pub fn event_channel() -> (LinkEventSink, LinkEvents) {
    let (tx, rx) = mpsc::unbounded_channel();
    (LinkEventSink(tx), LinkEvents(rx))
}

impl LinkEventSink {
    /// Deliver a platform callback
    ///
    /// Returns `false` once the state machine has shut down.
    pub fn send(&self, event: LinkEvent) -> bool {
        self.0.send(event).is_ok()
    }
}

impl LinkEvents {
    pub(crate) async fn recv(&mut self) -> Option<LinkEvent> {
        self.0.recv().await
    }
}

/// Trait for BLE central operations
///
/// Every method only issues the request; completion is reported later as a
/// [`LinkEvent`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BleAdapter: Send {
    /// Scan for advertisements whose name matches `device_name`
    async fn start_scan(&mut self, device_name: &str) -> Result<()>;

    /// Stop an active scan
    async fn stop_scan(&mut self) -> Result<()>;

    /// Open a GATT connection to a known device
    async fn connect(&mut self, device: &DeviceId) -> Result<()>;

    /// Ask for a larger MTU
    async fn request_mtu(&mut self, mtu: u16) -> Result<()>;

    /// Discover services on the connected device
    async fn discover_services(&mut self) -> Result<()>;

    /// Write a descriptor value
    async fn write_descriptor(
        &mut self,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<()>;

    /// Disconnect and release the GATT handle
    async fn disconnect(&mut self) -> Result<()>;
}
