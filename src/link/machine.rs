//! # Sensor Link State Machine
//!
//! Discovers, connects to and keeps reconnecting to the one sensor unit.
//!
//! ```text
//!                 start()
//!  Disconnected ────────────▶ Connecting ──(CCCD written)──▶ Connected
//!       ▲                       │    ▲                           │
//!       │                 failure    │ reconnect timer            │ link lost
//!       │                       ▼    │                           ▼
//!       └──── stop() ──────── Error(reason)          Disconnected ─▶ (reconnect timer)
//! ```
//!
//! All platform callbacks and caller commands are drained by one task, so
//! transitions never interleave. There is at most one pending reconnect
//! deadline; scheduling again replaces it. Retries continue with a fixed
//! delay for as long as the machine is running.

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use super::adapter::{
    BleAdapter, DeviceId, DiscoveredDevice, GattService, LinkEvent, LinkEvents, CCCD_UUID,
    ENABLE_NOTIFICATION_VALUE,
};
use super::state::{LinkConnectionState, LinkStateCell};
use crate::config::BleConfig;
use crate::error::{RecorderError, Result};
use crate::frame::protocol::{FramePacket, FRAME_SIZE};

/// Number of frames between status log messages
const LOG_INTERVAL_FRAMES: u64 = 1000;

enum LinkCommand {
    Start,
    Stop(oneshot::Sender<()>),
}

/// Caller-side handle to a running link state machine
#[derive(Debug, Clone)]
pub struct LinkHandle {
    commands: mpsc::UnboundedSender<LinkCommand>,
    state: watch::Receiver<LinkConnectionState>,
    frames: broadcast::Sender<FramePacket>,
}

impl std::fmt::Debug for LinkCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Start => f.write_str("Start"),
            Self::Stop(_) => f.write_str("Stop"),
        }
    }
}

impl LinkHandle {
    /// Begin discovery, unless already connecting or connected
    pub fn start(&self) -> Result<()> {
        self.commands
            .send(LinkCommand::Start)
            .map_err(|_| RecorderError::ChannelClosed("link"))
    }

    /// Cancel any pending reconnect and tear the link down
    ///
    /// Resolves once the machine has processed the request. No reconnect is
    /// attempted afterwards until [`LinkHandle::start`] is called again.
    pub async fn stop(&self) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.commands
            .send(LinkCommand::Stop(ack_tx))
            .map_err(|_| RecorderError::ChannelClosed("link"))?;
        ack_rx.await.map_err(|_| RecorderError::ChannelClosed("link"))
    }

    /// Current connection state
    pub fn state(&self) -> LinkConnectionState {
        self.state.borrow().clone()
    }

    /// Observe connection state changes
    pub fn watch_state(&self) -> watch::Receiver<LinkConnectionState> {
        self.state.clone()
    }

    /// Receive every 44-byte frame delivered from now on
    pub fn subscribe(&self) -> broadcast::Receiver<FramePacket> {
        self.frames.subscribe()
    }
}

/// The state machine itself; owned by its task
pub struct LinkMachine<A: BleAdapter> {
    adapter: A,
    config: BleConfig,
    state: LinkStateCell,
    frames: broadcast::Sender<FramePacket>,
    /// Set by `start()`, cleared by `stop()`
    running: bool,
    scanning: bool,
    /// GATT handle held by the adapter
    connection_open: bool,
    /// First matching device ever found
    target: Option<DeviceId>,
    scan_deadline: Option<Instant>,
    reconnect_at: Option<Instant>,
    frame_count: u64,
}

/// Sleep until `deadline`, or forever if there is none
async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl<A: BleAdapter + 'static> LinkMachine<A> {
    /// Spawn the state machine task
    ///
    /// # Arguments
    ///
    /// * `adapter` - Platform BLE stack
    /// * `events` - Receiving half of the channel the adapter reports into
    /// * `config` - Device name, UUIDs and timing
    ///
    /// # Returns
    ///
    /// * `(LinkHandle, JoinHandle<()>)` - Handle for callers and the task handle.
    ///   The task exits once every handle is dropped.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use fleet_recorder::config::BleConfig;
    /// use fleet_recorder::link::adapter::event_channel;
    /// use fleet_recorder::link::machine::LinkMachine;
    /// use fleet_recorder::link::replay::ReplayAdapter;
    ///
    /// #[tokio::main]
    /// async fn main() -> anyhow::Result<()> {
    ///     let config = BleConfig::default();
    ///     let (sink, events) = event_channel();
    ///     let adapter = ReplayAdapter::from_file("capture.bin", sink, &config)?;
    ///
    ///     let (link, _task) = LinkMachine::spawn(adapter, events, config);
    ///     link.start()?;
    ///     Ok(())
    /// }
    /// ```
    pub fn spawn(adapter: A, events: LinkEvents, config: BleConfig) -> (LinkHandle, JoinHandle<()>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (frames, _) = broadcast::channel(config.frame_buffer);
        let state = LinkStateCell::new();

        let handle = LinkHandle {
            commands: commands_tx,
            state: state.subscribe(),
            frames: frames.clone(),
        };

        let machine = LinkMachine {
            adapter,
            config,
            state,
            frames,
            running: false,
            scanning: false,
            connection_open: false,
            target: None,
            scan_deadline: None,
            reconnect_at: None,
            frame_count: 0,
        };

        let task = tokio::spawn(machine.run(commands_rx, events));
        (handle, task)
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<LinkCommand>, mut events: LinkEvents) {
        loop {
            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(LinkCommand::Start) => self.start().await,
                    Some(LinkCommand::Stop(ack)) => {
                        self.stop().await;
                        let _ = ack.send(());
                    }
                    None => break,
                },

                Some(event) = events.recv() => self.handle_event(event).await,

                _ = wait_until(self.reconnect_at) => {
                    self.reconnect_at = None;
                    self.reconnect().await;
                }

                _ = wait_until(self.scan_deadline) => {
                    self.scan_deadline = None;
                    self.scan_timed_out().await;
                }
            }
        }

        debug!("Link handles dropped, shutting down sensor link");
        self.stop().await;
    }

    async fn start(&mut self) {
        if self.state.get().is_busy() {
            debug!("Sensor link already {}, ignoring start", self.state.get());
            return;
        }

        // A fresh scan replaces any attempt still pending from an error
        self.reconnect_at = None;
        self.running = true;
        self.state.set(LinkConnectionState::Connecting);
        self.begin_scan().await;
    }

    async fn begin_scan(&mut self) {
        info!("Scanning for {}...", self.config.device_name);
        match self.adapter.start_scan(&self.config.device_name).await {
            Ok(()) => {
                self.scanning = true;
                self.scan_deadline = Some(Instant::now() + self.config.scan_timeout());
            }
            Err(e) => self.fail(format!("scan failed: {}", e)).await,
        }
    }

    async fn end_scan(&mut self) {
        self.scan_deadline = None;
        if self.scanning {
            self.scanning = false;
            if let Err(e) = self.adapter.stop_scan().await {
                warn!("Failed to stop scan: {}", e);
            }
        }
    }

    async fn stop(&mut self) {
        // Cancel the timer before touching the connection
        self.reconnect_at = None;
        self.running = false;
        self.end_scan().await;
        self.release_connection().await;
        self.state.set(LinkConnectionState::Disconnected);
    }

    async fn scan_timed_out(&mut self) {
        if !self.scanning {
            return;
        }
        warn!(
            "No {} found within {:?}",
            self.config.device_name,
            self.config.scan_timeout()
        );
        self.end_scan().await;
        self.fail("device not found".to_string()).await;
    }

    async fn handle_event(&mut self, event: LinkEvent) {
        if !self.running {
            if matches!(event, LinkEvent::Disconnected) {
                self.connection_open = false;
            }
            debug!("Ignoring {:?} while stopped", event);
            return;
        }

        match event {
            LinkEvent::DeviceFound(device) => self.on_device_found(device).await,
            LinkEvent::ScanFailed(reason) => {
                self.end_scan().await;
                self.fail(format!("scan failed: {}", reason)).await;
            }
            LinkEvent::Connected => self.on_connected().await,
            LinkEvent::Disconnected => self.on_disconnected().await,
            LinkEvent::MtuChanged { mtu, success } => {
                debug!("MTU changed to {} (success: {})", mtu, success);
            }
            LinkEvent::ServicesDiscovered(result) => self.on_services_discovered(result).await,
            LinkEvent::DescriptorWritten(result) => self.on_descriptor_written(result).await,
            LinkEvent::Notification(data) => self.on_notification(data),
        }
    }

    async fn on_device_found(&mut self, device: DiscoveredDevice) {
        if !self.scanning {
            debug!("Ignoring late scan result {}", device.id);
            return;
        }
        if device.name.as_deref() != Some(self.config.device_name.as_str()) {
            debug!("Ignoring device {} ({:?})", device.id, device.name);
            return;
        }

        // First match wins
        info!("Found {} at {} (rssi {})", self.config.device_name, device.id, device.rssi);
        self.end_scan().await;
        self.target = Some(device.id.clone());
        self.connect_to(device.id).await;
    }

    async fn connect_to(&mut self, device: DeviceId) {
        info!("Connecting to {}...", device);
        match self.adapter.connect(&device).await {
            Ok(()) => self.connection_open = true,
            Err(e) => self.fail(format!("connection failed: {}", e)).await,
        }
    }

    async fn on_connected(&mut self) {
        if self.state.get() != LinkConnectionState::Connecting {
            debug!("Ignoring connect callback in state {}", self.state.get());
            return;
        }

        info!("Connected to GATT server");
        self.connection_open = true;
        self.reconnect_at = None;

        if let Err(e) = self.adapter.request_mtu(self.config.mtu).await {
            warn!("MTU request failed, continuing with default: {}", e);
        }

        if let Err(e) = self.adapter.discover_services().await {
            self.fail_and_release(format!("service discovery failed: {}", e)).await;
        }
    }

    async fn on_disconnected(&mut self) {
        match self.state.get() {
            LinkConnectionState::Connected => {
                info!("Disconnected from GATT server");
                self.state.set(LinkConnectionState::Disconnected);
                self.release_connection().await;
                self.schedule_reconnect();
            }
            LinkConnectionState::Connecting if self.connection_open => {
                self.fail_and_release("connection failed".to_string()).await;
            }
            LinkConnectionState::Connecting => {
                // Teardown of a connection released before this attempt began
                debug!("Ignoring disconnect with no connection outstanding");
            }
            _ => {
                // Echo of our own teardown; a reconnect is already pending
                self.connection_open = false;
                if self.reconnect_at.is_none() {
                    self.schedule_reconnect();
                }
            }
        }
    }

    async fn on_services_discovered(&mut self, result: std::result::Result<Vec<GattService>, String>) {
        if self.state.get() != LinkConnectionState::Connecting {
            return;
        }

        let services = match result {
            Ok(services) => services,
            Err(reason) => {
                self.fail_and_release(format!("service discovery failed: {}", reason)).await;
                return;
            }
        };

        let service_uuid = self.config.service_uuid;
        let characteristic_uuid = self.config.characteristic_uuid;
        let characteristic = services
            .iter()
            .find(|service| service.uuid == service_uuid)
            .and_then(|service| {
                service
                    .characteristics
                    .iter()
                    .find(|characteristic| characteristic.uuid == characteristic_uuid)
            });

        let Some(characteristic) = characteristic else {
            self.fail_and_release("characteristic not found".to_string()).await;
            return;
        };

        if !characteristic.descriptors.contains(&CCCD_UUID) {
            self.fail_and_release("notification descriptor not found".to_string()).await;
            return;
        }

        debug!("Enabling notifications on {}", characteristic_uuid);
        let written = self
            .adapter
            .write_descriptor(service_uuid, characteristic_uuid, CCCD_UUID, &ENABLE_NOTIFICATION_VALUE)
            .await;
        if let Err(e) = written {
            self.fail_and_release(format!("descriptor write failed: {}", e)).await;
        }
    }

    async fn on_descriptor_written(&mut self, result: std::result::Result<(), String>) {
        if self.state.get() != LinkConnectionState::Connecting {
            return;
        }

        match result {
            Ok(()) => {
                self.state.set(LinkConnectionState::Connected);
                info!("Sensor link up, notifications enabled");
            }
            Err(reason) => {
                self.fail_and_release(format!("descriptor write failed: {}", reason)).await;
            }
        }
    }

    fn on_notification(&mut self, data: Bytes) {
        if data.len() != FRAME_SIZE {
            warn!("Received unexpected packet size: {}", data.len());
            return;
        }

        self.frame_count += 1;
        if self.frame_count % LOG_INTERVAL_FRAMES == 0 {
            info!("Received {} sensor frames", self.frame_count);
        }

        // No subscribers is fine; nobody is recording
        let _ = self.frames.send(FramePacket::new(data));
    }

    async fn reconnect(&mut self) {
        if !self.running || self.scanning {
            return;
        }
        if !matches!(
            self.state.get(),
            LinkConnectionState::Disconnected | LinkConnectionState::Error(_)
        ) {
            debug!("Skipping reconnect while {}", self.state.get());
            return;
        }

        info!("Attempting to reconnect...");
        match self.target.clone() {
            Some(device) => {
                self.state.set(LinkConnectionState::Connecting);
                self.connect_to(device).await;
            }
            None => self.start().await,
        }
    }

    fn schedule_reconnect(&mut self) {
        let delay = self.config.reconnect_delay();
        debug!("Reconnect scheduled in {:?}", delay);
        self.reconnect_at = Some(Instant::now() + delay);
    }

    async fn release_connection(&mut self) {
        if self.connection_open {
            self.connection_open = false;
            if let Err(e) = self.adapter.disconnect().await {
                warn!("Failed to release GATT connection: {}", e);
            }
        }
    }

    async fn fail(&mut self, reason: String) {
        warn!("Sensor link failure: {}", reason);
        self.state.set(LinkConnectionState::Error(reason));
        self.schedule_reconnect();
    }

    async fn fail_and_release(&mut self, reason: String) {
        self.release_connection().await;
        self.fail(reason).await;
    }
}
