//! # System Status Monitor
//!
//! Periodically samples link state, network availability and free storage
//! into one [`SystemStatus`] value that dashboards and the upload gate read.

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::gate::UploadGate;
use crate::config::MonitorConfig;
use crate::link::LinkConnectionState;

/// Free storage below this percentage is logged as a warning
const LOW_STORAGE_PERCENT: u8 = 10;

/// Snapshot of everything the recorder depends on
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SystemStatus {
    pub link: LinkConnectionState,
    pub network_available: bool,
    /// `None` when the platform cannot report it
    pub free_storage_percent: Option<u8>,
}

/// Platform queries the monitor polls
#[cfg_attr(test, mockall::automock)]
pub trait StatusProbe: Send + Sync {
    fn network_available(&self) -> bool;
    fn free_storage_percent(&self) -> Option<u8>;
}

/// Probe with fixed answers, for hosts without platform hooks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticProbe {
    pub network_available: bool,
    pub free_storage_percent: Option<u8>,
}

impl StaticProbe {
    pub fn online() -> Self {
        Self {
            network_available: true,
            free_storage_percent: None,
        }
    }
}

impl StatusProbe for StaticProbe {
    fn network_available(&self) -> bool {
        self.network_available
    }

    fn free_storage_percent(&self) -> Option<u8> {
        self.free_storage_percent
    }
}

/// Uploads are allowed while the network is up
impl UploadGate for watch::Receiver<SystemStatus> {
    fn is_open(&self) -> bool {
        self.borrow().network_available
    }
}

pub struct StatusMonitor;

impl StatusMonitor {
    /// Spawn the polling task
    ///
    /// # Arguments
    ///
    /// * `probe` - Network and storage queries
    /// * `link` - Link state to fold into the status
    /// * `config` - Poll interval
    ///
    /// # Returns
    ///
    /// * `(watch::Receiver<SystemStatus>, JoinHandle<()>)` - Status feed and the
    ///   task handle. The task ends once every receiver has been dropped.
    pub fn spawn<P: StatusProbe + 'static>(
        probe: P,
        link: watch::Receiver<LinkConnectionState>,
        config: &MonitorConfig,
    ) -> (watch::Receiver<SystemStatus>, JoinHandle<()>) {
        let initial = sample(&probe, &link);
        let (tx, rx) = watch::channel(initial);
        let poll_interval = config.poll_interval();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    _ = ticker.tick() => {
                        let next = sample(&probe, &link);
                        tx.send_if_modified(|current| {
                            if *current == next {
                                return false;
                            }
                            log_change(current, &next);
                            *current = next;
                            true
                        });
                    }
                }
            }
            debug!("Status monitor stopped");
        });

        (rx, task)
    }
}

fn sample<P: StatusProbe>(probe: &P, link: &watch::Receiver<LinkConnectionState>) -> SystemStatus {
    SystemStatus {
        link: link.borrow().clone(),
        network_available: probe.network_available(),
        free_storage_percent: probe.free_storage_percent(),
    }
}

fn log_change(previous: &SystemStatus, next: &SystemStatus) {
    if previous.network_available != next.network_available {
        info!(
            "Network {}",
            if next.network_available { "available" } else { "lost" }
        );
    }
    if let Some(free) = next.free_storage_percent {
        if free < LOW_STORAGE_PERCENT && previous.free_storage_percent != next.free_storage_percent {
            warn!("Low storage: {}% free", free);
        }
    }
}
