//! Link connection state and its observable container

use std::fmt;
use tokio::sync::watch;
use tracing::info;

/// Connection state of the sensor unit link
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LinkConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error(String),
}

impl LinkConnectionState {
    /// Notifications are enabled and frames are flowing
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// A scan or connection attempt is underway
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Connecting | Self::Connected)
    }
}

impl fmt::Display for LinkConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => f.write_str("disconnected"),
            Self::Connecting => f.write_str("connecting"),
            Self::Connected => f.write_str("connected"),
            Self::Error(reason) => write!(f, "error: {}", reason),
        }
    }
}

/// Single-writer holder of the live [`LinkConnectionState`]
///
/// Only the link state machine owns one; everyone else observes through
/// [`watch::Receiver`]s.
#[derive(Debug)]
pub(crate) struct LinkStateCell {
    tx: watch::Sender<LinkConnectionState>,
}

impl LinkStateCell {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(LinkConnectionState::Disconnected);
        Self { tx }
    }

    pub(crate) fn get(&self) -> LinkConnectionState {
        self.tx.borrow().clone()
    }

    pub(crate) fn set(&self, next: LinkConnectionState) {
        let previous = self.tx.send_replace(next.clone());
        if previous != next {
            info!("Sensor link {} -> {}", previous, next);
        }
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<LinkConnectionState> {
        self.tx.subscribe()
    }
}
