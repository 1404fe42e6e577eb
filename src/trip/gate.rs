//! Upload gate: the precondition for submitting a trip's files
//!
//! In the field this is "on the depot WiFi, signal stable" or "inside the
//! depot geofence". Anything that can answer yes or no right now will do.

use tokio::sync::watch;

/// Decides whether uploads may be submitted
pub trait UploadGate: Send + Sync {
    fn is_open(&self) -> bool;
}

/// Gate that never blocks
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysOpen;

impl UploadGate for AlwaysOpen {
    fn is_open(&self) -> bool {
        true
    }
}

/// A flag published by some other component
impl UploadGate for watch::Receiver<bool> {
    fn is_open(&self) -> bool {
        *self.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_always_open() {
        assert!(AlwaysOpen.is_open());
    }

    #[test]
    fn test_watch_flag_gate_follows_sender() {
        let (tx, rx) = watch::channel(false);
        assert!(!rx.is_open());

        tx.send_replace(true);
        assert!(rx.is_open());
    }
}
