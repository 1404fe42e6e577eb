//! Per-trip upload bookkeeping driven by [`UploadEvent`]s

use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::upload::UploadEvent;

/// Upload status of a whole trip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TripUploadStatus {
    /// Recorded, nothing submitted yet
    Pending,
    /// At least one file is still on its way
    Uploading,
    /// Every submitted file completed
    Completed,
    /// At least one file failed terminally and nothing is left in flight
    Failed,
}

#[derive(Debug, Default)]
struct TripFiles {
    in_flight: BTreeSet<String>,
    completed: BTreeSet<String>,
    failed: BTreeMap<String, String>,
    percent: BTreeMap<String, u8>,
}

impl TripFiles {
    fn status(&self) -> TripUploadStatus {
        if !self.in_flight.is_empty() {
            TripUploadStatus::Uploading
        } else if !self.failed.is_empty() {
            TripUploadStatus::Failed
        } else if !self.completed.is_empty() {
            TripUploadStatus::Completed
        } else {
            TripUploadStatus::Pending
        }
    }

    fn progress(&self) -> u8 {
        let total = self.in_flight.len() + self.completed.len() + self.failed.len();
        if total == 0 {
            return 0;
        }
        let in_flight: u32 = self
            .in_flight
            .iter()
            .map(|key| u32::from(self.percent.get(key).copied().unwrap_or(0)))
            .sum();
        let done = 100 * (self.completed.len() + self.failed.len()) as u32;
        ((in_flight + done) / total as u32) as u8
    }
}

/// Tracks which files of each trip are still uploading
///
/// Status changes are published on a `watch` channel so callers can wait
/// for a trip to settle.
#[derive(Debug)]
pub struct TripUploadTracker {
    trips: Mutex<BTreeMap<String, TripFiles>>,
    statuses: watch::Sender<BTreeMap<String, TripUploadStatus>>,
}

impl Default for TripUploadTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl TripUploadTracker {
    pub fn new() -> Self {
        let (statuses, _) = watch::channel(BTreeMap::new());
        Self {
            trips: Mutex::new(BTreeMap::new()),
            statuses,
        }
    }

    /// Register a recorded trip that has not been submitted
    pub fn register(&self, trip_id: &str) {
        self.trips.lock().entry(trip_id.to_string()).or_default();
        self.publish();
    }

    /// Mark `keys` as submitted for `trip_id`
    ///
    /// Keys that previously failed are moved back in flight.
    pub fn begin<I, S>(&self, trip_id: &str, keys: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        {
            let mut trips = self.trips.lock();
            let files = trips.entry(trip_id.to_string()).or_default();
            for key in keys {
                let key = key.into();
                files.failed.remove(&key);
                files.completed.remove(&key);
                files.percent.remove(&key);
                files.in_flight.insert(key);
            }
        }
        self.publish();
    }

    /// Fold an upload event into the trip it belongs to
    pub fn apply(&self, event: &UploadEvent) {
        {
            let mut trips = self.trips.lock();
            let Some(files) = trips.get_mut(event.trip_id()) else {
                debug!("Upload event for untracked trip {:?}", event.trip_id());
                return;
            };

            match event {
                UploadEvent::Completed { key, .. } => {
                    files.in_flight.remove(key);
                    files.completed.insert(key.clone());
                }
                UploadEvent::Failed { key, error, .. } => {
                    files.in_flight.remove(key);
                    files.failed.insert(key.clone(), error.clone());
                }
                UploadEvent::Progress { key, percent, .. } => {
                    files.percent.insert(key.clone(), *percent);
                    return;
                }
            }
        }
        self.publish();
    }

    pub fn status(&self, trip_id: &str) -> Option<TripUploadStatus> {
        self.trips.lock().get(trip_id).map(TripFiles::status)
    }

    /// Overall percentage across the trip's submitted files
    pub fn progress(&self, trip_id: &str) -> Option<u8> {
        self.trips.lock().get(trip_id).map(TripFiles::progress)
    }

    /// Keys that failed terminally, with their error
    pub fn failed(&self, trip_id: &str) -> BTreeMap<String, String> {
        self.trips
            .lock()
            .get(trip_id)
            .map(|files| files.failed.clone())
            .unwrap_or_default()
    }

    /// Observe status changes of every trip
    pub fn watch(&self) -> watch::Receiver<BTreeMap<String, TripUploadStatus>> {
        self.statuses.subscribe()
    }

    fn publish(&self) {
        let snapshot: BTreeMap<String, TripUploadStatus> = self
            .trips
            .lock()
            .iter()
            .map(|(id, files)| (id.clone(), files.status()))
            .collect();
        self.statuses.send_replace(snapshot);
    }
}

/// Feed upload events into `tracker` until the queue goes away
pub fn spawn_tracker(tracker: Arc<TripUploadTracker>, mut events: broadcast::Receiver<UploadEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let UploadEvent::Failed { trip_id, key, error } = &event {
                        warn!("Trip {} upload of {} failed: {}", trip_id, key, error);
                    }
                    tracker.apply(&event);
                    if event.is_terminal() {
                        if let Some(status) = tracker.status(event.trip_id()) {
                            info!("Trip {} upload status: {:?}", event.trip_id(), status);
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Upload tracker lagged, {} events skipped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
