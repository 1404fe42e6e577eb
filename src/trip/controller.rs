//! # Trip Session Controller
//!
//! Ties the sensor link, the sample aggregator and the upload queue into
//! trip-sized sessions:
//!
//! 1. `start_trip` creates the trip directory and forwards decoded frames
//!    into a fresh aggregator
//! 2. `stop_trip` stops forwarding and flushes the tracks into the directory
//! 3. `submit_uploads` queues every trip file once the upload gate is open
//! 4. `retry_uploads` resubmits the files that failed terminally

use chrono::{DateTime, Local, Utc};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::gate::UploadGate;
use super::tracker::{spawn_tracker, TripUploadStatus, TripUploadTracker};
use crate::config::StorageConfig;
use crate::error::{RecorderError, Result};
use crate::frame::decoder::decode_lossy;
use crate::frame::protocol::FramePacket;
use crate::link::LinkHandle;
use crate::telemetry::{FlushSummary, SampleAggregator, TrackLayout};
use crate::upload::{UploadQueueHandle, UploadTask};

/// Files uploaded for a trip, in submission order
pub const TRIP_FILES: [&str; 5] = [
    "video.mp4",
    "gps_data.csv",
    "imu_data.csv",
    "esp32_gps.csv",
    "esp32_imu.csv",
];

/// Object key of a trip file
///
/// # Examples
///
/// ```
/// use fleet_recorder::trip::controller::destination_key;
///
/// assert_eq!(destination_key("42", "video.mp4"), "trips/42/video.mp4");
/// ```
pub fn destination_key(trip_id: &str, file_name: &str) -> String {
    format!("trips/{}/{}", trip_id, file_name)
}

/// Trip id used when the caller does not supply one (local time)
pub fn default_trip_id() -> String {
    Local::now().format("%Y%m%d%H%M%S").to_string()
}

/// What a finished trip left on disk
#[derive(Debug, Clone, PartialEq)]
pub struct TripArtifacts {
    pub trip_id: String,
    pub dir: PathBuf,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// Frames that decoded into samples
    pub samples_received: u64,
    pub tracks: FlushSummary,
}

struct ActiveTrip {
    id: String,
    dir: PathBuf,
    started_at: DateTime<Utc>,
    aggregator: Arc<SampleAggregator>,
    stop: oneshot::Sender<()>,
    forwarder: JoinHandle<u64>,
}

/// Records trips and submits their files
pub struct TripController<G: UploadGate> {
    storage: StorageConfig,
    link: LinkHandle,
    uploads: UploadQueueHandle,
    gate: G,
    tracker: Arc<TripUploadTracker>,
    tracker_task: JoinHandle<()>,
    active: Option<ActiveTrip>,
}

impl<G: UploadGate> TripController<G> {
    /// Create a controller; must be called inside a Tokio runtime
    pub fn new(storage: StorageConfig, link: LinkHandle, uploads: UploadQueueHandle, gate: G) -> Self {
        let tracker = Arc::new(TripUploadTracker::new());
        let tracker_task = spawn_tracker(Arc::clone(&tracker), uploads.subscribe());

        Self {
            storage,
            link,
            uploads,
            gate,
            tracker,
            tracker_task,
            active: None,
        }
    }

    /// Id of the trip being recorded
    pub fn active_trip_id(&self) -> Option<&str> {
        self.active.as_ref().map(|trip| trip.id.as_str())
    }

    pub fn is_recording(&self) -> bool {
        self.active.is_some()
    }

    /// Directory a trip's files live in
    pub fn trip_dir(&self, trip_id: &str) -> PathBuf {
        self.storage.trips_dir.join(trip_id)
    }

    pub fn tracker(&self) -> Arc<TripUploadTracker> {
        Arc::clone(&self.tracker)
    }

    /// Start recording a trip
    ///
    /// # Arguments
    ///
    /// * `trip_id` - Trip id, or `None` for the current local time
    ///
    /// # Returns
    ///
    /// * `Ok(String)` - The trip id in use
    ///
    /// # Errors
    ///
    /// * [`RecorderError::TripAlreadyActive`] - a trip is already recording
    /// * [`RecorderError::Io`] - the trip directory could not be created
    pub async fn start_trip(&mut self, trip_id: Option<String>) -> Result<String> {
        if let Some(active) = &self.active {
            return Err(RecorderError::TripAlreadyActive(active.id.clone()));
        }

        let id = trip_id.unwrap_or_else(default_trip_id);
        if !is_plain_name(&id) {
            return Err(RecorderError::InvalidTask(format!("invalid trip id {:?}", id)));
        }

        let dir = self.trip_dir(&id);
        tokio::fs::create_dir_all(&dir).await?;

        let aggregator = Arc::new(SampleAggregator::new());
        let (stop, stop_rx) = oneshot::channel();
        let forwarder = tokio::spawn(forward_frames(
            self.link.subscribe(),
            Arc::clone(&aggregator),
            stop_rx,
        ));

        info!("Trip {} recording into {}", id, dir.display());
        self.active = Some(ActiveTrip {
            id: id.clone(),
            dir,
            started_at: Utc::now(),
            aggregator,
            stop,
            forwarder,
        });
        Ok(id)
    }

    /// Stop recording and write the trip's tracks
    ///
    /// # Errors
    ///
    /// * [`RecorderError::TripNotActive`] - nothing is recording
    /// * [`RecorderError::Io`] - a track file could not be written
    pub async fn stop_trip(&mut self) -> Result<TripArtifacts> {
        let trip = self.active.take().ok_or(RecorderError::TripNotActive)?;

        let _ = trip.stop.send(());
        let samples_received = match trip.forwarder.await {
            Ok(count) => count,
            Err(e) => {
                warn!("Frame forwarder for trip {} ended abnormally: {}", trip.id, e);
                trip.aggregator.len() as u64
            }
        };

        let layout = TrackLayout::in_dir(
            &trip.dir,
            &format!("Trip {}", trip.id),
            trip.started_at,
            self.storage.export_gpx,
        );
        let aggregator = Arc::clone(&trip.aggregator);
        let tracks = tokio::task::spawn_blocking(move || aggregator.flush(&layout))
            .await
            .map_err(|e| RecorderError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;

        self.tracker.register(&trip.id);
        info!(
            "Trip {} stopped: {} samples, {} files written",
            trip.id,
            samples_received,
            tracks.files.len()
        );

        Ok(TripArtifacts {
            trip_id: trip.id,
            dir: trip.dir,
            started_at: trip.started_at,
            ended_at: Utc::now(),
            samples_received,
            tracks,
        })
    }

    /// Queue every file the trip has on disk
    ///
    /// # Returns
    ///
    /// * `Ok(Vec<UploadTask>)` - The tasks that were queued
    ///
    /// # Errors
    ///
    /// * [`RecorderError::GateClosed`] - the upload gate is closed
    /// * [`RecorderError::InvalidTask`] - the trip has no files
    pub async fn submit_uploads(&self, trip_id: &str) -> Result<Vec<UploadTask>> {
        if !self.gate.is_open() {
            return Err(RecorderError::GateClosed);
        }

        let mut tasks = Vec::new();
        for file_name in TRIP_FILES {
            if let Some(task) = self.trip_file_task(trip_id, file_name).await {
                tasks.push(task);
            }
        }
        if tasks.is_empty() {
            return Err(RecorderError::InvalidTask(format!("trip {} has no files to upload", trip_id)));
        }

        self.submit(trip_id, &tasks)?;
        info!("Submitted {} files of trip {}", tasks.len(), trip_id);
        Ok(tasks)
    }

    /// Resubmit the trip's failed files, starting over at attempt 0
    ///
    /// # Errors
    ///
    /// * [`RecorderError::GateClosed`] - the upload gate is closed
    pub async fn retry_uploads(&self, trip_id: &str) -> Result<Vec<UploadTask>> {
        if !self.gate.is_open() {
            return Err(RecorderError::GateClosed);
        }

        let failed = self.tracker.failed(trip_id);
        let mut tasks = Vec::new();
        for key in failed.keys() {
            let Some(file_name) = key.rsplit('/').next() else {
                continue;
            };
            match self.trip_file_task(trip_id, file_name).await {
                Some(task) if &task.destination_key == key => tasks.push(task),
                _ => warn!("Cannot retry {}: source file is gone", key),
            }
        }

        if tasks.is_empty() {
            debug!("Trip {} has nothing to retry", trip_id);
            return Ok(tasks);
        }

        self.submit(trip_id, &tasks)?;
        info!("Retrying {} files of trip {}", tasks.len(), trip_id);
        Ok(tasks)
    }

    pub fn upload_status(&self, trip_id: &str) -> Option<TripUploadStatus> {
        self.tracker.status(trip_id)
    }

    /// Wait until the trip's uploads reach `Completed` or `Failed`
    ///
    /// # Errors
    ///
    /// * [`RecorderError::ChannelClosed`] - the tracker went away
    pub async fn wait_for_uploads(&self, trip_id: &str) -> Result<TripUploadStatus> {
        let mut statuses = self.tracker.watch();
        loop {
            let status = statuses.borrow_and_update().get(trip_id).copied();
            if let Some(status @ (TripUploadStatus::Completed | TripUploadStatus::Failed)) = status {
                return Ok(status);
            }
            statuses
                .changed()
                .await
                .map_err(|_| RecorderError::ChannelClosed("trip tracker"))?;
        }
    }

    async fn trip_file_task(&self, trip_id: &str, file_name: &str) -> Option<UploadTask> {
        let path = self.trip_dir(trip_id).join(file_name);
        let absolute = tokio::fs::canonicalize(&path).await.ok()?;
        Some(UploadTask::new(
            absolute,
            destination_key(trip_id, file_name),
            Some(trip_id.to_string()),
        ))
    }

    fn submit(&self, trip_id: &str, tasks: &[UploadTask]) -> Result<()> {
        // Tracked before queueing so no completion can arrive untracked
        self.tracker
            .begin(trip_id, tasks.iter().map(|task| task.destination_key.clone()));
        for task in tasks {
            self.uploads.enqueue(task.clone())?;
        }
        Ok(())
    }
}

impl<G: UploadGate> Drop for TripController<G> {
    fn drop(&mut self) {
        if let Some(trip) = self.active.take() {
            warn!("Trip {} dropped while recording; samples discarded", trip.id);
            trip.forwarder.abort();
        }
        self.tracker_task.abort();
    }
}

/// A single normal path component, so the trip stays inside `trips_dir`
fn is_plain_name(id: &str) -> bool {
    let mut components = Path::new(id).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    ) && !id.trim().is_empty()
}

async fn forward_frames(
    mut frames: broadcast::Receiver<FramePacket>,
    aggregator: Arc<SampleAggregator>,
    mut stop: oneshot::Receiver<()>,
) -> u64 {
    let mut forwarded = 0u64;
    let mut accept = |packet: FramePacket| {
        if let Some(sample) = decode_lossy(&packet.data) {
            aggregator.push(sample);
            forwarded += 1;
        }
    };

    loop {
        tokio::select! {
            biased;

            _ = &mut stop => {
                // Keep what already arrived
                while let Ok(packet) = frames.try_recv() {
                    accept(packet);
                }
                break;
            }

            received = frames.recv() => match received {
                Ok(packet) => accept(packet),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Trip recorder fell behind, {} frames lost", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    forwarded
}
