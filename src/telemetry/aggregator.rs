//! # Sample Aggregator
//!
//! Thread-safe buffer of decoded samples for the active trip.
//!
//! `push` and `flush` share one lock. A flush takes the whole buffer and
//! leaves it empty before any file is written, so samples pushed during the
//! write land in the next flush.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::gpx::GpxTrack;
use crate::error::Result;
use crate::frame::protocol::SensorSample;

/// Header row of the position track
pub const POSITION_HEADER: &str = "timestamp,latitude,longitude,altitude";

/// Header row of the inertial track
pub const INERTIAL_HEADER: &str = "timestamp,ax,ay,az,gx,gy,gz";

/// Where a flush writes its files
#[derive(Debug, Clone, PartialEq)]
pub struct TrackLayout {
    pub position_csv: PathBuf,
    pub inertial_csv: PathBuf,
    /// `None` disables the GPX export
    pub position_gpx: Option<PathBuf>,
    /// Track name written into the GPX document
    pub name: String,
    /// Wall-clock time of the first sample, for GPX point times
    pub started_at: DateTime<Utc>,
}

impl TrackLayout {
    /// Standard file names inside a trip directory
    ///
    /// * `esp32_gps.csv` - position track
    /// * `esp32_imu.csv` - inertial track
    /// * `esp32_gps.gpx` - position track as GPX, when `export_gpx` is set
    pub fn in_dir(dir: &Path, name: &str, started_at: DateTime<Utc>, export_gpx: bool) -> Self {
        Self {
            position_csv: dir.join("esp32_gps.csv"),
            inertial_csv: dir.join("esp32_imu.csv"),
            position_gpx: export_gpx.then(|| dir.join("esp32_gps.gpx")),
            name: name.to_string(),
            started_at,
        }
    }
}

/// Result of a flush
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlushSummary {
    /// Rows written to the position track (valid GNSS only)
    pub position_rows: usize,
    /// Rows written to the inertial track (every sample)
    pub inertial_rows: usize,
    /// Files created, in write order
    pub files: Vec<PathBuf>,
}

impl FlushSummary {
    /// Nothing was buffered, so nothing was written
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Buffer of samples collected during a trip
#[derive(Debug, Default)]
pub struct SampleAggregator {
    samples: Mutex<Vec<SensorSample>>,
}

impl SampleAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a sample
    pub fn push(&self, sample: SensorSample) {
        self.samples.lock().push(sample);
    }

    /// Number of buffered samples
    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.lock().is_empty()
    }

    /// Drop every buffered sample without writing
    pub fn clear(&self) {
        self.samples.lock().clear();
    }

    /// Write the buffered samples out and empty the buffer
    ///
    /// # Arguments
    ///
    /// * `layout` - Destination paths; parent directories must exist
    ///
    /// # Returns
    ///
    /// * `Ok(FlushSummary)` - Row counts and created files. An empty buffer
    ///   creates no files and returns an empty summary.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::RecorderError::Io`] if a file cannot be written.
    /// The buffer is already empty at that point.
    pub fn flush(&self, layout: &TrackLayout) -> Result<FlushSummary> {
        let samples = std::mem::take(&mut *self.samples.lock());

        if samples.is_empty() {
            debug!("Nothing to flush");
            return Ok(FlushSummary::default());
        }

        let mut summary = FlushSummary::default();

        let positions: Vec<&SensorSample> = samples.iter().filter(|s| s.has_valid_gnss()).collect();
        write_csv(&layout.position_csv, POSITION_HEADER, &positions, |s| {
            format!("{},{},{},{}", s.timestamp_ms, s.latitude, s.longitude, s.altitude)
        })?;
        summary.position_rows = positions.len();
        summary.files.push(layout.position_csv.clone());

        let all: Vec<&SensorSample> = samples.iter().collect();
        write_csv(&layout.inertial_csv, INERTIAL_HEADER, &all, |s| {
            format!(
                "{},{},{},{},{},{},{}",
                s.timestamp_ms, s.ax, s.ay, s.az, s.gx, s.gy, s.gz
            )
        })?;
        summary.inertial_rows = all.len();
        summary.files.push(layout.inertial_csv.clone());

        if let Some(path) = &layout.position_gpx {
            let track = GpxTrack::from_samples(&layout.name, layout.started_at, &samples);
            std::fs::write(path, track.to_xml())?;
            summary.files.push(path.clone());
        }

        info!(
            "Flushed {} samples ({} with GNSS fix)",
            summary.inertial_rows, summary.position_rows
        );
        Ok(summary)
    }
}

fn write_csv<F>(path: &Path, header: &str, rows: &[&SensorSample], format_row: F) -> Result<()>
where
    F: Fn(&SensorSample) -> String,
{
    let mut writer = BufWriter::new(File::create(path)?);
    writeln!(writer, "{}", header)?;
    for row in rows {
        writeln!(writer, "{}", format_row(row))?;
    }
    writer.flush()?;
    Ok(())
}
