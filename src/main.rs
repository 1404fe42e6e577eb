//! # Fleet Recorder
//!
//! Records a trip from the sensor unit and ships its files to storage.
//!
//! The binary plays a recorded capture through the same link state machine a
//! radio would drive, writes the trip's tracks, then uploads them through the
//! resumable upload queue into a local bucket directory.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use tokio::time::{interval, Duration, Instant};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use fleet_recorder::config::{Config, LoggingConfig};
use fleet_recorder::error::RecorderError;
use fleet_recorder::link::adapter::event_channel;
use fleet_recorder::link::{LinkMachine, ReplayAdapter};
use fleet_recorder::trip::{StaticProbe, StatusMonitor, TripController, TripUploadStatus};
use fleet_recorder::upload::{LocalTransferEngine, TransferRecordStore, UploadQueue};

/// Seconds between status lines while recording
const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// Default configuration file location
const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

#[derive(Parser, Debug)]
#[command(name = "fleet-recorder", version, about = "Record a trip and upload its files")]
struct Args {
    /// Configuration file (defaults are used when the default path is missing)
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Capture of 44-byte sensor frames to replay as the sensor unit
    #[arg(long)]
    capture: PathBuf,

    /// Trip id (defaults to the current local time)
    #[arg(long)]
    trip_id: Option<String>,

    /// Stop recording after this many seconds
    #[arg(long)]
    duration_secs: Option<u64>,

    /// Replay the capture in a loop until stopped
    #[arg(long = "loop")]
    looping: bool,

    /// Record only, leave the files on disk
    #[arg(long)]
    no_upload: bool,
}

/// Load the configuration named on the command line
///
/// A missing file at the default location falls back to built-in defaults;
/// an explicitly named file must exist.
fn load_config(path: &Path) -> Result<(Config, bool)> {
    if path == Path::new(DEFAULT_CONFIG_PATH) && !path.exists() {
        return Ok((Config::default(), false));
    }
    let config = Config::load(path).with_context(|| format!("loading {}", path.display()))?;
    Ok((config, true))
}

/// Install the tracing subscriber
///
/// `RUST_LOG` overrides the configured level. When a log directory is set a
/// daily rolling file is written alongside stdout; the returned guard must
/// stay alive for buffered lines to reach the file.
fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let Some(dir) = &config.log_dir else {
        tracing_subscriber::fmt().with_env_filter(filter()).init();
        return Ok(None);
    };

    std::fs::create_dir_all(dir).with_context(|| format!("creating log dir {}", dir.display()))?;
    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "fleet-recorder.log"));

    tracing_subscriber::registry()
        .with(filter())
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer))
        .init();
    Ok(Some(guard))
}

/// Resolves once `deadline` passes; never when there is none
async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Main entry point
///
/// # Control Flow
///
/// 1. **Initialization**
///    - Load configuration and set up logging
///    - Start the link over the replayed capture
///    - Start the upload queue on the local bucket engine
///
/// 2. **Recording**
///    - Record until the duration elapses, the capture runs out or Ctrl+C
///    - Log link and network state every few seconds
///
/// 3. **Upload and Shutdown**
///    - Write the trip's tracks and submit every trip file
///    - Wait for each file to complete or fail, then stop everything
///
/// # Examples
///
/// ```bash
/// cargo run --release -- --capture drive.bin --duration-secs 60
/// ```
#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let (config, from_file) = load_config(&args.config)?;
    let _log_guard = init_logging(&config.logging)?;

    info!("Fleet Recorder v{} starting...", env!("CARGO_PKG_VERSION"));
    if !from_file {
        warn!("{} not found, using built-in defaults", args.config.display());
    }

    // Link over the replayed capture
    let (sink, events) = event_channel();
    let adapter = ReplayAdapter::from_file(&args.capture, sink, &config.ble)
        .with_context(|| format!("opening capture {}", args.capture.display()))?
        .looping(args.looping);
    info!("Replaying {} frames from {}", adapter.frame_count(), args.capture.display());
    let exhausted = adapter.exhausted();
    let (link, link_task) = LinkMachine::spawn(adapter, events, config.ble.clone());

    // Upload queue on the local bucket
    let store = TransferRecordStore::open(config.upload.records_path());
    let bucket_dir = config.upload.bucket_dir.clone();
    let engine_table = config.upload.engine_table_path();
    let (uploads, upload_task) = UploadQueue::start(
        move |sink| LocalTransferEngine::open(bucket_dir, engine_table, sink),
        store,
        &config.upload,
    );

    let (status, monitor_task) = StatusMonitor::spawn(StaticProbe::online(), link.watch_state(), &config.monitor);
    let mut controller = TripController::new(config.storage.clone(), link.clone(), uploads.clone(), status.clone());

    let trip_id = controller.start_trip(args.trip_id.clone()).await?;
    link.start()?;
    info!("Recording trip {}, press Ctrl+C to stop", trip_id);

    let deadline = args.duration_secs.map(|secs| Instant::now() + Duration::from_secs(secs));
    let mut status_log = interval(STATUS_LOG_INTERVAL);
    status_log.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, stopping trip...");
                break;
            }
            _ = wait_until(deadline) => {
                info!("Recording duration elapsed");
                break;
            }
            _ = exhausted.notified() => {
                info!("Capture fully replayed");
                break;
            }
            _ = status_log.tick() => {
                let current = status.borrow().clone();
                info!(
                    "Link {}, network {}",
                    current.link,
                    if current.network_available { "up" } else { "down" }
                );
            }
        }
    }

    let artifacts = controller.stop_trip().await?;
    link.stop().await?;
    info!(
        "Trip {} recorded {} samples into {}",
        artifacts.trip_id,
        artifacts.samples_received,
        artifacts.dir.display()
    );

    if args.no_upload {
        info!("Upload skipped");
    } else {
        match controller.submit_uploads(&artifacts.trip_id).await {
            Ok(tasks) => {
                info!("Uploading {} files", tasks.len());
                let outcome = tokio::select! {
                    result = controller.wait_for_uploads(&artifacts.trip_id) => Some(result?),
                    _ = tokio::signal::ctrl_c() => None,
                };
                match outcome {
                    Some(TripUploadStatus::Completed) => info!("Trip {} uploaded", artifacts.trip_id),
                    Some(TripUploadStatus::Failed) => {
                        for (key, error) in controller.tracker().failed(&artifacts.trip_id) {
                            warn!("{} failed: {}", key, error);
                        }
                    }
                    Some(other) => warn!("Trip {} upload ended as {:?}", artifacts.trip_id, other),
                    None => info!("Interrupted, unfinished uploads resume on next start"),
                }
            }
            Err(RecorderError::GateClosed) => warn!("Network unavailable, trip {} not uploaded", artifacts.trip_id),
            Err(RecorderError::InvalidTask(reason)) => warn!("Nothing uploaded: {}", reason),
            Err(e) => return Err(e.into()),
        }
    }

    uploads.shutdown().await?;
    // Every handle goes before joining so each task sees its channels close
    drop(controller);
    drop(link);
    drop(uploads);
    drop(status);
    let _ = tokio::join!(link_task, upload_task, monitor_task);

    info!("Fleet Recorder stopped");
    Ok(())
}
