//! # Upload Task Queue
//!
//! Feeds upload tasks to the transfer engine one at a time and turns engine
//! callbacks into exactly one [`UploadEvent::Completed`] or
//! [`UploadEvent::Failed`] per task.
//!
//! ```text
//!  enqueue ─▶ queue ─▶ perform_upload ─▶ engine ─▶ TransferEvent
//!               ▲                                     │
//!               │  backoff (base × 2^attempt)         │ Failed / Error
//!               └────────── retry deadline ◀──────────┤
//!                                                     │ Completed
//!                                                     ▼
//!                                              UploadEvent::Completed
//! ```
//!
//! Each transfer the engine starts is recorded in the
//! [`TransferRecordStore`] so a later run can reattach to it instead of
//! uploading the file again.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use super::engine::{
    transfer_event_channel, TransferEngine, TransferEvent, TransferEventKind, TransferEventSink,
    TransferEvents,
};
use super::store::TransferRecordStore;
use super::task::{TransferId, TransferState, UploadEvent, UploadTask};
use crate::config::UploadConfig;
use crate::error::{RecorderError, Result};

/// Capacity of the outbound event broadcast
const EVENT_BUFFER: usize = 256;

/// Reported for every task when the engine could not be created
pub const ENGINE_NOT_INITIALIZED: &str = "transfer engine not initialized";

/// Reported when the source file is missing at upload time
pub const FILE_NOT_FOUND: &str = "file not found";

/// Retry and progress settings taken from [`UploadConfig`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub progress_step: u8,
}

impl RetryPolicy {
    /// Delay before retrying a task that failed on attempt `attempt_count`
    pub fn backoff(&self, attempt_count: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt_count)
    }
}

impl From<&UploadConfig> for RetryPolicy {
    fn from(config: &UploadConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: config.base_retry_delay(),
            progress_step: config.progress_step_percent.max(1),
        }
    }
}

/// Work the queue currently holds
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueSnapshot {
    /// Waiting for the current transfer to finish
    pub queued: Vec<UploadTask>,
    /// Attached to an engine transfer
    pub active: Vec<UploadTask>,
    /// Waiting out a retry backoff
    pub retrying: Vec<UploadTask>,
}

impl QueueSnapshot {
    pub fn is_idle(&self) -> bool {
        self.queued.is_empty() && self.active.is_empty() && self.retrying.is_empty()
    }
}

enum QueueCommand {
    Enqueue(UploadTask),
    Stop(oneshot::Sender<()>),
    Snapshot(oneshot::Sender<QueueSnapshot>),
    Shutdown(oneshot::Sender<()>),
}

/// Caller-side handle to the upload queue
#[derive(Debug, Clone)]
pub struct UploadQueueHandle {
    commands: mpsc::UnboundedSender<QueueCommand>,
    events: broadcast::Sender<UploadEvent>,
}

impl UploadQueueHandle {
    /// Queue a task
    ///
    /// # Errors
    ///
    /// * [`RecorderError::InvalidTask`] - blank source path or key
    /// * [`RecorderError::ChannelClosed`] - the queue has shut down
    pub fn enqueue(&self, task: UploadTask) -> Result<()> {
        task.validate()?;
        self.send(QueueCommand::Enqueue(task))
    }

    /// Receive outbound events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.events.subscribe()
    }

    /// Drop queued work, cancel retries and pause active transfers
    ///
    /// Persisted records are kept, so paused transfers are picked up again
    /// by the next queue started on the same store.
    pub async fn stop(&self) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.send(QueueCommand::Stop(ack_tx))?;
        ack_rx.await.map_err(|_| RecorderError::ChannelClosed("upload queue"))
    }

    /// Current queued, active and retrying work
    pub async fn snapshot(&self) -> Result<QueueSnapshot> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(QueueCommand::Snapshot(reply_tx))?;
        reply_rx.await.map_err(|_| RecorderError::ChannelClosed("upload queue"))
    }

    /// Stop and end the queue task
    pub async fn shutdown(&self) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.send(QueueCommand::Shutdown(ack_tx))?;
        ack_rx.await.map_err(|_| RecorderError::ChannelClosed("upload queue"))
    }

    fn send(&self, command: QueueCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| RecorderError::ChannelClosed("upload queue"))
    }
}

struct ActiveTransfer {
    task: UploadTask,
    last_step: Option<u8>,
}

/// The queue itself; owned by its task
pub struct UploadQueue<E: TransferEngine> {
    engine: Option<E>,
    store: TransferRecordStore,
    policy: RetryPolicy,
    queue: VecDeque<UploadTask>,
    current: Option<TransferId>,
    attached: HashMap<TransferId, ActiveTransfer>,
    retries: Vec<(Instant, UploadTask)>,
    events: broadcast::Sender<UploadEvent>,
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl<E: TransferEngine + 'static> UploadQueue<E> {
    /// Create the engine and spawn the queue task
    ///
    /// # Arguments
    ///
    /// * `init` - Builds the engine around the event sink it must report into
    /// * `store` - Persisted transfer records
    /// * `config` - Retry ceiling, backoff and progress step
    ///
    /// # Returns
    ///
    /// * `(UploadQueueHandle, JoinHandle<()>)` - Handle for callers and the task handle
    ///
    /// If `init` fails the queue still starts, and every task reports
    /// `Failed("transfer engine not initialized")`.
    pub fn start<F>(init: F, store: TransferRecordStore, config: &UploadConfig) -> (UploadQueueHandle, JoinHandle<()>)
    where
        F: FnOnce(TransferEventSink) -> Result<E>,
    {
        let (sink, engine_events) = transfer_event_channel();
        let engine = match init(sink) {
            Ok(engine) => Some(engine),
            Err(e) => {
                error!("Transfer engine failed to initialize: {}", e);
                None
            }
        };

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_BUFFER);

        let handle = UploadQueueHandle {
            commands: commands_tx,
            events: events.clone(),
        };

        let queue = UploadQueue {
            engine,
            store,
            policy: RetryPolicy::from(config),
            queue: VecDeque::new(),
            current: None,
            attached: HashMap::new(),
            retries: Vec::new(),
            events,
        };

        let task = tokio::spawn(queue.run(commands_rx, engine_events));
        (handle, task)
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<QueueCommand>, mut engine_events: TransferEvents) {
        self.recover().await;

        loop {
            let next_retry = self.retries.iter().map(|(at, _)| *at).min();

            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(QueueCommand::Enqueue(task)) => self.enqueue(task).await,
                    Some(QueueCommand::Stop(ack)) => {
                        self.stop().await;
                        let _ = ack.send(());
                    }
                    Some(QueueCommand::Snapshot(reply)) => {
                        let _ = reply.send(self.snapshot());
                    }
                    Some(QueueCommand::Shutdown(ack)) => {
                        self.stop().await;
                        let _ = ack.send(());
                        break;
                    }
                    None => break,
                },

                Some(event) = engine_events.recv() => self.handle_transfer_event(event).await,

                _ = wait_until(next_retry) => self.release_due_retries().await,
            }
        }

        info!("Upload queue stopped");
    }

    /// Reattach to transfers left over from a previous run
    async fn recover(&mut self) {
        let Some(engine) = &self.engine else {
            return;
        };

        let transfers = match engine.transfers().await {
            Ok(transfers) => transfers,
            Err(e) => {
                warn!("Could not list engine transfers for recovery: {}", e);
                return;
            }
        };

        // Records the engine no longer knows about can never be reattached
        let listed: HashSet<TransferId> = transfers.iter().map(|info| info.id).collect();
        for (id, task) in self.store.all() {
            if !listed.contains(&id) {
                debug!("Pruning record {} for {}: unknown to the engine", id, task.destination_key);
                self.remove_record(id);
            }
        }

        for info in transfers {
            let Some(task) = self.store.read(info.id) else {
                continue;
            };

            if !info.state.is_recoverable() {
                debug!("Dropping record for {} transfer {}", state_name(info.state), info.id);
                self.remove_record(info.id);
                continue;
            }

            info!("Recovering transfer {} ({}) in state {}", info.id, task.destination_key, state_name(info.state));
            self.attach(info.id, task);
            if self.current.is_none() {
                self.current = Some(info.id);
            }
            if info.state.needs_resume() {
                self.resume(info.id).await;
            }
        }

        // A failed resume may have freed the slot while others stay attached
        if self.current.is_none() {
            self.current = self.attached.keys().min().copied();
        }
    }

    async fn enqueue(&mut self, task: UploadTask) {
        if self.is_attached(&task) {
            debug!("{} is already in flight, not queueing again", task.destination_key);
            return;
        }
        self.queue.push_back(task);
        self.process_next().await;
    }

    async fn process_next(&mut self) {
        while self.current.is_none() {
            let Some(task) = self.queue.pop_front() else {
                return;
            };
            self.perform_upload(task).await;
        }
    }

    async fn perform_upload(&mut self, task: UploadTask) {
        let Some(engine) = &self.engine else {
            self.emit_failed(&task, ENGINE_NOT_INITIALIZED.to_string());
            return;
        };

        if !task.source_file_path.exists() {
            warn!("Upload source {} does not exist", task.source_file_path.display());
            self.emit_failed(&task, FILE_NOT_FOUND.to_string());
            return;
        }

        if self.is_attached(&task) {
            debug!("{} is already in flight, skipping duplicate", task.destination_key);
            return;
        }

        if let Some(id) = self.store.find(&task.identity()) {
            match engine.transfer(id).await {
                Ok(Some(info)) if info.state.is_recoverable() => {
                    info!("Reattaching {} to transfer {}", task.destination_key, id);
                    let stored = self.store.read(id).map(|t| t.attempt_count).unwrap_or(0);
                    let attempt_count = task.attempt_count.max(stored);
                    self.attach(id, UploadTask { attempt_count, ..task });
                    self.current = Some(id);
                    if info.state.needs_resume() {
                        self.resume(id).await;
                    }
                    return;
                }
                Ok(Some(info)) if info.state == TransferState::Completed => {
                    info!("{} already uploaded by transfer {}", task.destination_key, id);
                    self.remove_record(id);
                    self.emit(UploadEvent::Completed {
                        trip_id: task.trip_id(),
                        key: task.destination_key.clone(),
                    });
                    return;
                }
                Ok(_) => debug!("Dropping stale record {} for {}", id, task.destination_key),
                Err(e) => warn!("Lookup of transfer {} failed, uploading afresh: {}", id, e),
            }
            self.remove_record(id);
        }

        let Some(engine) = &self.engine else {
            return;
        };
        match engine.upload(&task.destination_key, &task.source_file_path).await {
            Ok(id) => {
                info!(
                    "Uploading {} as transfer {} (attempt {})",
                    task.destination_key,
                    id,
                    task.attempt_count + 1
                );
                if let Err(e) = self.store.save(id, &task) {
                    warn!("Could not persist transfer record {}: {}", id, e);
                }
                self.attach(id, task);
                self.current = Some(id);
            }
            Err(e) => self.on_failure(task, e.to_string()),
        }
    }

    async fn handle_transfer_event(&mut self, event: TransferEvent) {
        let TransferEvent { id, kind } = event;

        match kind {
            TransferEventKind::StateChanged(TransferState::Completed) => {
                let Some(active) = self.detach(id) else {
                    debug!("Completion for unattached transfer {}", id);
                    return;
                };
                self.remove_record(id);
                info!("Upload of {} completed", active.task.destination_key);
                self.emit(UploadEvent::Completed {
                    trip_id: active.task.trip_id(),
                    key: active.task.destination_key,
                });
                self.process_next().await;
            }
            TransferEventKind::StateChanged(state @ (TransferState::Failed | TransferState::Canceled)) => {
                self.transfer_failed(id, format!("transfer {}", state_name(state))).await;
            }
            TransferEventKind::StateChanged(state) => {
                debug!("Transfer {} is {}", id, state_name(state));
            }
            TransferEventKind::Error(message) => {
                self.transfer_failed(id, message).await;
            }
            TransferEventKind::Progress { bytes_current, bytes_total } => {
                self.on_progress(id, bytes_current, bytes_total);
            }
        }
    }

    async fn transfer_failed(&mut self, id: TransferId, error: String) {
        self.fail_attached(id, error);
        self.process_next().await;
    }

    /// Detach a failed transfer and schedule its retry; the caller advances the queue
    fn fail_attached(&mut self, id: TransferId, error: String) {
        let Some(active) = self.detach(id) else {
            debug!("Failure for unattached transfer {}: {}", id, error);
            return;
        };
        self.remove_record(id);
        self.on_failure(active.task, error);
    }

    fn on_failure(&mut self, task: UploadTask, error: String) {
        let next = task.next_attempt();
        if next.attempt_count < self.policy.max_attempts {
            let delay = self.policy.backoff(task.attempt_count);
            warn!(
                "Upload of {} failed ({}), retry {}/{} in {:?}",
                task.destination_key,
                error,
                next.attempt_count,
                self.policy.max_attempts - 1,
                delay
            );
            self.retries.push((Instant::now() + delay, next));
        } else {
            error!(
                "Upload of {} failed after {} attempts: {}",
                task.destination_key, next.attempt_count, error
            );
            self.emit_failed(&task, error);
        }
    }

    fn on_progress(&mut self, id: TransferId, bytes_current: u64, bytes_total: u64) {
        if bytes_total == 0 {
            return;
        }
        let step = self.policy.progress_step;
        let Some(active) = self.attached.get_mut(&id) else {
            return;
        };

        let percent = (bytes_current.min(bytes_total) * 100 / bytes_total) as u8;
        let bucket = percent / step * step;
        if active.last_step == Some(bucket) {
            return;
        }
        active.last_step = Some(bucket);

        let event = UploadEvent::Progress {
            trip_id: active.task.trip_id(),
            key: active.task.destination_key.clone(),
            percent: bucket,
        };
        self.emit(event);
    }

    async fn release_due_retries(&mut self) {
        let now = Instant::now();
        let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.retries)
            .into_iter()
            .partition(|(at, _)| *at <= now);
        self.retries = waiting;

        for (_, task) in due {
            debug!("Retrying {} (attempt {})", task.destination_key, task.attempt_count + 1);
            self.queue.push_back(task);
        }
        self.process_next().await;
    }

    async fn stop(&mut self) {
        info!(
            "Stopping uploads: {} queued, {} retrying, {} active",
            self.queue.len(),
            self.retries.len(),
            self.attached.len()
        );
        self.queue.clear();
        self.retries.clear();
        self.current = None;

        let ids: Vec<TransferId> = self.attached.drain().map(|(id, _)| id).collect();
        if let Some(engine) = &self.engine {
            for id in ids {
                if let Err(e) = engine.pause(id).await {
                    warn!("Could not pause transfer {}: {}", id, e);
                }
            }
        }
    }

    fn snapshot(&self) -> QueueSnapshot {
        let mut active: Vec<(TransferId, UploadTask)> = self
            .attached
            .iter()
            .map(|(id, active)| (*id, active.task.clone()))
            .collect();
        active.sort_by_key(|(id, _)| *id);

        QueueSnapshot {
            queued: self.queue.iter().cloned().collect(),
            active: active.into_iter().map(|(_, task)| task).collect(),
            retrying: self.retries.iter().map(|(_, task)| task.clone()).collect(),
        }
    }

    async fn resume(&mut self, id: TransferId) {
        let Some(engine) = &self.engine else {
            return;
        };
        if let Err(e) = engine.resume(id).await {
            warn!("Could not resume transfer {}: {}", id, e);
            self.fail_attached(id, e.to_string());
        }
    }

    fn attach(&mut self, id: TransferId, task: UploadTask) {
        self.attached.insert(id, ActiveTransfer { task, last_step: None });
    }

    fn detach(&mut self, id: TransferId) -> Option<ActiveTransfer> {
        if self.current == Some(id) {
            self.current = None;
        }
        self.attached.remove(&id)
    }

    fn is_attached(&self, task: &UploadTask) -> bool {
        let identity = task.identity();
        self.attached.values().any(|active| active.task.identity() == identity)
    }

    fn remove_record(&self, id: TransferId) {
        if let Err(e) = self.store.remove(id) {
            warn!("Could not remove transfer record {}: {}", id, e);
        }
    }

    fn emit_failed(&self, task: &UploadTask, error: String) {
        self.emit(UploadEvent::Failed {
            trip_id: task.trip_id(),
            key: task.destination_key.clone(),
            error,
        });
    }

    fn emit(&self, event: UploadEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

fn state_name(state: TransferState) -> &'static str {
    match state {
        TransferState::Waiting => "waiting",
        TransferState::InProgress => "in progress",
        TransferState::ResumedWaiting => "resumed waiting",
        TransferState::Paused => "paused",
        TransferState::Failed => "failed",
        TransferState::WaitingForNetwork => "waiting for network",
        TransferState::Completed => "completed",
        TransferState::Canceled => "canceled",
        TransferState::Unknown => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::engine::mocks::{Outcome, ScriptedEngine};
    use crate::upload::engine::{MockTransferEngine, TransferInfo};
    use parking_lot::Mutex;
    use std::path::PathBuf;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        engine: ScriptedEngine,
        queue: UploadQueueHandle,
        events: broadcast::Receiver<UploadEvent>,
    }

    impl Fixture {
        fn records(&self) -> TransferRecordStore {
            TransferRecordStore::open(self.dir.path().join("transfers.json"))
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    fn source(dir: &TempDir, trip: &str) -> PathBuf {
        let trip_dir = dir.path().join("trips").join(trip);
        std::fs::create_dir_all(&trip_dir).unwrap();
        let path = trip_dir.join("video.mp4");
        std::fs::write(&path, b"not really a video").unwrap();
        path
    }

    fn video_task(dir: &TempDir, trip: &str) -> UploadTask {
        UploadTask::new(source(dir, trip), format!("trips/{}/video.mp4", trip), Some(trip.to_string()))
    }

    /// Start a queue whose engine shares state with the returned handle
    fn start_with(dir: TempDir, prepare: impl FnOnce(&ScriptedEngine)) -> Fixture {
        let slot: Arc<Mutex<Option<ScriptedEngine>>> = Arc::new(Mutex::new(None));
        let init_slot = Arc::clone(&slot);
        let store = TransferRecordStore::open(dir.path().join("transfers.json"));
        let (queue, _task) = UploadQueue::start(
            move |sink| {
                let engine = ScriptedEngine::new(sink);
                prepare(&engine);
                *init_slot.lock() = Some(engine.clone());
                Ok(engine)
            },
            store,
            &UploadConfig::default(),
        );
        let engine = slot.lock().take().unwrap();
        let events = queue.subscribe();
        Fixture { dir, engine, queue, events }
    }

    fn start() -> Fixture {
        start_with(TempDir::new().unwrap(), |_| {})
    }

    fn drain(events: &mut broadcast::Receiver<UploadEvent>) -> Vec<UploadEvent> {
        let mut drained = Vec::new();
        while let Ok(event) = events.try_recv() {
            drained.push(event);
        }
        drained
    }

    fn terminal(events: &mut broadcast::Receiver<UploadEvent>) -> Vec<UploadEvent> {
        drain(events).into_iter().filter(UploadEvent::is_terminal).collect()
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy::from(&UploadConfig::default());
        assert_eq!(policy.backoff(0), Duration::from_secs(4));
        assert_eq!(policy.backoff(1), Duration::from_secs(8));
        assert_eq!(policy.backoff(2), Duration::from_secs(16));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_emits_completed_and_clears_record() {
        let mut f = start();
        f.queue.enqueue(video_task(&f.dir, "7")).unwrap();
        settle().await;

        assert_eq!(
            terminal(&mut f.events),
            vec![UploadEvent::Completed {
                trip_id: "7".to_string(),
                key: "trips/7/video.mp4".to_string(),
            }]
        );
        assert!(f.records().all().is_empty());
        assert!(f.queue.snapshot().await.unwrap().is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_failures_then_success() {
        let mut f = start();
        f.engine.script([Outcome::Fail, Outcome::Fail, Outcome::Complete]);
        let start = Instant::now();

        f.queue.enqueue(video_task(&f.dir, "42")).unwrap();
        settle().await;
        assert_eq!(f.engine.uploads().len(), 1);

        // First retry after 4 s
        tokio::time::sleep_until(start + Duration::from_millis(3_900)).await;
        assert_eq!(f.engine.uploads().len(), 1);
        tokio::time::sleep_until(start + Duration::from_millis(4_100)).await;
        assert_eq!(f.engine.uploads().len(), 2);

        // Second retry 8 s after that
        tokio::time::sleep_until(start + Duration::from_millis(11_900)).await;
        assert_eq!(f.engine.uploads().len(), 2);
        tokio::time::sleep_until(start + Duration::from_millis(12_100)).await;
        assert_eq!(f.engine.uploads().len(), 3);

        assert_eq!(
            terminal(&mut f.events),
            vec![UploadEvent::Completed {
                trip_id: "42".to_string(),
                key: "trips/42/video.mp4".to_string(),
            }]
        );
        assert!(f.records().all().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ceiling_reached_emits_single_failure() {
        let mut f = start();
        f.engine.script([
            Outcome::Fail,
            Outcome::Error("socket closed".to_string()),
            Outcome::Fail,
        ]);

        f.queue.enqueue(video_task(&f.dir, "9")).unwrap();
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert_eq!(f.engine.uploads().len(), 3);
        let events = terminal(&mut f.events);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], UploadEvent::Failed { trip_id, error, .. }
            if trip_id == "9" && error == "transfer failed"));
        assert!(f.records().all().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_in_flight_is_folded() {
        let mut f = start();
        f.engine.script([Outcome::Hang]);

        let task = video_task(&f.dir, "42");
        f.queue.enqueue(task.clone()).unwrap();
        f.queue.enqueue(task).unwrap();
        settle().await;

        assert_eq!(f.engine.uploads().len(), 1);
        assert_eq!(f.queue.snapshot().await.unwrap().active.len(), 1);

        f.engine.emit(TransferId(1), TransferEventKind::StateChanged(TransferState::Completed));
        settle().await;
        assert_eq!(terminal(&mut f.events).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_transfer_at_a_time() {
        let mut f = start();
        f.engine.script([Outcome::Hang]);

        f.queue.enqueue(video_task(&f.dir, "1")).unwrap();
        f.queue.enqueue(video_task(&f.dir, "2")).unwrap();
        settle().await;

        let snapshot = f.queue.snapshot().await.unwrap();
        assert_eq!(snapshot.active.len(), 1);
        assert_eq!(snapshot.queued.len(), 1);
        assert_eq!(f.engine.uploads(), vec!["trips/1/video.mp4".to_string()]);

        f.engine.emit(TransferId(1), TransferEventKind::StateChanged(TransferState::Completed));
        settle().await;

        assert_eq!(f.engine.uploads().len(), 2);
        assert_eq!(terminal(&mut f.events).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_does_not_block_queue() {
        let mut f = start();
        f.engine.script([Outcome::Fail, Outcome::Complete]);

        f.queue.enqueue(video_task(&f.dir, "1")).unwrap();
        f.queue.enqueue(video_task(&f.dir, "2")).unwrap();
        settle().await;

        // Trip 2 went ahead while trip 1 waits out its backoff
        assert_eq!(
            terminal(&mut f.events),
            vec![UploadEvent::Completed {
                trip_id: "2".to_string(),
                key: "trips/2/video.mp4".to_string(),
            }]
        );
        assert_eq!(f.queue.snapshot().await.unwrap().retrying.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_reported_in_whole_steps() {
        let mut f = start();
        f.engine.script([Outcome::Progress(vec![
            (5, 100),
            (10, 100),
            (12, 100),
            (19, 100),
            (20, 100),
            (99, 100),
        ])]);

        f.queue.enqueue(video_task(&f.dir, "3")).unwrap();
        settle().await;

        let percents: Vec<u8> = drain(&mut f.events)
            .into_iter()
            .filter_map(|event| match event {
                UploadEvent::Progress { percent, .. } => Some(percent),
                _ => None,
            })
            .collect();
        assert_eq!(percents, vec![0, 10, 20, 90]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_source_reports_failure() {
        let mut f = start();
        f.queue
            .enqueue(UploadTask::new("/nonexistent/video.mp4", "trips/5/video.mp4", Some("5".to_string())))
            .unwrap();
        settle().await;

        assert_eq!(
            terminal(&mut f.events),
            vec![UploadEvent::Failed {
                trip_id: "5".to_string(),
                key: "trips/5/video.mp4".to_string(),
                error: FILE_NOT_FOUND.to_string(),
            }]
        );
        assert!(f.engine.uploads().is_empty());
    }

    #[tokio::test]
    async fn test_blank_task_rejected_synchronously() {
        let f = start();
        let result = f.queue.enqueue(UploadTask::new("", "trips/1/video.mp4", None));
        assert!(matches!(result, Err(RecorderError::InvalidTask(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_engine_init_failure_fails_every_task() {
        let dir = TempDir::new().unwrap();
        let store = TransferRecordStore::open(dir.path().join("transfers.json"));
        let (queue, _task) = UploadQueue::<ScriptedEngine>::start(
            |_| Err(RecorderError::EngineInit("no credentials".to_string())),
            store,
            &UploadConfig::default(),
        );
        let mut events = queue.subscribe();

        queue.enqueue(video_task(&dir, "1")).unwrap();
        queue.enqueue(video_task(&dir, "2")).unwrap();
        settle().await;

        let events = terminal(&mut events);
        assert_eq!(events.len(), 2);
        for event in events {
            assert!(matches!(event, UploadEvent::Failed { error, .. } if error == ENGINE_NOT_INITIALIZED));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_retries_and_pauses_active() {
        let mut f = start();
        f.engine.script([Outcome::Fail, Outcome::Hang]);

        f.queue.enqueue(video_task(&f.dir, "1")).unwrap();
        f.queue.enqueue(video_task(&f.dir, "2")).unwrap();
        f.queue.enqueue(video_task(&f.dir, "3")).unwrap();
        settle().await;

        f.queue.stop().await.unwrap();
        assert_eq!(f.engine.paused(), vec![TransferId(2)]);
        assert!(f.queue.snapshot().await.unwrap().is_idle());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(f.engine.uploads().len(), 2);
        assert!(terminal(&mut f.events).is_empty());

        // Paused transfer keeps its record for the next run
        assert_eq!(f.records().all().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_resumes_paused_transfers() {
        let dir = TempDir::new().unwrap();
        let task = video_task(&dir, "42");
        TransferRecordStore::open(dir.path().join("transfers.json"))
            .save(TransferId(5), &task)
            .unwrap();

        let recovered = task.clone();
        let mut f = start_with(dir, move |engine| {
            engine.preload(TransferInfo {
                id: TransferId(5),
                key: recovered.destination_key.clone(),
                source: recovered.source_file_path.clone(),
                state: TransferState::Paused,
                bytes_current: 10,
                bytes_total: 100,
            });
        });
        settle().await;

        assert_eq!(f.engine.resumed(), vec![TransferId(5)]);
        assert!(f.engine.uploads().is_empty());
        assert_eq!(
            terminal(&mut f.events),
            vec![UploadEvent::Completed {
                trip_id: "42".to_string(),
                key: "trips/42/video.mp4".to_string(),
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_reattaches_to_persisted_transfer() {
        let dir = TempDir::new().unwrap();
        let task = video_task(&dir, "42");
        TransferRecordStore::open(dir.path().join("transfers.json"))
            .save(TransferId(5), &task)
            .unwrap();

        // Left waiting for network by the previous run
        let known = task.clone();
        let mut f = start_with(dir, move |engine| {
            engine.preload(TransferInfo {
                id: TransferId(5),
                key: known.destination_key.clone(),
                source: known.source_file_path.clone(),
                state: TransferState::WaitingForNetwork,
                bytes_current: 0,
                bytes_total: 100,
            });
            engine.script([Outcome::Hang]);
        });
        settle().await;
        assert_eq!(f.engine.resumed(), vec![TransferId(5)]);

        // The same file enqueued again folds into the recovered transfer
        f.queue.enqueue(task).unwrap();
        settle().await;
        assert!(f.engine.uploads().is_empty());

        f.engine.emit(TransferId(5), TransferEventKind::StateChanged(TransferState::Completed));
        settle().await;
        assert_eq!(terminal(&mut f.events).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_record_is_replaced() {
        let dir = TempDir::new().unwrap();
        let task = video_task(&dir, "42");
        TransferRecordStore::open(dir.path().join("transfers.json"))
            .save(TransferId(99), &task)
            .unwrap();

        let mut f = start_with(dir, |_| {});
        f.queue.enqueue(task).unwrap();
        settle().await;

        assert_eq!(f.engine.uploads(), vec!["trips/42/video.mp4".to_string()]);
        assert_eq!(terminal(&mut f.events).len(), 1);
        assert_eq!(f.records().read(TransferId(99)), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_request_error_is_retried() {
        let dir = TempDir::new().unwrap();
        let task = video_task(&dir, "8");
        let store = TransferRecordStore::open(dir.path().join("transfers.json"));

        let mut engine = MockTransferEngine::new();
        engine.expect_transfers().returning(|| Ok(Vec::new()));
        engine.expect_transfer().returning(|_| Ok(None));
        engine
            .expect_upload()
            .times(3)
            .returning(|_, _| Err(RecorderError::Transfer("endpoint unreachable".to_string())));

        let (queue, _task) = UploadQueue::start(|_| Ok(engine), store, &UploadConfig::default());
        let mut events = queue.subscribe();
        queue.enqueue(task).unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;

        let events = terminal(&mut events);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], UploadEvent::Failed { error, .. } if error.contains("endpoint unreachable")));
        queue.shutdown().await.unwrap();
    }

    fn paused(task: &UploadTask, id: u64) -> TransferInfo {
        TransferInfo {
            id: TransferId(id),
            key: task.destination_key.clone(),
            source: task.source_file_path.clone(),
            state: TransferState::Paused,
            bytes_current: 10,
            bytes_total: 100,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_resume_at_recovery_is_retried_fresh() {
        let dir = TempDir::new().unwrap();
        let task = video_task(&dir, "42");
        TransferRecordStore::open(dir.path().join("transfers.json"))
            .save(TransferId(5), &task)
            .unwrap();

        let recovered = task.clone();
        let mut f = start_with(dir, move |engine| {
            engine.preload(paused(&recovered, 5));
            engine.script([Outcome::Refuse("resume rejected".to_string())]);
        });
        settle().await;

        assert_eq!(f.engine.resumed(), vec![TransferId(5)]);
        assert!(f.engine.uploads().is_empty());
        assert_eq!(f.records().read(TransferId(5)), None);
        let snapshot = f.queue.snapshot().await.unwrap();
        assert!(snapshot.active.is_empty());
        assert_eq!(snapshot.retrying.len(), 1);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(f.engine.uploads(), vec!["trips/42/video.mp4".to_string()]);
        assert_eq!(
            terminal(&mut f.events),
            vec![UploadEvent::Completed {
                trip_id: "42".to_string(),
                key: "trips/42/video.mp4".to_string(),
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_resume_on_reattach_advances_queue() {
        let dir = TempDir::new().unwrap();
        let task = video_task(&dir, "42");
        let other = video_task(&dir, "43");

        let known = task.clone();
        let mut f = start_with(dir, move |engine| {
            engine.preload(paused(&known, 5));
            engine.script([Outcome::Refuse("resume rejected".to_string())]);
        });
        settle().await;
        // Written after recovery so only the enqueue path finds it
        f.records().save(TransferId(5), &task).unwrap();

        f.queue.enqueue(task).unwrap();
        f.queue.enqueue(other).unwrap();
        settle().await;

        assert_eq!(f.engine.resumed(), vec![TransferId(5)]);
        assert_eq!(f.engine.uploads(), vec!["trips/43/video.mp4".to_string()]);
        assert_eq!(terminal(&mut f.events).len(), 1);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(
            f.engine.uploads(),
            vec!["trips/43/video.mp4".to_string(), "trips/42/video.mp4".to_string()]
        );
        let done = terminal(&mut f.events);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].key(), "trips/42/video.mp4");
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_prunes_records_unknown_to_engine() {
        let dir = TempDir::new().unwrap();
        let task = video_task(&dir, "42");
        let store = TransferRecordStore::open(dir.path().join("transfers.json"));
        store.save(TransferId(99), &task).unwrap();

        let f = start_with(dir, |_| {});
        settle().await;

        assert!(f.records().all().is_empty());
        assert!(f.engine.uploads().is_empty());
    }
}
