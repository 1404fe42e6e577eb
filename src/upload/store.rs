//! # Transfer Record Store
//!
//! Persists which engine transfer belongs to which upload task, so the
//! queue can reattach to transfers after a restart.
//!
//! File format (`transfers.json`):
//!
//! ```json
//! {
//!   "17": { "filePath": "/trips/42/video.mp4", "s3Key": "trips/42/video.mp4", "tripId": "42", "attempt": 1 }
//! }
//! ```
//!
//! An empty `tripId` means the task had no trip. Entries that do not parse,
//! or have a blank path or key, read as absent. Writes go to a sibling temp
//! file that is then renamed over the original.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::task::{TaskIdentity, TransferId, UploadTask};
use crate::error::Result;

#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord {
    #[serde(rename = "filePath")]
    file_path: String,

    #[serde(rename = "s3Key")]
    s3_key: String,

    #[serde(rename = "tripId", default)]
    trip_id: String,

    #[serde(default)]
    attempt: u32,
}

impl StoredRecord {
    fn from_task(task: &UploadTask) -> Self {
        Self {
            file_path: task.source_file_path.to_string_lossy().into_owned(),
            s3_key: task.destination_key.clone(),
            trip_id: task.correlation_id.clone().unwrap_or_default(),
            attempt: task.attempt_count,
        }
    }

    fn into_task(self) -> Option<UploadTask> {
        if self.file_path.trim().is_empty() || self.s3_key.trim().is_empty() {
            return None;
        }
        Some(UploadTask {
            source_file_path: PathBuf::from(self.file_path),
            destination_key: self.s3_key,
            correlation_id: (!self.trip_id.is_empty()).then_some(self.trip_id),
            attempt_count: self.attempt,
        })
    }
}

type RawTable = BTreeMap<String, serde_json::Value>;

/// Durable transfer id → task mapping
#[derive(Debug)]
pub struct TransferRecordStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl TransferRecordStore {
    /// Use `path` as the backing file; nothing is read until first access
    pub fn open<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record that `id` carries `task`
    pub fn save(&self, id: TransferId, task: &UploadTask) -> Result<()> {
        let _guard = self.lock.lock();
        let mut table = self.load_raw();
        table.insert(id.to_string(), serde_json::to_value(StoredRecord::from_task(task))?);
        self.store_raw(&table)?;
        debug!("Saved transfer record {} -> {}", id, task.destination_key);
        Ok(())
    }

    /// Task stored for `id`, if present and well-formed
    pub fn read(&self, id: TransferId) -> Option<UploadTask> {
        let _guard = self.lock.lock();
        self.load_raw().remove(&id.to_string()).and_then(parse_record)
    }

    /// Forget `id`; a missing entry is not an error
    pub fn remove(&self, id: TransferId) -> Result<()> {
        let _guard = self.lock.lock();
        let mut table = self.load_raw();
        if table.remove(&id.to_string()).is_some() {
            self.store_raw(&table)?;
            debug!("Removed transfer record {}", id);
        }
        Ok(())
    }

    /// Transfer id whose record matches the identity triple
    pub fn find(&self, identity: &TaskIdentity) -> Option<TransferId> {
        self.all()
            .into_iter()
            .find(|(_, task)| &task.identity() == identity)
            .map(|(id, _)| id)
    }

    /// Every well-formed record, ordered by id
    pub fn all(&self) -> Vec<(TransferId, UploadTask)> {
        let _guard = self.lock.lock();
        let mut records: Vec<(TransferId, UploadTask)> = self
            .load_raw()
            .into_iter()
            .filter_map(|(key, value)| {
                let id = key.parse::<u64>().ok().map(TransferId)?;
                parse_record(value).map(|task| (id, task))
            })
            .collect();
        records.sort_by_key(|(id, _)| *id);
        records
    }

    fn load_raw(&self) -> RawTable {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(_) => return RawTable::new(),
        };
        serde_json::from_str(&contents).unwrap_or_else(|e| {
            warn!("Ignoring unreadable transfer records {}: {}", self.path.display(), e);
            RawTable::new()
        })
    }

    fn store_raw(&self, table: &RawTable) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(table)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn parse_record(value: serde_json::Value) -> Option<UploadTask> {
    serde_json::from_value::<StoredRecord>(value)
        .ok()
        .and_then(StoredRecord::into_task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn task(trip: Option<&str>) -> UploadTask {
        UploadTask::new(
            "/trips/42/video.mp4",
            "trips/42/video.mp4",
            trip.map(str::to_string),
        )
    }

    fn store(dir: &TempDir) -> TransferRecordStore {
        TransferRecordStore::open(dir.path().join("state").join("transfers.json"))
    }

    #[test]
    fn test_save_and_read() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let saved = task(Some("42")).next_attempt();

        store.save(TransferId(7), &saved).unwrap();

        assert_eq!(store.read(TransferId(7)), Some(saved));
        assert_eq!(store.read(TransferId(8)), None);
    }

    #[test]
    fn test_file_format() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.save(TransferId(3), &task(None)).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(raw["3"]["filePath"], "/trips/42/video.mp4");
        assert_eq!(raw["3"]["s3Key"], "trips/42/video.mp4");
        assert_eq!(raw["3"]["tripId"], "");
        assert_eq!(raw["3"]["attempt"], 0);
    }

    #[test]
    fn test_empty_trip_id_reads_as_none() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.save(TransferId(1), &task(None)).unwrap();

        assert_eq!(store.read(TransferId(1)).unwrap().correlation_id, None);
    }

    #[test]
    fn test_find_by_identity() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.save(TransferId(1), &task(Some("41"))).unwrap();
        store.save(TransferId(2), &task(Some("42")).next_attempt()).unwrap();

        assert_eq!(store.find(&task(Some("42")).identity()), Some(TransferId(2)));
        assert_eq!(store.find(&task(None).identity()), None);
    }

    #[test]
    fn test_remove() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.save(TransferId(1), &task(None)).unwrap();

        store.remove(TransferId(1)).unwrap();
        store.remove(TransferId(1)).unwrap();

        assert!(store.all().is_empty());
    }

    #[test]
    fn test_malformed_entries_read_as_absent() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        std::fs::write(
            store.path(),
            r#"{
                "1": { "filePath": "", "s3Key": "trips/1/video.mp4" },
                "2": { "s3Key": "trips/2/video.mp4" },
                "3": "garbage",
                "x": { "filePath": "/a", "s3Key": "b" },
                "4": { "filePath": "/trips/4/video.mp4", "s3Key": "trips/4/video.mp4", "tripId": "4", "attempt": 2 }
            }"#,
        )
        .unwrap();

        let records = store.all();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].0, TransferId(4));
        assert_eq!(records[0].1.attempt_count, 2);
        assert_eq!(store.read(TransferId(1)), None);
    }

    #[test]
    fn test_corrupt_file_reads_empty_and_is_replaced() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        std::fs::write(store.path(), "{ not json").unwrap();

        assert!(store.all().is_empty());
        store.save(TransferId(9), &task(None)).unwrap();
        assert_eq!(store.all().len(), 1);
    }
}
