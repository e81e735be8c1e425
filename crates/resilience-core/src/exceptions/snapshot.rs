//! Snapshot persistence for the exception store

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{Alert, ClassifiedException, ExceptionBucket, LogEntry, MinuteSeries};

/// Running exception counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExceptionCounters {
    pub total: u64,
    pub by_category: BTreeMap<String, u64>,
    pub by_severity: BTreeMap<String, u64>,
    pub by_component: BTreeMap<String, u64>,
    pub time_series: MinuteSeries<ExceptionBucket>,
}

/// Everything the store persists
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub logs: Vec<LogEntry>,
    pub exceptions: Vec<(Uuid, ClassifiedException)>,
    pub statistics: ExceptionCounters,
    pub alerts: Vec<(Uuid, Alert)>,
    pub timestamp: DateTime<Utc>,
}

/// Where snapshots are kept
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Latest snapshot, `None` when nothing was saved yet
    async fn load(&self) -> Result<Option<Snapshot>>;

    /// Replace the stored snapshot
    async fn save(&self, snapshot: &Snapshot) -> Result<()>;
}

/// Snapshot kept as a JSON file
#[derive(Debug, Clone)]
pub struct JsonFileSnapshotStore {
    path: PathBuf,
}

impl JsonFileSnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SnapshotStore for JsonFileSnapshotStore {
    async fn load(&self) -> Result<Option<Snapshot>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::persistence(format!(
                    "reading {}: {e}",
                    self.path.display()
                )))
            }
        };
        let snapshot = serde_json::from_slice(&bytes)?;
        debug!(path = %self.path.display(), "Snapshot loaded");
        Ok(Some(snapshot))
    }

    async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let bytes = serde_json::to_vec(snapshot)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Write then rename so a crash never leaves a truncated file
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), "Snapshot saved");
        Ok(())
    }
}

/// Snapshot kept in memory
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    snapshot: Mutex<Option<Snapshot>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last saved snapshot
    pub fn latest(&self) -> Option<Snapshot> {
        self.snapshot.lock().clone()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn load(&self) -> Result<Option<Snapshot>> {
        Ok(self.snapshot.lock().clone())
    }

    async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        *self.snapshot.lock() = Some(snapshot.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_snapshot() -> Snapshot {
        Snapshot {
            logs: Vec::new(),
            exceptions: Vec::new(),
            statistics: ExceptionCounters::default(),
            alerts: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_json_file_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileSnapshotStore::new(dir.path().join("missing.json"));
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_json_file_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileSnapshotStore::new(dir.path().join("nested/exceptions.json"));

        let mut snapshot = empty_snapshot();
        snapshot.statistics.total = 3;
        store.save(&snapshot).await.unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.statistics.total, 3);
        assert_eq!(loaded.timestamp, snapshot.timestamp);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, b"{not json").unwrap();

        let store = JsonFileSnapshotStore::new(path);
        assert!(matches!(store.load().await, Err(Error::Serialization(_))));
    }
}
