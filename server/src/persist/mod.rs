//! Snapshot persistence for the metric store
//!
//! The store is authoritative; disk is a warm-start cache. Saves are atomic
//! (tmp file then rename) so a crash mid-write never leaves a torn snapshot.
//! An unreadable snapshot is moved aside and the server starts empty rather
//! than refusing to boot.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;

use crate::core::constants::SNAPSHOT_VERSION;
use crate::store::{MetricRecord, MetricStore};

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("No space left for snapshot at {path}")]
    StorageExhausted { path: PathBuf },

    #[error("Snapshot I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("Snapshot serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFile {
    version: u32,
    saved_at: DateTime<Utc>,
    #[serde(default)]
    last_received: Option<DateTime<Utc>>,
    records: Vec<MetricRecord>,
}

/// Outcome of one flush pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    Saved { records: usize },
    /// Nothing arrived since the previous save
    Unchanged,
}

pub struct PersistenceManager {
    path: PathBuf,
    store: Arc<MetricStore>,
    interval: Duration,
    /// `last_received` marker of the store at the previous successful save
    saved_marker: Mutex<Option<DateTime<Utc>>>,
}

impl PersistenceManager {
    pub fn new(path: PathBuf, store: Arc<MetricStore>, interval: Duration) -> Self {
        Self {
            path,
            store,
            interval,
            saved_marker: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the snapshot into the store.
    ///
    /// A missing file means a fresh install. An unreadable or unparsable file
    /// is renamed to a `.corrupt-<timestamp>` sibling and ignored; losing
    /// history is preferable to failing startup. Returns the number of
    /// records restored.
    pub fn load(&self) -> Result<usize, PersistError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::info!(path = %self.path.display(), "No snapshot found, starting empty");
                return Ok(0);
            }
            Err(e) => return Err(e.into()),
        };

        let snapshot: SnapshotFile = match serde_json::from_str(&raw) {
            Ok(s) => s,
            Err(e) => {
                let backup = self.quarantine_corrupted(&format!("parse error: {e}"))?;
                tracing::warn!(
                    path = %self.path.display(),
                    backup = %backup.display(),
                    "Corrupted snapshot moved aside, starting empty"
                );
                return Ok(0);
            }
        };

        if snapshot.version != SNAPSHOT_VERSION {
            let backup =
                self.quarantine_corrupted(&format!("unsupported version {}", snapshot.version))?;
            tracing::warn!(
                version = snapshot.version,
                backup = %backup.display(),
                "Unsupported snapshot version moved aside, starting empty"
            );
            return Ok(0);
        }

        let count = snapshot.records.len();
        self.store.restore(snapshot.records);
        *self.saved_marker.lock() = snapshot.last_received;
        tracing::info!(
            records = count,
            saved_at = %snapshot.saved_at,
            "Restored snapshot"
        );
        Ok(count)
    }

    /// Write the current store contents to disk, atomically.
    ///
    /// Skips the write when nothing was accepted since the last save.
    pub fn flush(&self) -> Result<FlushOutcome, PersistError> {
        let marker = self.store.last_received();
        if marker == *self.saved_marker.lock() {
            return Ok(FlushOutcome::Unchanged);
        }

        let records: Vec<MetricRecord> = self
            .store
            .snapshot()
            .into_iter()
            .flat_map(|(_, recs)| recs)
            .collect();
        let count = records.len();
        let snapshot = SnapshotFile {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            last_received: marker,
            records,
        };
        let body = serde_json::to_vec(&snapshot)?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| self.map_io(e))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &body).map_err(|e| self.map_io(e))?;
        fs::rename(&tmp, &self.path).map_err(|e| self.map_io(e))?;

        *self.saved_marker.lock() = marker;
        tracing::debug!(records = count, path = %self.path.display(), "Snapshot saved");
        Ok(FlushOutcome::Saved { records: count })
    }

    /// Periodic flush until shutdown, then one final flush so nothing newer
    /// than the last tick is lost.
    pub async fn flush_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.blocking_flush().await;
                }
            }
        }
        self.blocking_flush().await;
        tracing::debug!("Persistence loop stopped");
    }

    async fn blocking_flush(self: &Arc<Self>) {
        let mgr = Arc::clone(self);
        let result = tokio::task::spawn_blocking(move || mgr.flush()).await;
        match result {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "Snapshot flush failed"),
            Err(e) => tracing::error!(error = %e, "Snapshot flush task panicked"),
        }
    }

    fn quarantine_corrupted(&self, reason: &str) -> Result<PathBuf, PersistError> {
        let stamp = Utc::now().format("%Y%m%d%H%M%S");
        let backup = self
            .path
            .with_extension(format!("json.corrupt-{stamp}"));
        tracing::error!(path = %self.path.display(), reason, "Snapshot unreadable");
        fs::rename(&self.path, &backup)?;
        Ok(backup)
    }

    fn map_io(&self, e: io::Error) -> PersistError {
        let full = matches!(
            e.kind(),
            io::ErrorKind::StorageFull | io::ErrorKind::QuotaExceeded
        ) || e.raw_os_error() == Some(28);
        if full {
            PersistError::StorageExhausted {
                path: self.path.clone(),
            }
        } else {
            PersistError::Io(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live::LiveHub;
    use crate::store::MetricCategory;
    use tempfile::tempdir;

    fn store() -> Arc<MetricStore> {
        Arc::new(MetricStore::new(100, 14, Arc::new(LiveHub::new(16))))
    }

    fn manager(dir: &Path, store: Arc<MetricStore>) -> PersistenceManager {
        PersistenceManager::new(dir.join("metrics.json"), store, Duration::from_secs(60))
    }

    fn sample(value: f64) -> MetricRecord {
        MetricRecord::new(MetricCategory::Cost, Utc::now(), value).with_attr("model", "opus")
    }

    #[test]
    fn test_flush_then_load_roundtrip() {
        let dir = tempdir().unwrap();
        let source = store();
        source.append(sample(1.0)).unwrap();
        source.append(sample(2.5)).unwrap();
        let saver = manager(dir.path(), Arc::clone(&source));
        assert_eq!(saver.flush().unwrap(), FlushOutcome::Saved { records: 2 });

        let target = store();
        let loader = manager(dir.path(), Arc::clone(&target));
        assert_eq!(loader.load().unwrap(), 2);
        assert_eq!(
            target.tail(MetricCategory::Cost, 10),
            source.tail(MetricCategory::Cost, 10)
        );
    }

    #[test]
    fn test_missing_snapshot_starts_empty() {
        let dir = tempdir().unwrap();
        let target = store();
        let loader = manager(dir.path(), Arc::clone(&target));
        assert_eq!(loader.load().unwrap(), 0);
        assert!(target.is_empty());
    }

    #[test]
    fn test_corrupted_snapshot_is_backed_up() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        fs::write(&path, "{not json at all").unwrap();

        let target = store();
        let loader = manager(dir.path(), Arc::clone(&target));
        assert_eq!(loader.load().unwrap(), 0);
        assert!(target.is_empty());
        assert!(!path.exists());

        let backups: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.file_name()
                    .to_string_lossy()
                    .starts_with("metrics.json.corrupt-")
            })
            .collect();
        assert_eq!(backups.len(), 1);
        assert_eq!(
            fs::read_to_string(backups[0].path()).unwrap(),
            "{not json at all"
        );
    }

    #[test]
    fn test_unsupported_version_is_backed_up() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        fs::write(
            &path,
            r#"{"version": 999, "saved_at": "2026-01-01T00:00:00Z", "records": []}"#,
        )
        .unwrap();
        let loader = manager(dir.path(), store());
        assert_eq!(loader.load().unwrap(), 0);
        assert!(!path.exists());
    }

    #[test]
    fn test_flush_skips_when_unchanged() {
        let dir = tempdir().unwrap();
        let source = store();
        source.append(sample(1.0)).unwrap();
        let saver = manager(dir.path(), Arc::clone(&source));
        assert!(matches!(saver.flush().unwrap(), FlushOutcome::Saved { .. }));
        assert_eq!(saver.flush().unwrap(), FlushOutcome::Unchanged);
        source.append(sample(2.0)).unwrap();
        assert!(matches!(saver.flush().unwrap(), FlushOutcome::Saved { .. }));
    }

    #[test]
    fn test_no_tmp_file_left_behind() {
        let dir = tempdir().unwrap();
        let source = store();
        source.append(sample(1.0)).unwrap();
        let saver = manager(dir.path(), source);
        saver.flush().unwrap();
        assert!(!dir.path().join("metrics.json.tmp").exists());
        assert!(dir.path().join("metrics.json").exists());
    }
}
