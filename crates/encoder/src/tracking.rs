use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::error::StoreError;
use crate::job::{FileId, JobStatus, ProcessingRecord};

/// Durable map of processed files, persisted as a single JSON object.
///
/// Loaded once per run and rewritten atomically after every `record`.
#[derive(Debug)]
pub struct TrackingStore {
    path: PathBuf,
    records: BTreeMap<FileId, ProcessingRecord>,
    retry_failed: bool,
}

impl TrackingStore {
    /// Empty store that will persist to `path`
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            records: BTreeMap::new(),
            retry_failed: false,
        }
    }

    /// Load the store; a missing file is an empty store
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No tracking store at {}, starting empty", path.display());
                return Ok(Self::empty(path));
            }
            Err(source) => return Err(StoreError::Read { path, source }),
        };

        if content.trim().is_empty() {
            return Ok(Self::empty(path));
        }

        let records = serde_json::from_str(&content).map_err(|source| StoreError::Corrupt {
            path: path.clone(),
            source,
        })?;

        Ok(Self {
            path,
            records,
            retry_failed: false,
        })
    }

    /// Load the store, starting empty if it is corrupt.
    ///
    /// Losing the store only costs re-encoding time, so corruption is not fatal.
    pub fn load_or_reset(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        match Self::load(&path) {
            Err(e @ StoreError::Corrupt { .. }) => {
                warn!("{}; starting with an empty tracking store", e);
                Ok(Self::empty(path))
            }
            other => other,
        }
    }

    /// Treat failed records as not yet processed
    pub fn with_retry_failed(mut self, retry_failed: bool) -> Self {
        self.retry_failed = retry_failed;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, id: &FileId) -> Option<&ProcessingRecord> {
        self.records.get(id)
    }

    /// True when a previous attempt already settled this file
    pub fn is_processed(&self, id: &FileId) -> bool {
        match self.records.get(id).map(|r| r.status) {
            Some(JobStatus::Success) | Some(JobStatus::SkippedNoImprovement) => true,
            Some(JobStatus::Failed) => !self.retry_failed,
            _ => false,
        }
    }

    /// Insert (or supersede) the record for `id` and persist the store
    pub fn record(&mut self, id: FileId, record: ProcessingRecord) -> Result<(), StoreError> {
        self.records.insert(id, record);
        self.save()
    }

    /// Write to `<path>.tmp`, sync, then rename over the store
    pub fn save(&self) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(&self.records).map_err(StoreError::Serialize)?;

        let tmp_path = tmp_path_for(&self.path);
        let write_err = |source| StoreError::Write {
            path: tmp_path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(write_err)?;
        }

        let mut file = fs::File::create(&tmp_path).map_err(write_err)?;
        file.write_all(json.as_bytes()).map_err(write_err)?;
        file.sync_all().map_err(write_err)?;
        drop(file);

        fs::rename(&tmp_path, &self.path).map_err(|source| StoreError::Write {
            path: self.path.clone(),
            source,
        })?;
        Ok(())
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    fn id(name: &str) -> FileId {
        FileId::new(Path::new(name), 10, UNIX_EPOCH + Duration::from_secs(5))
    }

    #[test]
    fn missing_file_is_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = TrackingStore::load(dir.path().join("encoded.json")).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn records_survive_reload_and_leave_no_tmp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("encoded.json");

        let mut store = TrackingStore::load(&path).unwrap();
        let mut record = ProcessingRecord::new(Path::new("a.mp4"), JobStatus::Success, 50);
        record.encoded_size = 30;
        store.record(id("a.mp4"), record).unwrap();

        assert!(!tmp_path_for(&path).exists());
        let reloaded = TrackingStore::load(&path).unwrap();
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.get(&id("a.mp4")).unwrap().encoded_size, 30);
        assert!(reloaded.is_processed(&id("a.mp4")));
        assert!(!reloaded.is_processed(&id("b.mp4")));
    }

    #[test]
    fn corrupt_store_is_reported_then_reset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("encoded.json");
        fs::write(&path, "{\"truncated\": ").unwrap();

        assert!(matches!(
            TrackingStore::load(&path),
            Err(StoreError::Corrupt { .. })
        ));
        let store = TrackingStore::load_or_reset(&path).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn failed_records_block_resubmission_unless_retry_requested() {
        let mut store = TrackingStore::empty("unused.json");
        store
            .records
            .insert(id("d.mp4"), ProcessingRecord::new(Path::new("d.mp4"), JobStatus::Failed, 10));
        assert!(store.is_processed(&id("d.mp4")));

        let store = store.with_retry_failed(true);
        assert!(!store.is_processed(&id("d.mp4")));
    }

    #[test]
    fn newer_record_supersedes_older_one() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = TrackingStore::empty(dir.path().join("encoded.json"));
        store
            .record(id("a.mp4"), ProcessingRecord::new(Path::new("a.mp4"), JobStatus::Failed, 10))
            .unwrap();
        store
            .record(id("a.mp4"), ProcessingRecord::new(Path::new("a.mp4"), JobStatus::Success, 10))
            .unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&id("a.mp4")).unwrap().status, JobStatus::Success);
    }
}
