use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable identity of a file on disk: `path|size|mtime_secs`.
///
/// Re-creating or rewriting a file changes its identity, so a replaced file is
/// tracked under the identity it has after replacement.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(String);

impl FileId {
    pub fn new(path: &Path, size: u64, modified: SystemTime) -> Self {
        let mtime = modified
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        FileId(format!("{}|{}|{}", path.display(), size, mtime))
    }

    /// Identity of the file currently at `path`
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let meta = std::fs::metadata(path)?;
        Ok(Self::new(path, meta.len(), meta.modified()?))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome of handling one file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobStatus {
    /// Encoded, smaller, original replaced
    Success,
    /// Encoded output was not smaller; original kept
    SkippedNoImprovement,
    /// Outside the configured size range
    SkippedSize,
    /// Name matched a skip pattern
    SkippedPattern,
    Failed,
    /// Interrupted by shutdown before completion
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Success => "success",
            JobStatus::SkippedNoImprovement => "skipped-no-improvement",
            JobStatus::SkippedSize => "skipped-size",
            JobStatus::SkippedPattern => "skipped-pattern",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Whether a record with this status is written to the tracking store
    pub fn is_tracked(&self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::SkippedNoImprovement | JobStatus::Failed
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a single file through the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Discovered,
    Skipped,
    Submitted,
    Polling,
    Downloaded,
    Validated,
    Replaced,
    Discarded,
    Recorded,
}

impl JobState {
    /// Whether `next` is a legal successor of `self`.
    ///
    /// Any non-terminal state may jump straight to `Recorded` on failure.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (Skipped, _) | (Recorded, _) => false,
            (_, Recorded) => true,
            (Discovered, Skipped) | (Discovered, Submitted) => true,
            (Submitted, Polling) => true,
            (Polling, Downloaded) => true,
            (Downloaded, Validated) => true,
            (Validated, Replaced) | (Validated, Discarded) => true,
            _ => false,
        }
    }
}

/// Persisted outcome of one transcode attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingRecord {
    pub path: PathBuf,
    pub status: JobStatus,
    pub original_size: u64,
    /// Size of the downloaded output (0 when nothing was downloaded)
    pub encoded_size: u64,
    pub timestamp: DateTime<Utc>,
    pub duration_seconds: f64,
    /// Remote job id or asset public id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
    /// Identity of the file before processing, when it differs from the key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_id: Option<FileId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ProcessingRecord {
    pub fn new(path: &Path, status: JobStatus, original_size: u64) -> Self {
        Self {
            path: path.to_path_buf(),
            status,
            original_size,
            encoded_size: 0,
            timestamp: Utc::now(),
            duration_seconds: 0.0,
            remote_id: None,
            original_id: None,
            reason: None,
        }
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }

    /// Signed size change in percent, if anything was encoded
    pub fn size_change_percent(&self) -> Option<f64> {
        if self.original_size == 0 || self.encoded_size == 0 {
            return None;
        }
        Some((self.encoded_size as f64 - self.original_size as f64) / self.original_size as f64 * 100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn file_id_changes_with_size_and_mtime() {
        let path = Path::new("/videos/2025/06/01/a.mp4");
        let t = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let a = FileId::new(path, 100, t);
        assert_eq!(a.as_str(), "/videos/2025/06/01/a.mp4|100|1700000000");
        assert_ne!(a, FileId::new(path, 101, t));
        assert_ne!(a, FileId::new(path, 100, t + Duration::from_secs(1)));
    }

    #[test]
    fn status_serializes_as_report_string() {
        for status in [
            JobStatus::Success,
            JobStatus::SkippedNoImprovement,
            JobStatus::SkippedSize,
            JobStatus::Failed,
        ] {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
        }
    }

    #[test]
    fn happy_path_transitions_are_legal() {
        use JobState::*;
        let path = [Discovered, Submitted, Polling, Downloaded, Validated, Replaced, Recorded];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{:?} -> {:?}", pair[0], pair[1]);
        }
        assert!(Validated.can_transition_to(Discarded));
        assert!(Polling.can_transition_to(Recorded));
        assert!(!Discovered.can_transition_to(Replaced));
        assert!(!Recorded.can_transition_to(Submitted));
    }

    #[test]
    fn size_change_percent() {
        let mut record = ProcessingRecord::new(Path::new("a.mp4"), JobStatus::Success, 50);
        assert_eq!(record.size_change_percent(), None);
        record.encoded_size = 30;
        assert_eq!(record.size_change_percent(), Some(-40.0));
    }
}
