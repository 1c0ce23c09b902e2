use std::fmt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{Datelike, Local, NaiveDate};
use log::{debug, info, warn};
use walkdir::{DirEntry, WalkDir};

use crate::config::EncoderConfig;
use crate::error::ConfigError;
use crate::job::{FileId, JobStatus};

/// Which date folders to visit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DateSelection {
    /// Every `YYYY/MM/DD` folder under the root
    All,
    Day(NaiveDate),
    /// Inclusive range
    Range { start: NaiveDate, end: NaiveDate },
}

impl DateSelection {
    pub fn today() -> Self {
        DateSelection::Day(Local::now().date_naive())
    }

    pub fn range(start: NaiveDate, end: NaiveDate) -> Result<Self, ConfigError> {
        if start > end {
            return Err(ConfigError::validation(format!(
                "date range start {} is after end {}",
                start, end
            )));
        }
        Ok(DateSelection::Range { start, end })
    }
}

impl fmt::Display for DateSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DateSelection::All => f.write_str("all dates"),
            DateSelection::Day(d) => write!(f, "{}", d),
            DateSelection::Range { start, end } => write!(f, "{}..={}", start, end),
        }
    }
}

/// A video file eligible for transcoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateFile {
    pub path: PathBuf,
    pub size: u64,
    pub modified: SystemTime,
    /// Date taken from the `YYYY/MM/DD` folder
    pub date: NaiveDate,
}

impl CandidateFile {
    pub fn file_id(&self) -> FileId {
        FileId::new(&self.path, self.size, self.modified)
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Why a video file was not offered as a candidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Size outside `[min, max]`
    Size { min: u64, max: u64 },
    /// Name contains the given skip pattern
    Pattern(String),
}

impl SkipReason {
    pub fn status(&self) -> JobStatus {
        match self {
            SkipReason::Size { .. } => JobStatus::SkippedSize,
            SkipReason::Pattern(_) => JobStatus::SkippedPattern,
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Size { min, max } => write!(f, "size outside [{}, {}] bytes", min, max),
            SkipReason::Pattern(p) => write!(f, "name contains '{}'", p),
        }
    }
}

/// Result of scanning a file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEntry {
    Candidate(CandidateFile),
    Skipped {
        path: PathBuf,
        size: u64,
        reason: SkipReason,
    },
}

/// Walks the date-partitioned videos tree
#[derive(Debug, Clone)]
pub struct Scanner {
    root: PathBuf,
    extensions: Vec<String>,
    min_bytes: u64,
    max_bytes: u64,
    skip_patterns: Vec<String>,
}

impl Scanner {
    pub fn new(cfg: &EncoderConfig) -> Self {
        Self {
            root: cfg.videos_root.clone(),
            extensions: cfg
                .video_extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_lowercase())
                .collect(),
            min_bytes: cfg.min_bytes,
            max_bytes: cfg.max_bytes,
            skip_patterns: cfg.skip_patterns.iter().map(|p| p.to_lowercase()).collect(),
        }
    }

    /// Lazily iterate the selected folders.
    ///
    /// Day folders are resolved up front; files are listed one folder at a time.
    /// Order is year, month, day, then file name. Each call starts over.
    pub fn scan(&self, selection: &DateSelection) -> ScanIter<'_> {
        let days = match selection {
            DateSelection::All => self.all_day_dirs(),
            DateSelection::Day(date) => self.explicit_day_dirs(std::iter::once(*date)),
            DateSelection::Range { start, end } => {
                let end = *end;
                self.explicit_day_dirs(start.iter_days().take_while(move |d| *d <= end))
            }
        };
        info!("Scanning {} date folder(s) under {}", days.len(), self.root.display());

        ScanIter {
            scanner: self,
            days: days.into_iter(),
            current: None,
        }
    }

    fn day_dir(&self, date: NaiveDate) -> PathBuf {
        self.root
            .join(format!("{:04}", date.year()))
            .join(format!("{:02}", date.month()))
            .join(format!("{:02}", date.day()))
    }

    fn explicit_day_dirs(&self, dates: impl Iterator<Item = NaiveDate>) -> Vec<(NaiveDate, PathBuf)> {
        dates
            .filter_map(|date| {
                let dir = self.day_dir(date);
                if dir.is_dir() {
                    Some((date, dir))
                } else {
                    warn!("Folder does not exist: {}", dir.display());
                    None
                }
            })
            .collect()
    }

    fn all_day_dirs(&self) -> Vec<(NaiveDate, PathBuf)> {
        // No min_depth: walkdir only filters entries it yields, and the year and
        // month levels must be pruned too
        let walker = WalkDir::new(&self.root)
            .follow_links(false)
            .max_depth(3)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(is_date_component);

        let mut days = Vec::new();
        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("Error reading directory entry: {}", e);
                    continue;
                }
            };
            if entry.depth() != 3 || !entry.file_type().is_dir() {
                continue;
            }
            match date_from_day_dir(entry.path()) {
                Some(date) => days.push((date, entry.path().to_path_buf())),
                None => debug!("Ignoring non-date folder: {}", entry.path().display()),
            }
        }
        days
    }

    fn list_day(&self, dir: &Path) -> Vec<PathBuf> {
        let mut files = Vec::new();
        for entry in WalkDir::new(dir)
            .follow_links(false)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
        {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("Error reading directory entry: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let is_video = path
                .extension()
                .and_then(|s| s.to_str())
                .map(|ext| self.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
                .unwrap_or(false);
            if is_video {
                files.push(path.to_path_buf());
            }
        }
        files
    }

    fn classify(&self, path: PathBuf, date: NaiveDate) -> Option<ScanEntry> {
        let metadata = match std::fs::metadata(&path) {
            Ok(m) => m,
            Err(e) => {
                warn!("Failed to stat {}: {}", path.display(), e);
                return None;
            }
        };
        let size = metadata.len();

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if let Some(pattern) = self.skip_patterns.iter().find(|p| name.contains(p.as_str())) {
            debug!("Skipping pre-optimized file: {}", path.display());
            return Some(ScanEntry::Skipped {
                path,
                size,
                reason: SkipReason::Pattern(pattern.clone()),
            });
        }

        if size < self.min_bytes || size > self.max_bytes {
            debug!("Skipping {} ({} bytes): outside size range", path.display(), size);
            return Some(ScanEntry::Skipped {
                path,
                size,
                reason: SkipReason::Size {
                    min: self.min_bytes,
                    max: self.max_bytes,
                },
            });
        }

        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        debug!("Found candidate: {} ({} bytes)", path.display(), size);
        Some(ScanEntry::Candidate(CandidateFile {
            path,
            size,
            modified,
            date,
        }))
    }
}

/// Iterator returned by [`Scanner::scan`]
pub struct ScanIter<'a> {
    scanner: &'a Scanner,
    days: std::vec::IntoIter<(NaiveDate, PathBuf)>,
    current: Option<(NaiveDate, std::vec::IntoIter<PathBuf>)>,
}

impl Iterator for ScanIter<'_> {
    type Item = ScanEntry;

    fn next(&mut self) -> Option<ScanEntry> {
        loop {
            if let Some((date, files)) = self.current.as_mut() {
                let date = *date;
                for path in files.by_ref() {
                    if let Some(entry) = self.scanner.classify(path, date) {
                        return Some(entry);
                    }
                }
            }

            let (date, dir) = self.days.next()?;
            let files = self.scanner.list_day(&dir);
            debug!("Found {} video file(s) in {}", files.len(), dir.display());
            self.current = Some((date, files.into_iter()));
        }
    }
}

/// Accept only `YYYY`, `MM` and `DD` directory names at depths 1, 2 and 3
fn is_date_component(entry: &DirEntry) -> bool {
    let expected_len = match entry.depth() {
        0 => return true,
        1 => 4,
        2 | 3 => 2,
        _ => return false,
    };
    let name = entry.file_name().to_string_lossy();
    entry.file_type().is_dir() && name.len() == expected_len && name.chars().all(|c| c.is_ascii_digit())
}

fn date_from_day_dir(dir: &Path) -> Option<NaiveDate> {
    let day = date_component(dir, 2)?;
    let month_dir = dir.parent()?;
    let month = date_component(month_dir, 2)?;
    let year = date_component(month_dir.parent()?, 4)?;
    NaiveDate::from_ymd_opt(year as i32, month, day)
}

/// Parse a fixed-width, all-digit folder name
fn date_component(dir: &Path, width: usize) -> Option<u32> {
    let name = dir.file_name()?.to_str()?;
    if name.len() != width || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    name.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::fs;

    const MB: u64 = 1024 * 1024;

    /// Create a sparse file of `size` bytes
    fn touch(root: &Path, rel: &str, size: u64) -> PathBuf {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let file = fs::File::create(&path).unwrap();
        file.set_len(size).unwrap();
        path
    }

    fn scanner_for(root: &Path) -> Scanner {
        Scanner::new(&EncoderConfig {
            videos_root: root.to_path_buf(),
            ..EncoderConfig::default_config()
        })
    }

    fn names(entries: &[ScanEntry]) -> Vec<String> {
        entries
            .iter()
            .map(|e| match e {
                ScanEntry::Candidate(c) => c.file_name(),
                ScanEntry::Skipped { path, .. } => {
                    format!("skip:{}", path.file_name().unwrap().to_string_lossy())
                }
            })
            .collect()
    }

    #[test]
    fn small_file_is_skipped_not_dispatched() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "2025/06/01/a.mp4", 50 * MB);
        touch(dir.path(), "2025/06/01/b.mp4", 5 * MB);

        let entries: Vec<_> = scanner_for(dir.path()).scan(&DateSelection::All).collect();
        assert_eq!(names(&entries), vec!["a.mp4", "skip:b.mp4"]);
        match &entries[1] {
            ScanEntry::Skipped { reason, size, .. } => {
                assert_eq!(reason.status(), JobStatus::SkippedSize);
                assert_eq!(*size, 5 * MB);
            }
            other => panic!("unexpected entry {:?}", other),
        }
        match &entries[0] {
            ScanEntry::Candidate(c) => {
                assert_eq!(c.date, NaiveDate::from_ymd_opt(2025, 6, 1).unwrap());
                assert_eq!(c.size, 50 * MB);
            }
            other => panic!("unexpected entry {:?}", other),
        }
    }

    #[test]
    fn traversal_is_ordered_and_ignores_non_date_folders() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "2025/06/02/a.mp4", 20 * MB);
        touch(dir.path(), "2025/06/01/z.mp4", 20 * MB);
        touch(dir.path(), "2025/06/01/b.MP4", 20 * MB);
        touch(dir.path(), "2024/12/31/c.mp4", 20 * MB);
        touch(dir.path(), "2025/06/01/notes.txt", 20 * MB);
        touch(dir.path(), "2025/06/01/a.mp4.backup", 20 * MB);
        touch(dir.path(), "2025/02/30/bad-date.mp4", 20 * MB);
        touch(dir.path(), "misc/06/01/x.mp4", 20 * MB);
        touch(dir.path(), "2025/6/01/short-month.mp4", 20 * MB);
        touch(dir.path(), "loose.mp4", 20 * MB);

        let entries: Vec<_> = scanner_for(dir.path()).scan(&DateSelection::All).collect();
        assert_eq!(names(&entries), vec!["c.mp4", "b.MP4", "z.mp4", "a.mp4"]);
    }

    #[test]
    fn day_folders_need_fixed_width_components() {
        let d = |p: &str| date_from_day_dir(Path::new(p));
        assert_eq!(d("/v/2025/06/01"), NaiveDate::from_ymd_opt(2025, 6, 1));
        assert_eq!(d("/v/2025/6/01"), None);
        assert_eq!(d("/v/2025/06/1"), None);
        assert_eq!(d("/v/25/06/01"), None);
        assert_eq!(d("/v/2025/+6/01"), None);
        assert_eq!(d("/v/2025/02/30"), None);
    }

    #[test]
    fn skip_patterns_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "2025/06/01/holiday_Compressed.mp4", 20 * MB);

        let entries: Vec<_> = scanner_for(dir.path()).scan(&DateSelection::All).collect();
        assert_eq!(
            entries[0],
            ScanEntry::Skipped {
                path: dir.path().join("2025/06/01/holiday_Compressed.mp4"),
                size: 20 * MB,
                reason: SkipReason::Pattern("_compressed".to_string()),
            }
        );
    }

    #[test]
    fn single_day_and_range_selection() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "2025/05/31/a.mp4", 20 * MB);
        touch(dir.path(), "2025/06/01/b.mp4", 20 * MB);
        touch(dir.path(), "2025/06/03/c.mp4", 20 * MB);
        let scanner = scanner_for(dir.path());
        let d = |m, day| NaiveDate::from_ymd_opt(2025, m, day).unwrap();

        let day: Vec<_> = scanner.scan(&DateSelection::Day(d(6, 1))).collect();
        assert_eq!(names(&day), vec!["b.mp4"]);

        let range = DateSelection::range(d(6, 1), d(6, 3)).unwrap();
        let ranged: Vec<_> = scanner.scan(&range).collect();
        assert_eq!(names(&ranged), vec!["b.mp4", "c.mp4"]);

        let missing: Vec<_> = scanner.scan(&DateSelection::Day(d(1, 1))).collect();
        assert!(missing.is_empty());

        assert!(DateSelection::range(d(6, 3), d(6, 1)).is_err());
    }

    #[test]
    fn scan_is_restartable() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "2025/06/01/a.mp4", 20 * MB);
        touch(dir.path(), "2025/06/02/b.mp4", 20 * MB);
        let scanner = scanner_for(dir.path());

        let mut partial = scanner.scan(&DateSelection::All);
        assert!(partial.next().is_some());
        drop(partial);

        assert_eq!(scanner.scan(&DateSelection::All).count(), 2);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn never_yields_candidates_outside_size_bounds(
            sizes in proptest::collection::vec(0u64..4096, 1..12),
            min in 0u64..2048,
            span in 0u64..2048,
        ) {
            let dir = tempfile::tempdir().unwrap();
            for (i, size) in sizes.iter().enumerate() {
                touch(dir.path(), &format!("2025/01/01/f{:02}.mp4", i), *size);
            }
            let max = min + span;
            let scanner = Scanner::new(&EncoderConfig {
                videos_root: dir.path().to_path_buf(),
                min_bytes: min,
                max_bytes: max,
                ..EncoderConfig::default_config()
            });

            let entries: Vec<_> = scanner.scan(&DateSelection::All).collect();
            prop_assert_eq!(entries.len(), sizes.len());
            for entry in entries {
                if let ScanEntry::Candidate(c) = entry {
                    prop_assert!(c.size >= min && c.size <= max);
                }
            }
        }
    }
}
