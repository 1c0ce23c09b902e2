//! Drives a run: scan, fan out candidates to the remote backend, validate
//! outputs, replace originals and record every outcome.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use humansize::{format_size, BINARY};
use log::{debug, error, info, warn};
use tokio::sync::{watch, Mutex};

use crate::config::EncoderConfig;
use crate::error::{FilesystemError, ProcessError, RemoteTranscodeError};
use crate::job::{FileId, JobState, JobStatus, ProcessingRecord};
use crate::remote::{EncodedOutput, RemoteTranscoder, TranscodeDriver};
use crate::report::ReportWriter;
use crate::scan::{CandidateFile, DateSelection, ScanEntry, Scanner};
use crate::settings::TranscodeSettings;
use crate::sidecar::{backup_path, staged_path};
use crate::tracking::TrackingStore;

/// Per-run switches from the command line
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Ignore the tracking store
    pub force: bool,
    /// Scan and log only
    pub dry_run: bool,
}

/// Counters for the end-of-run summary
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStats {
    pub candidates: usize,
    pub already_processed: usize,
    pub skipped_size: usize,
    pub skipped_pattern: usize,
    pub would_submit: usize,
    pub submitted: usize,
    pub succeeded: usize,
    pub no_improvement: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub not_started: usize,
    pub bytes_before: u64,
    pub bytes_after: u64,
}

impl RunStats {
    pub fn bytes_saved(&self) -> u64 {
        self.bytes_before.saturating_sub(self.bytes_after)
    }

    pub fn summary(&self) -> String {
        let mut s = format!(
            "{} candidate(s): {} replaced, {} not smaller, {} failed, {} cancelled, {} already processed; skipped {} by size, {} by name",
            self.candidates,
            self.succeeded,
            self.no_improvement,
            self.failed,
            self.cancelled,
            self.already_processed,
            self.skipped_size,
            self.skipped_pattern,
        );
        if self.would_submit > 0 {
            s.push_str(&format!("; {} would be submitted", self.would_submit));
        }
        if self.not_started > 0 {
            s.push_str(&format!("; {} not started", self.not_started));
        }
        if self.succeeded > 0 {
            s.push_str(&format!(
                "; saved {} ({} -> {})",
                format_size(self.bytes_saved(), BINARY),
                format_size(self.bytes_before, BINARY),
                format_size(self.bytes_after, BINARY)
            ));
        }
        s
    }

    fn add(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Skipped(JobStatus::SkippedSize) => self.skipped_size += 1,
            Outcome::Skipped(_) => self.skipped_pattern += 1,
            Outcome::AlreadyProcessed => {
                self.candidates += 1;
                self.already_processed += 1;
            }
            Outcome::WouldSubmit => {
                self.candidates += 1;
                self.would_submit += 1;
            }
            Outcome::NotStarted => {
                self.candidates += 1;
                self.not_started += 1;
            }
            Outcome::Processed(record) => {
                self.candidates += 1;
                self.submitted += 1;
                match record.status {
                    JobStatus::Success => {
                        self.succeeded += 1;
                        self.bytes_before += record.original_size;
                        self.bytes_after += record.encoded_size;
                    }
                    JobStatus::SkippedNoImprovement => self.no_improvement += 1,
                    JobStatus::Cancelled => self.cancelled += 1,
                    _ => self.failed += 1,
                }
            }
        }
    }
}

#[derive(Debug)]
enum Outcome {
    Skipped(JobStatus),
    AlreadyProcessed,
    WouldSubmit,
    NotStarted,
    Processed(ProcessingRecord),
}

enum Applied {
    /// Swapped in; the post-replace identity when it could be read
    Replaced(Option<FileId>),
    Discarded,
}

pub struct Orchestrator {
    cfg: Arc<EncoderConfig>,
    scanner: Scanner,
    driver: TranscodeDriver,
    settings: TranscodeSettings,
    store: Arc<Mutex<TrackingStore>>,
    report: Mutex<ReportWriter>,
}

impl Orchestrator {
    pub fn new(
        cfg: Arc<EncoderConfig>,
        transcoder: Arc<dyn RemoteTranscoder>,
        store: TrackingStore,
        report: ReportWriter,
    ) -> Self {
        Self {
            scanner: Scanner::new(&cfg),
            driver: TranscodeDriver::new(transcoder, &cfg),
            settings: cfg.transcode_settings(),
            store: Arc::new(Mutex::new(store)),
            report: Mutex::new(report),
            cfg,
        }
    }

    /// Process every file in `selection`, at most `max_concurrent_jobs` at a time.
    ///
    /// Per-file failures are recorded and reported, never returned.
    pub async fn run(
        &self,
        selection: DateSelection,
        opts: RunOptions,
        shutdown: watch::Receiver<bool>,
    ) -> Result<RunStats> {
        info!(
            "Starting run over {} with {} (concurrency {}{}{})",
            selection,
            self.driver.transcoder().name(),
            self.cfg.max_concurrent_jobs,
            if opts.force { ", force" } else { "" },
            if opts.dry_run { ", dry run" } else { "" },
        );

        let scanner = self.scanner.clone();
        let entries = tokio::task::spawn_blocking(move || scanner.scan(&selection).collect::<Vec<_>>())
            .await
            .context("Scanner task failed")?;
        debug!("Scan produced {} entries", entries.len());

        let mut stats = RunStats::default();
        let mut outcomes = stream::iter(entries)
            .map(|entry| self.process_entry(entry, opts, shutdown.clone()))
            .buffer_unordered(self.cfg.max_concurrent_jobs.max(1));
        while let Some(outcome) = outcomes.next().await {
            stats.add(&outcome);
        }

        info!("Run finished: {}", stats.summary());
        Ok(stats)
    }

    async fn process_entry(&self, entry: ScanEntry, opts: RunOptions, shutdown: watch::Receiver<bool>) -> Outcome {
        match entry {
            ScanEntry::Skipped { path, size, reason } => {
                info!("Skipping {}: {}", path.display(), reason);
                let status = reason.status();
                if !opts.dry_run {
                    let mut record = ProcessingRecord::new(&path, status, size);
                    record.reason = Some(reason.to_string());
                    self.emit(&record).await;
                }
                Outcome::Skipped(status)
            }
            ScanEntry::Candidate(candidate) => self.process_candidate(candidate, opts, shutdown).await,
        }
    }

    async fn process_candidate(
        &self,
        candidate: CandidateFile,
        opts: RunOptions,
        shutdown: watch::Receiver<bool>,
    ) -> Outcome {
        let id = candidate.file_id();
        if !opts.force && self.store.lock().await.is_processed(&id) {
            debug!("Already processed: {}", candidate.path.display());
            return Outcome::AlreadyProcessed;
        }
        if opts.dry_run {
            info!(
                "Would submit {} ({})",
                candidate.path.display(),
                format_size(candidate.size, BINARY)
            );
            return Outcome::WouldSubmit;
        }
        if *shutdown.borrow() {
            return Outcome::NotStarted;
        }

        let started = Instant::now();
        info!(
            "🎬 Encoding {} ({})",
            candidate.path.display(),
            format_size(candidate.size, BINARY)
        );

        let mut record = ProcessingRecord::new(&candidate.path, JobStatus::Failed, candidate.size);
        let key = match self.driver.encode(&candidate.path, &self.settings, shutdown).await {
            Ok(output) => {
                record.remote_id = Some(output.remote_id.clone());
                record.encoded_size = output.size;
                let applied = self.apply_in_background(&candidate, output).await;
                settle(&mut record, id, applied)
            }
            Err(failure) => {
                record.remote_id = failure.remote_id.clone();
                record.reason = Some(failure.source.to_string());
                if failure.source == RemoteTranscodeError::Cancelled {
                    record.status = JobStatus::Cancelled;
                    warn!("Cancelled {}", candidate.path.display());
                } else {
                    error!("❌ {}: {}", candidate.path.display(), failure);
                }
                id
            }
        };

        record.duration_seconds = started.elapsed().as_secs_f64();
        record.timestamp = Utc::now();

        if record.status.is_tracked() {
            // The store is rewritten and fsynced on every record; keep that off the executor
            let store = Arc::clone(&self.store);
            let tracked = record.clone();
            let saved = tokio::task::spawn_blocking(move || store.blocking_lock().record(key, tracked)).await;
            match saved {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Failed to persist record for {}: {}", candidate.path.display(), e),
                Err(e) => error!("Store task for {} failed: {}", candidate.path.display(), e),
            }
        }
        self.emit(&record).await;
        Outcome::Processed(record)
    }

    /// Run [`apply_output`] on the blocking pool, then drop the download
    async fn apply_in_background(
        &self,
        candidate: &CandidateFile,
        output: EncodedOutput,
    ) -> Result<Applied, ProcessError> {
        let candidate = candidate.clone();
        let keep_backups = self.cfg.keep_backups;
        tokio::task::spawn_blocking(move || {
            let applied = apply_output(&candidate, &output, keep_backups);
            if let Err(e) = fs::remove_file(&output.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove download {}: {}", output.path.display(), e);
                }
            }
            applied
        })
        .await
        .map_err(|e| ProcessError::Task(e.to_string()))?
    }

    async fn emit(&self, record: &ProcessingRecord) {
        if let Err(e) = self.report.lock().await.emit(record) {
            error!("Failed to write report for {}: {}", record.path.display(), e);
        }
    }
}

/// Validate the download and swap it in if it is strictly smaller
fn apply_output(candidate: &CandidateFile, output: &EncodedOutput, keep_backups: bool) -> Result<Applied, ProcessError> {
    let mut state = JobState::Downloaded;
    if output.size == 0 {
        return Err(ProcessError::EmptyOutput(output.path.clone()));
    }
    advance(&mut state, JobState::Validated, &candidate.path);

    if output.size >= candidate.size {
        info!(
            "No improvement for {}: {} -> {}, keeping original",
            candidate.path.display(),
            format_size(candidate.size, BINARY),
            format_size(output.size, BINARY)
        );
        advance(&mut state, JobState::Discarded, &candidate.path);
        return Ok(Applied::Discarded);
    }

    replace_original(&candidate.path, &output.path, output.size, keep_backups)?;
    advance(&mut state, JobState::Replaced, &candidate.path);

    // Already swapped in; an unreadable identity is still a success
    match FileId::from_path(&candidate.path) {
        Ok(new_id) => Ok(Applied::Replaced(Some(new_id))),
        Err(e) => {
            error!("Failed to stat replaced file {}: {}", candidate.path.display(), e);
            Ok(Applied::Replaced(None))
        }
    }
}

/// Set the record's status from the replace step and pick its tracking key
fn settle(record: &mut ProcessingRecord, id: FileId, applied: Result<Applied, ProcessError>) -> FileId {
    match applied {
        Ok(Applied::Replaced(new_id)) => {
            record.status = JobStatus::Success;
            info!("✅ Replaced {}", record.path.display());
            match new_id {
                Some(new_id) => {
                    record.original_id = Some(id);
                    new_id
                }
                None => id,
            }
        }
        Ok(Applied::Discarded) => {
            record.status = JobStatus::SkippedNoImprovement;
            id
        }
        Err(e) => {
            error!("❌ {}: {}", record.path.display(), e);
            record.reason = Some(e.to_string());
            id
        }
    }
}

fn advance(state: &mut JobState, next: JobState, path: &Path) {
    debug_assert!(state.can_transition_to(next), "{:?} -> {:?}", state, next);
    debug!("{}: {:?} -> {:?}", path.display(), state, next);
    *state = next;
}

/// Swap `download` in for `original`, keeping `<original>.backup`.
///
/// The original is only renamed once the staged copy is fsynced next to it,
/// and is restored from the backup if the swap or the size check fails.
pub fn replace_original(
    original: &Path,
    download: &Path,
    expected_size: u64,
    keep_backup: bool,
) -> Result<(), FilesystemError> {
    let backup = backup_path(original);
    let staged = staged_path(original);

    if backup.exists() {
        return Err(FilesystemError::BackupExists(backup));
    }

    let stage = || -> std::io::Result<()> {
        fs::copy(download, &staged)?;
        fs::File::open(&staged)?.sync_all()
    };
    if let Err(source) = stage() {
        fs::remove_file(&staged).ok();
        return Err(FilesystemError::Stage {
            from: download.to_path_buf(),
            to: staged,
            source,
        });
    }

    if let Err(source) = fs::rename(original, &backup) {
        fs::remove_file(&staged).ok();
        return Err(FilesystemError::Backup {
            from: original.to_path_buf(),
            to: backup,
            source,
        });
    }

    if let Err(source) = fs::rename(&staged, original) {
        restore(&backup, original);
        fs::remove_file(&staged).ok();
        return Err(FilesystemError::Replace {
            path: original.to_path_buf(),
            source,
        });
    }

    let actual = fs::metadata(original).map(|m| m.len()).unwrap_or(0);
    if actual != expected_size {
        restore(&backup, original);
        return Err(FilesystemError::Verify {
            path: original.to_path_buf(),
            expected: expected_size,
            actual,
        });
    }

    if !keep_backup {
        if let Err(e) = fs::remove_file(&backup) {
            warn!("Failed to remove backup {}: {}", backup.display(), e);
        }
    }
    Ok(())
}

fn restore(backup: &Path, original: &Path) {
    match fs::rename(backup, original) {
        Ok(()) => info!("🔄 Restored original from backup: {}", original.display()),
        Err(e) => error!(
            "Failed to restore {} from {}: {}",
            original.display(),
            backup.display(),
            e
        ),
    }
}
