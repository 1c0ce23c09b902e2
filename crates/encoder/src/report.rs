use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use humansize::{format_size, BINARY};

use crate::job::ProcessingRecord;

pub const CSV_HEADER: [&str; 6] = [
    "filename",
    "original_size",
    "encoded_size",
    "status",
    "duration_seconds",
    "timestamp",
];

/// Appends one text line and one CSV row per outcome.
///
/// Both files are opened in append mode and flushed after every record, so an
/// interrupted run leaves a valid prefix.
pub struct ReportWriter {
    log_path: PathBuf,
    csv_path: PathBuf,
    log: File,
    csv: csv::Writer<File>,
}

impl ReportWriter {
    pub fn open(log_path: &Path, csv_path: &Path) -> io::Result<Self> {
        let log = open_append(log_path)?;
        let csv_file = open_append(csv_path)?;
        let needs_header = csv_file.metadata()?.len() == 0;

        let mut csv = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(csv_file);
        if needs_header {
            csv.write_record(CSV_HEADER)?;
            csv.flush()?;
        }

        Ok(Self {
            log_path: log_path.to_path_buf(),
            csv_path: csv_path.to_path_buf(),
            log,
            csv,
        })
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn csv_path(&self) -> &Path {
        &self.csv_path
    }

    pub fn emit(&mut self, record: &ProcessingRecord) -> io::Result<()> {
        writeln!(self.log, "{}", format_log_line(record))?;
        self.log.flush()?;

        self.csv.write_record([
            record.file_name(),
            record.original_size.to_string(),
            record.encoded_size.to_string(),
            record.status.to_string(),
            format!("{:.2}", record.duration_seconds),
            record.timestamp.to_rfc3339(),
        ])?;
        self.csv.flush()?;
        Ok(())
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Human-readable log line for a record
pub fn format_log_line(record: &ProcessingRecord) -> String {
    let mut line = format!(
        "{} {} {} {}",
        record.timestamp.format("%Y-%m-%d %H:%M:%S"),
        record.status,
        record.path.display(),
        format_size(record.original_size, BINARY),
    );
    if record.encoded_size > 0 {
        line.push_str(&format!(" -> {}", format_size(record.encoded_size, BINARY)));
    }
    if let Some(pct) = record.size_change_percent() {
        line.push_str(&format!(" ({:+.1}%)", pct));
    }
    if record.duration_seconds > 0.0 {
        line.push_str(&format!(" in {:.2}s", record.duration_seconds));
    }
    if let Some(reason) = &record.reason {
        line.push_str(&format!(": {}", reason));
    }
    line
}
