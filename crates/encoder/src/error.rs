use std::path::PathBuf;
use thiserror::Error;

/// Fatal configuration problems. These abort the run with a non-zero exit.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing credential: environment variable {name} must be set")]
    MissingCredential { name: &'static str },

    #[error("Videos root does not exist: {0}")]
    RootNotFound(PathBuf),

    #[error("Videos root is not readable '{path}': {source}")]
    RootUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{path}': {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Config validation failed: {message}")]
    Validation { message: String },
}

impl ConfigError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }
}

/// Tracking store failures.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Tracking store '{path}' is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to read tracking store '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write tracking store '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize tracking store: {0}")]
    Serialize(#[source] serde_json::Error),
}

/// Errors raised by a remote transcoding backend.
///
/// `Transient` failures are retried with backoff; `Permanent` ones mark the
/// file failed straight away.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteTranscodeError {
    #[error("transient remote error: {0}")]
    Transient(String),

    #[error("permanent remote error: {0}")]
    Permanent(String),

    #[error("cancelled before completion")]
    Cancelled,
}

impl RemoteTranscodeError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<reqwest::Error> for RemoteTranscodeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
            return Self::Transient(err.to_string());
        }
        match err.status() {
            Some(status) => {
                if crate::remote::status_is_transient(status) {
                    Self::Transient(err.to_string())
                } else {
                    Self::Permanent(err.to_string())
                }
            }
            // Decode errors mean the API answered with something we can't read.
            None if err.is_decode() => Self::Permanent(err.to_string()),
            None => Self::Transient(err.to_string()),
        }
    }
}

/// Local filesystem failures while staging, backing up or replacing a file.
#[derive(Error, Debug)]
pub enum FilesystemError {
    #[error("Failed to stage encoded file '{from}' -> '{to}': {source}")]
    Stage {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Backup already exists: {0}")]
    BackupExists(PathBuf),

    #[error("Failed to back up '{from}' -> '{to}': {source}")]
    Backup {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to replace '{path}': {source}")]
    Replace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Replacement verification failed for '{path}': expected {expected} bytes, found {actual}")]
    Verify {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    #[error("Failed to create directory '{path}': {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Per-file processing failure, caught and recorded by the orchestrator.
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error(transparent)]
    Remote(#[from] RemoteTranscodeError),

    #[error(transparent)]
    Filesystem(#[from] FilesystemError),

    #[error("Encoded output is empty: {0}")]
    EmptyOutput(PathBuf),

    #[error("Background task failed: {0}")]
    Task(String),
}
