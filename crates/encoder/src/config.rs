use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::settings::{CompressionProfile, TranscodeSettings};

pub const CLOUDCONVERT_API_KEY_ENV: &str = "CLOUDCONVERT_API_KEY";
pub const CLOUDINARY_CLOUD_NAME_ENV: &str = "CLOUDINARY_CLOUD_NAME";
pub const CLOUDINARY_API_KEY_ENV: &str = "CLOUDINARY_API_KEY";
pub const CLOUDINARY_API_SECRET_ENV: &str = "CLOUDINARY_API_SECRET";

const MIB: u64 = 1024 * 1024;

/// Which cloud service performs the transcode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    CloudConvert,
    Cloudinary,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::CloudConvert => f.write_str("cloudconvert"),
            Backend::Cloudinary => f.write_str("cloudinary"),
        }
    }
}

/// Bounded retry for transient submit/fetch failures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub initial_backoff_secs: u64,
    pub max_backoff_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_secs: 2,
            max_backoff_secs: 30,
        }
    }
}

/// How long and how often to poll a remote job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollPolicy {
    pub initial_interval_secs: u64,
    pub max_interval_secs: u64,
    /// Give up on a job after this long
    pub max_wait_secs: u64,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            initial_interval_secs: 5,
            max_interval_secs: 30,
            max_wait_secs: 60 * 60,
        }
    }
}

impl PollPolicy {
    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }
}

/// CloudConvert-specific options
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConvertConfig {
    /// Use the sandbox API (free, test files only)
    pub sandbox: bool,
    /// Override the API base URL
    pub api_base: Option<String>,
}

impl CloudConvertConfig {
    pub fn base_url(&self) -> String {
        match (&self.api_base, self.sandbox) {
            (Some(base), _) => base.trim_end_matches('/').to_string(),
            (None, true) => "https://api.sandbox.cloudconvert.com/v2".to_string(),
            (None, false) => "https://api.cloudconvert.com/v2".to_string(),
        }
    }
}

/// Cloudinary-specific options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudinaryConfig {
    /// Folder prefix for uploaded public ids
    pub folder: String,
    pub api_base: String,
    pub delivery_base: String,
}

impl Default for CloudinaryConfig {
    fn default() -> Self {
        Self {
            folder: "video_optimizer".to_string(),
            api_base: "https://api.cloudinary.com".to_string(),
            delivery_base: "https://res.cloudinary.com".to_string(),
        }
    }
}

/// Configuration for the encoder job.
///
/// Built once at startup and shared read-only (behind an `Arc`) by every task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// Root of the `YYYY/MM/DD` tree
    pub videos_root: PathBuf,
    /// Extensions (without dot, case-insensitive) treated as video
    pub video_extensions: Vec<String>,
    /// Smallest file worth sending, in bytes
    pub min_bytes: u64,
    /// Largest file to send, in bytes
    pub max_bytes: u64,
    /// Lowercase filename fragments marking already-optimized files
    pub skip_patterns: Vec<String>,
    /// Number of files in flight at once
    pub max_concurrent_jobs: usize,
    pub backend: Backend,
    pub profile: CompressionProfile,
    /// Explicit settings; overrides `profile` when present
    pub settings: Option<TranscodeSettings>,
    /// JSON document recording processed files
    pub tracking_file: PathBuf,
    /// Append-only human readable outcome log
    pub log_file: PathBuf,
    /// Append-only CSV outcome report
    pub csv_file: PathBuf,
    /// Where downloads land before replacing originals
    pub temp_dir: PathBuf,
    /// Keep `<file>.backup` after a successful replace
    pub keep_backups: bool,
    /// Resubmit files whose last attempt failed
    pub retry_failed: bool,
    pub retry: RetryPolicy,
    pub poll: PollPolicy,
    /// Upper bound on any single HTTP request, uploads and downloads included
    pub request_timeout_secs: u64,
    pub cloudconvert: CloudConvertConfig,
    pub cloudinary: CloudinaryConfig,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl EncoderConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            videos_root: PathBuf::from("/videos"),
            video_extensions: vec!["mp4".to_string()],
            min_bytes: 10 * MIB,
            max_bytes: 500 * MIB,
            skip_patterns: [
                "_compressed",
                "_encoded",
                "_optimized",
                "_small",
                "_mobile",
                "_web",
                "_720p",
                "_480p",
                "_cloudinary",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            max_concurrent_jobs: 3,
            backend: Backend::default(),
            profile: CompressionProfile::default(),
            settings: None,
            tracking_file: PathBuf::from("encoded_files.json"),
            log_file: PathBuf::from("video_encoding.log"),
            csv_file: PathBuf::from("video_encoding_log.csv"),
            temp_dir: std::env::temp_dir().join("cloudenc"),
            keep_backups: true,
            retry_failed: false,
            retry: RetryPolicy::default(),
            poll: PollPolicy::default(),
            request_timeout_secs: 30 * 60,
            cloudconvert: CloudConvertConfig::default(),
            cloudinary: CloudinaryConfig::default(),
        }
    }

    /// Load configuration from a JSON or TOML file, or return defaults if no path is given
    pub fn load_config(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(config_path) = path else {
            return Ok(Self::default_config());
        };

        let content = std::fs::read_to_string(config_path).map_err(|source| ConfigError::ReadFile {
            path: config_path.to_path_buf(),
            source,
        })?;

        if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
            toml::from_str(&content).map_err(|e| ConfigError::Parse {
                path: config_path.to_path_buf(),
                message: e.to_string(),
            })
        } else {
            serde_json::from_str(&content).map_err(|e| ConfigError::Parse {
                path: config_path.to_path_buf(),
                message: e.to_string(),
            })
        }
    }

    /// Transcode settings for this run
    pub fn transcode_settings(&self) -> TranscodeSettings {
        self.settings
            .clone()
            .unwrap_or_else(|| TranscodeSettings::for_profile(self.profile))
    }

    /// Check internal consistency and that the videos root can be read
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_bytes > self.max_bytes {
            return Err(ConfigError::validation(format!(
                "min_bytes ({}) is larger than max_bytes ({})",
                self.min_bytes, self.max_bytes
            )));
        }
        if self.max_concurrent_jobs == 0 {
            return Err(ConfigError::validation("max_concurrent_jobs must be at least 1"));
        }
        if self.video_extensions.is_empty() {
            return Err(ConfigError::validation("video_extensions must not be empty"));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::validation("retry.max_attempts must be at least 1"));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::validation("request_timeout_secs must be at least 1"));
        }
        if self.poll.initial_interval_secs > self.poll.max_interval_secs {
            return Err(ConfigError::validation(
                "poll.initial_interval_secs is larger than poll.max_interval_secs",
            ));
        }

        if !self.videos_root.exists() {
            return Err(ConfigError::RootNotFound(self.videos_root.clone()));
        }
        std::fs::read_dir(&self.videos_root).map_err(|source| ConfigError::RootUnreadable {
            path: self.videos_root.clone(),
            source,
        })?;

        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// API credentials, read from the environment only
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    CloudConvert {
        api_key: String,
    },
    Cloudinary {
        cloud_name: String,
        api_key: String,
        api_secret: String,
    },
}

impl Credentials {
    pub fn from_env(backend: Backend) -> Result<Self, ConfigError> {
        Self::from_lookup(backend, |name| std::env::var(name).ok())
    }

    /// Resolve credentials through an arbitrary variable lookup
    pub fn from_lookup<F>(backend: Backend, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let require = |name: &'static str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or(ConfigError::MissingCredential { name })
        };

        match backend {
            Backend::CloudConvert => Ok(Credentials::CloudConvert {
                api_key: require(CLOUDCONVERT_API_KEY_ENV)?,
            }),
            Backend::Cloudinary => Ok(Credentials::Cloudinary {
                cloud_name: require(CLOUDINARY_CLOUD_NAME_ENV)?,
                api_key: require(CLOUDINARY_API_KEY_ENV)?,
                api_secret: require(CLOUDINARY_API_SECRET_ENV)?,
            }),
        }
    }

    pub fn backend(&self) -> Backend {
        match self {
            Credentials::CloudConvert { .. } => Backend::CloudConvert,
            Credentials::Cloudinary { .. } => Backend::Cloudinary,
        }
    }
}

// Secrets never reach the logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::CloudConvert { .. } => f
                .debug_struct("CloudConvert")
                .field("api_key", &"<redacted>")
                .finish(),
            Credentials::Cloudinary {
                cloud_name, ..
            } => f
                .debug_struct("Cloudinary")
                .field("cloud_name", cloud_name)
                .field("api_key", &"<redacted>")
                .field("api_secret", &"<redacted>")
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = EncoderConfig::default_config();
        assert_eq!(cfg.min_bytes, 10 * 1024 * 1024);
        assert_eq!(cfg.max_bytes, 500 * 1024 * 1024);
        assert_eq!(cfg.max_concurrent_jobs, 3);
        assert!(cfg.keep_backups);
        assert_eq!(cfg.video_extensions, vec!["mp4".to_string()]);
        assert_eq!(cfg.request_timeout(), Duration::from_secs(1800));
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("encoder.toml");
        std::fs::write(
            &path,
            r#"
videos_root = "/srv/videos"
backend = "cloudinary"
profile = "extreme"
max_concurrent_jobs = 5

[poll]
max_wait_secs = 120
"#,
        )
        .unwrap();

        let cfg = EncoderConfig::load_config(Some(&path)).unwrap();
        assert_eq!(cfg.videos_root, PathBuf::from("/srv/videos"));
        assert_eq!(cfg.backend, Backend::Cloudinary);
        assert_eq!(cfg.max_concurrent_jobs, 5);
        assert_eq!(cfg.poll.max_wait_secs, 120);
        assert_eq!(cfg.poll.initial_interval_secs, 5);
        assert_eq!(cfg.min_bytes, 10 * 1024 * 1024);
        assert_eq!(cfg.transcode_settings().max_height, Some(480));
    }

    #[test]
    fn json_config_is_parsed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("encoder.json");
        std::fs::write(&path, r#"{"min_bytes": 1, "max_bytes": 2, "cloudconvert": {"sandbox": true}}"#)
            .unwrap();

        let cfg = EncoderConfig::load_config(Some(&path)).unwrap();
        assert_eq!(cfg.min_bytes, 1);
        assert_eq!(
            cfg.cloudconvert.base_url(),
            "https://api.sandbox.cloudconvert.com/v2"
        );
    }

    #[test]
    fn unparseable_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("encoder.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            EncoderConfig::load_config(Some(&path)),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn validate_rejects_missing_root_and_bad_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = EncoderConfig {
            videos_root: dir.path().join("nope"),
            ..EncoderConfig::default_config()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::RootNotFound(_))));

        cfg.videos_root = dir.path().to_path_buf();
        assert!(cfg.validate().is_ok());

        cfg.min_bytes = cfg.max_bytes + 1;
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation { .. })));
    }

    #[test]
    fn credentials_require_every_variable() {
        let mut vars = HashMap::new();
        vars.insert(CLOUDINARY_CLOUD_NAME_ENV, "demo".to_string());
        vars.insert(CLOUDINARY_API_KEY_ENV, "key".to_string());

        let err = Credentials::from_lookup(Backend::Cloudinary, |n| vars.get(n).cloned()).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingCredential { name: CLOUDINARY_API_SECRET_ENV }
        ));

        vars.insert(CLOUDINARY_API_SECRET_ENV, "hunter2".to_string());
        let creds = Credentials::from_lookup(Backend::Cloudinary, |n| vars.get(n).cloned()).unwrap();
        assert_eq!(creds.backend(), Backend::Cloudinary);
        assert!(!format!("{:?}", creds).contains("hunter2"));
    }

    #[test]
    fn blank_api_key_counts_as_missing() {
        let result = Credentials::from_lookup(Backend::CloudConvert, |_| Some("  ".to_string()));
        assert!(matches!(result, Err(ConfigError::MissingCredential { .. })));
    }
}
