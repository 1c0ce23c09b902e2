pub mod config;
pub mod error;
pub mod job;
pub mod orchestrator;
pub mod remote;
pub mod report;
pub mod scan;
pub mod settings;
pub mod sidecar;
pub mod tracking;

pub use config::{Backend, Credentials, EncoderConfig};
pub use error::{ConfigError, FilesystemError, ProcessError, RemoteTranscodeError, StoreError};
pub use job::{FileId, JobState, JobStatus, ProcessingRecord};
pub use orchestrator::{Orchestrator, RunOptions, RunStats};
pub use remote::{build_transcoder, RemoteTranscoder};
pub use report::ReportWriter;
pub use scan::{DateSelection, Scanner};
pub use settings::{CompressionProfile, TranscodeSettings};
pub use tracking::TrackingStore;
