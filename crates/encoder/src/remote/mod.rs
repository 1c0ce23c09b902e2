//! Remote transcoding backends and the driver that takes one file through a
//! backend's submit → poll → fetch → cleanup lifecycle.

pub mod cloudconvert;
pub mod cloudinary;
pub mod retry;

#[cfg(test)]
pub(crate) mod fake;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use log::{debug, info, warn};
use reqwest::{Client, Response, StatusCode};
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::config::{Credentials, EncoderConfig, PollPolicy, RetryPolicy};
use crate::error::{ConfigError, RemoteTranscodeError};
use crate::job::JobState;
use crate::settings::TranscodeSettings;

pub use cloudconvert::CloudConvertClient;
pub use cloudinary::CloudinaryClient;
pub use retry::{backoff_delay, with_retry};

/// Handle to one in-flight remote operation
#[derive(Debug, Clone)]
pub struct JobHandle {
    /// Remote job id (CloudConvert) or asset public id (Cloudinary)
    pub remote_id: String,
    pub local_path: PathBuf,
    pub settings: TranscodeSettings,
    pub state: JobState,
    /// Where the finished output can be downloaded, once known
    pub output_url: Option<String>,
}

impl JobHandle {
    pub fn new(remote_id: impl Into<String>, local_path: &Path, settings: &TranscodeSettings) -> Self {
        Self {
            remote_id: remote_id.into(),
            local_path: local_path.to_path_buf(),
            settings: settings.clone(),
            state: JobState::Submitted,
            output_url: None,
        }
    }

    fn advance(&mut self, next: JobState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {:?} -> {:?}",
            self.state,
            next
        );
        debug!("Remote job {}: {:?} -> {:?}", self.remote_id, self.state, next);
        self.state = next;
    }
}

/// Result of one poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStatus {
    Pending,
    /// Output ready at the given URL
    Ready(String),
    /// The remote job ended in error
    Failed(String),
}

/// One cloud transcoding service
#[async_trait]
pub trait RemoteTranscoder: Send + Sync {
    fn name(&self) -> &'static str;

    /// Check credentials and connectivity
    async fn verify(&self) -> Result<(), RemoteTranscodeError>;

    /// Upload `local_path` and start a transcode with `settings`
    async fn submit(
        &self,
        local_path: &Path,
        settings: &TranscodeSettings,
    ) -> Result<JobHandle, RemoteTranscodeError>;

    async fn poll(&self, handle: &JobHandle) -> Result<PollStatus, RemoteTranscodeError>;

    /// Download the output into `dest_dir`, returning the local path
    async fn fetch(&self, handle: &JobHandle, dest_dir: &Path) -> Result<PathBuf, RemoteTranscodeError>;

    /// Delete the remote job or asset
    async fn cleanup(&self, handle: &JobHandle) -> Result<(), RemoteTranscodeError>;
}

/// Build the backend selected by the credentials
pub fn build_transcoder(
    cfg: &EncoderConfig,
    credentials: Credentials,
) -> Result<Arc<dyn RemoteTranscoder>, ConfigError> {
    let client = build_http_client(cfg.request_timeout())?;
    let transcoder: Arc<dyn RemoteTranscoder> = match credentials {
        Credentials::CloudConvert { api_key } => Arc::new(CloudConvertClient::new(
            client,
            cfg.cloudconvert.base_url(),
            api_key,
        )),
        Credentials::Cloudinary {
            cloud_name,
            api_key,
            api_secret,
        } => Arc::new(CloudinaryClient::new(
            client,
            &cfg.cloudinary,
            cloud_name,
            api_key,
            api_secret,
        )),
    };
    info!("Using {} backend", transcoder.name());
    Ok(transcoder)
}

pub fn build_http_client(request_timeout: Duration) -> Result<Client, ConfigError> {
    Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .timeout(request_timeout)
        .user_agent(concat!("cloudenc/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| ConfigError::validation(format!("failed to build HTTP client: {}", e)))
}

/// Statuses worth retrying: timeouts, throttling, "still processing", server errors
pub fn status_is_transient(status: StatusCode) -> bool {
    status.is_server_error()
        || matches!(
            status,
            StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS | StatusCode::LOCKED
        )
        // Cloudinary's rate limit status
        || status.as_u16() == 420
}

const MAX_ERROR_BODY: usize = 500;

/// Turn a non-success response into a classified error
pub(crate) async fn error_for_response(response: Response, context: &str) -> RemoteTranscodeError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let mut body = body.trim().to_string();
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
        body.push('…');
    }
    let message = format!("{} failed with status {}: {}", context, status, body);
    if status_is_transient(status) {
        RemoteTranscodeError::Transient(message)
    } else {
        RemoteTranscodeError::Permanent(message)
    }
}

/// Stream `url` into `dest`; a partial file is removed on failure
pub(crate) async fn download_to(client: &Client, url: &str, dest: &Path) -> Result<u64, RemoteTranscodeError> {
    let response = client.get(url).send().await?;
    if !response.status().is_success() {
        return Err(error_for_response(response, "download").await);
    }

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            RemoteTranscodeError::transient(format!("failed to create {}: {}", parent.display(), e))
        })?;
    }

    let result = async {
        let io_err = |e: std::io::Error| {
            RemoteTranscodeError::transient(format!("failed writing {}: {}", dest.display(), e))
        };
        let mut file = tokio::fs::File::create(dest).await.map_err(io_err)?;
        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await.map_err(io_err)?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(io_err)?;
        file.sync_all().await.map_err(io_err)?;
        Ok::<u64, RemoteTranscodeError>(written)
    }
    .await;

    if result.is_err() {
        tokio::fs::remove_file(dest).await.ok();
    }
    result
}

/// Local copy of a finished remote transcode
#[derive(Debug, Clone)]
pub struct EncodedOutput {
    pub remote_id: String,
    pub path: PathBuf,
    pub size: u64,
}

/// A failed encode, with the remote id if the job got that far
#[derive(Debug, thiserror::Error)]
#[error("{source}")]
pub struct EncodeFailure {
    pub remote_id: Option<String>,
    #[source]
    pub source: RemoteTranscodeError,
}

impl EncodeFailure {
    fn new(remote_id: Option<String>, source: RemoteTranscodeError) -> Self {
        Self { remote_id, source }
    }
}

/// Takes a file through submit → poll → fetch on one backend, and always
/// cleans up the remote side once a job exists.
pub struct TranscodeDriver {
    transcoder: Arc<dyn RemoteTranscoder>,
    retry: RetryPolicy,
    poll: PollPolicy,
    temp_dir: PathBuf,
}

impl TranscodeDriver {
    pub fn new(transcoder: Arc<dyn RemoteTranscoder>, cfg: &EncoderConfig) -> Self {
        Self {
            transcoder,
            retry: cfg.retry.clone(),
            poll: cfg.poll.clone(),
            temp_dir: cfg.temp_dir.clone(),
        }
    }

    pub fn transcoder(&self) -> &Arc<dyn RemoteTranscoder> {
        &self.transcoder
    }

    /// Encode `local_path` remotely and download the result into the temp dir
    pub async fn encode(
        &self,
        local_path: &Path,
        settings: &TranscodeSettings,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<EncodedOutput, EncodeFailure> {
        if *shutdown.borrow() {
            return Err(EncodeFailure::new(None, RemoteTranscodeError::Cancelled));
        }

        let submit_what = format!("submit {}", local_path.display());
        let mut handle = with_retry(&self.retry, &submit_what, || {
            self.transcoder.submit(local_path, settings)
        })
        .await
        .map_err(|e| EncodeFailure::new(None, e))?;
        info!(
            "Submitted {} to {} as {}",
            local_path.display(),
            self.transcoder.name(),
            handle.remote_id
        );

        let result = self.wait_and_fetch(&mut handle, &mut shutdown).await;

        let cleanup_err = self.transcoder.cleanup(&handle).await.err();
        match &cleanup_err {
            None => debug!("Cleaned up remote job {}", handle.remote_id),
            Some(e) => warn!("Failed to clean up remote job {}: {}", handle.remote_id, e),
        }

        result.map_err(|e| EncodeFailure::new(Some(handle.remote_id.clone()), e))
    }

    async fn wait_and_fetch(
        &self,
        handle: &mut JobHandle,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<EncodedOutput, RemoteTranscodeError> {
        handle.advance(JobState::Polling);
        let url = self.wait_until_ready(handle, shutdown).await?;
        handle.output_url = Some(url);

        if *shutdown.borrow() {
            return Err(RemoteTranscodeError::Cancelled);
        }

        let fetch_what = format!("download {}", handle.remote_id);
        let temp_dir = self.temp_dir.as_path();
        let fetch_handle: &JobHandle = handle;
        let fetch = with_retry(&self.retry, &fetch_what, || {
            self.transcoder.fetch(fetch_handle, temp_dir)
        });
        // The download gets its own max_wait budget; polling may have used up the first one
        let path = tokio::select! {
            fetched = tokio::time::timeout(self.poll.max_wait(), fetch) => fetched.map_err(|_| {
                RemoteTranscodeError::transient(format!(
                    "download of {} not finished after {}s",
                    fetch_handle.remote_id, self.poll.max_wait_secs
                ))
            })??,
            _ = shutdown_requested(shutdown) => return Err(RemoteTranscodeError::Cancelled),
        };
        handle.advance(JobState::Downloaded);

        let size = tokio::fs::metadata(&path)
            .await
            .map(|m| m.len())
            .map_err(|e| {
                RemoteTranscodeError::transient(format!("downloaded file {} vanished: {}", path.display(), e))
            })?;

        Ok(EncodedOutput {
            remote_id: handle.remote_id.clone(),
            path,
            size,
        })
    }

    async fn wait_until_ready(
        &self,
        handle: &JobHandle,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<String, RemoteTranscodeError> {
        let initial = Duration::from_secs(self.poll.initial_interval_secs);
        let max = Duration::from_secs(self.poll.max_interval_secs);
        let deadline = Instant::now() + self.poll.max_wait();
        let mut attempt = 0;
        let mut consecutive_errors = 0;

        let not_ready = || {
            RemoteTranscodeError::transient(format!(
                "{} not ready after {}s",
                handle.remote_id, self.poll.max_wait_secs
            ))
        };

        loop {
            // A stalled request must not outlive the deadline or a shutdown
            let polled = tokio::select! {
                polled = tokio::time::timeout_at(deadline, self.transcoder.poll(handle)) => polled,
                _ = shutdown_requested(shutdown) => return Err(RemoteTranscodeError::Cancelled),
            };
            let Ok(polled) = polled else {
                return Err(not_ready());
            };

            match polled {
                Ok(PollStatus::Ready(url)) => return Ok(url),
                Ok(PollStatus::Failed(reason)) => return Err(RemoteTranscodeError::Permanent(reason)),
                Ok(PollStatus::Pending) => consecutive_errors = 0,
                Err(e) if e.is_retryable() && consecutive_errors + 1 < self.retry.max_attempts => {
                    consecutive_errors += 1;
                    warn!("Polling {} failed: {}; will retry", handle.remote_id, e);
                }
                Err(e) => return Err(e),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(not_ready());
            }

            let delay = backoff_delay(attempt, initial, max).min(deadline - now);
            attempt += 1;
            debug!("Remote job {} pending, next poll in {:?}", handle.remote_id, delay);

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_requested(shutdown) => return Err(RemoteTranscodeError::Cancelled),
            }
        }
    }
}

/// Resolves once shutdown has been signalled; never resolves if the sender is gone
pub async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
