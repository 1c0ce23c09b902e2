//! Cloudinary: signed upload, on-the-fly transformation URL, destroy.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::{debug, info};
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client, StatusCode};
use serde::Deserialize;
use sha1::{Digest, Sha1};
use tokio::io::AsyncReadExt;

use super::{download_to, error_for_response, JobHandle, PollStatus, RemoteTranscoder};
use crate::config::CloudinaryConfig;
use crate::error::RemoteTranscodeError;
use crate::settings::{AudioCodec, TranscodeSettings};
use crate::sidecar::download_path;

/// Files above this size are uploaded in chunks
pub const CHUNKED_UPLOAD_THRESHOLD: u64 = 100 * 1024 * 1024;
pub const UPLOAD_CHUNK_SIZE: u64 = 20 * 1024 * 1024;

pub struct CloudinaryClient {
    http: Client,
    api_base: String,
    delivery_base: String,
    folder: String,
    cloud_name: String,
    api_key: String,
    api_secret: String,
    chunk_threshold: u64,
    chunk_size: u64,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    #[serde(default)]
    public_id: Option<String>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct DestroyResponse {
    #[serde(default)]
    result: String,
}

/// SHA-1 of the `k=v` pairs sorted by key, joined with `&`, followed by the secret
pub fn sign(params: &[(&str, String)], api_secret: &str) -> String {
    let mut sorted: Vec<_> = params.iter().filter(|(_, v)| !v.is_empty()).collect();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    let joined = sorted
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");

    let mut hasher = Sha1::new();
    hasher.update(joined.as_bytes());
    hasher.update(api_secret.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Comma-separated transformation components, sorted by key
pub fn transformation(settings: &TranscodeSettings) -> String {
    let mut parts = Vec::new();
    if settings.audio_codec != AudioCodec::Copy {
        parts.push(format!("ac_{}", settings.audio_codec.as_str()));
    }
    if let Some(br) = &settings.bitrate {
        parts.push(format!("br_{}", br));
    }
    if settings.max_width.is_some() || settings.max_height.is_some() {
        parts.push("c_limit".to_string());
    }
    if let Some(f) = &settings.delivery_format {
        parts.push(format!("f_{}", f));
    }
    parts.push("fl_progressive".to_string());
    if let Some(fps) = settings.fps {
        parts.push(format!("fps_{}", fps));
    }
    if let Some(h) = settings.max_height {
        parts.push(format!("h_{}", h));
    }
    parts.push(format!("q_{}", settings.quality.cloudinary_name()));
    parts.push(format!("vc_{}", settings.video_codec.cloudinary_name()));
    if let Some(w) = settings.max_width {
        parts.push(format!("w_{}", w));
    }
    parts.join(",")
}

/// `<folder>/<stem>_<uuid>`, with anything outside `[A-Za-z0-9_-]` replaced
pub fn public_id_for(folder: &str, path: &Path) -> String {
    let stem: String = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "video".to_string())
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    let id = format!("{}_{}", stem, uuid::Uuid::new_v4().simple());
    let folder = folder.trim_matches('/');
    if folder.is_empty() {
        id
    } else {
        format!("{}/{}", folder, id)
    }
}

fn timestamp() -> String {
    chrono::Utc::now().timestamp().to_string()
}

impl CloudinaryClient {
    pub fn new(
        http: Client,
        cfg: &CloudinaryConfig,
        cloud_name: impl Into<String>,
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
    ) -> Self {
        Self {
            http,
            api_base: cfg.api_base.trim_end_matches('/').to_string(),
            delivery_base: cfg.delivery_base.trim_end_matches('/').to_string(),
            folder: cfg.folder.clone(),
            cloud_name: cloud_name.into(),
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            chunk_threshold: CHUNKED_UPLOAD_THRESHOLD,
            chunk_size: UPLOAD_CHUNK_SIZE,
        }
    }

    #[cfg(test)]
    fn with_chunking(mut self, threshold: u64, chunk_size: u64) -> Self {
        self.chunk_threshold = threshold;
        self.chunk_size = chunk_size;
        self
    }

    fn api_url(&self, action: &str) -> String {
        format!("{}/v1_1/{}/{}", self.api_base, self.cloud_name, action)
    }

    /// Delivery URL applying `settings` to an uploaded asset
    pub fn delivery_url(&self, public_id: &str, settings: &TranscodeSettings) -> String {
        let ext = settings
            .delivery_format
            .as_deref()
            .unwrap_or(&settings.output_format);
        format!(
            "{}/{}/video/upload/{}/{}.{}",
            self.delivery_base,
            self.cloud_name,
            transformation(settings),
            public_id,
            ext
        )
    }

    fn signed_form(&self, public_id: &str) -> Form {
        let ts = timestamp();
        let params = [
            ("overwrite", "true".to_string()),
            ("public_id", public_id.to_string()),
            ("timestamp", ts.clone()),
        ];
        Form::new()
            .text("api_key", self.api_key.clone())
            .text("overwrite", "true")
            .text("public_id", public_id.to_string())
            .text("timestamp", ts)
            .text("signature", sign(&params, &self.api_secret))
    }

    async fn read_upload_response(response: reqwest::Response) -> Result<String, RemoteTranscodeError> {
        if !response.status().is_success() {
            return Err(error_for_response(response, "upload").await);
        }
        let body: UploadResponse = response.json().await?;
        match (body.public_id, body.error) {
            (_, Some(err)) => Err(RemoteTranscodeError::permanent(err.message)),
            (Some(id), None) => Ok(id),
            (None, None) => Err(RemoteTranscodeError::permanent("upload response had no public_id")),
        }
    }

    async fn upload_whole(&self, local_path: &Path, public_id: &str, len: u64) -> Result<String, RemoteTranscodeError> {
        let file = open(local_path).await?;
        let part = Part::stream_with_length(Body::from(file), len).file_name(file_name(local_path));
        let form = self.signed_form(public_id).part("file", part);
        let response = self
            .http
            .post(self.api_url("video/upload"))
            .multipart(form)
            .send()
            .await?;
        Self::read_upload_response(response).await
    }

    async fn upload_chunked(&self, local_path: &Path, public_id: &str, len: u64) -> Result<String, RemoteTranscodeError> {
        let mut file = open(local_path).await?;
        let upload_id = uuid::Uuid::new_v4().simple().to_string();
        let mut offset = 0u64;
        let mut last = None;

        while offset < len {
            let size = self.chunk_size.min(len - offset);
            let mut buf = vec![0u8; size as usize];
            file.read_exact(&mut buf).await.map_err(|e| {
                RemoteTranscodeError::transient(format!("failed reading {}: {}", local_path.display(), e))
            })?;
            let end = offset + size - 1;
            debug!("Uploading bytes {}-{}/{} of {}", offset, end, len, local_path.display());

            let form = self
                .signed_form(public_id)
                .part("file", Part::bytes(buf).file_name(file_name(local_path)));
            let response = self
                .http
                .post(self.api_url("video/upload"))
                .header("X-Unique-Upload-Id", upload_id.as_str())
                .header("Content-Range", format!("bytes {}-{}/{}", offset, end, len))
                .multipart(form)
                .send()
                .await?;
            if !response.status().is_success() {
                return Err(error_for_response(response, "chunked upload").await);
            }
            last = Some(response);
            offset += size;
        }

        match last {
            Some(response) => Self::read_upload_response(response).await,
            None => Err(RemoteTranscodeError::permanent(format!("{} is empty", local_path.display()))),
        }
    }
}

async fn open(path: &Path) -> Result<tokio::fs::File, RemoteTranscodeError> {
    tokio::fs::File::open(path)
        .await
        .map_err(|e| RemoteTranscodeError::transient(format!("failed to open {}: {}", path.display(), e)))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "video".to_string())
}

#[async_trait]
impl RemoteTranscoder for CloudinaryClient {
    fn name(&self) -> &'static str {
        "cloudinary"
    }

    async fn verify(&self) -> Result<(), RemoteTranscodeError> {
        let response = self
            .http
            .get(self.api_url("ping"))
            .basic_auth(&self.api_key, Some(&self.api_secret))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(error_for_response(response, "ping").await);
        }
        Ok(())
    }

    async fn submit(
        &self,
        local_path: &Path,
        settings: &TranscodeSettings,
    ) -> Result<JobHandle, RemoteTranscodeError> {
        let len = tokio::fs::metadata(local_path)
            .await
            .map_err(|e| RemoteTranscodeError::transient(format!("failed to stat {}: {}", local_path.display(), e)))?
            .len();
        let public_id = public_id_for(&self.folder, local_path);

        let uploaded = if len > self.chunk_threshold {
            self.upload_chunked(local_path, &public_id, len).await?
        } else {
            self.upload_whole(local_path, &public_id, len).await?
        };
        info!("Uploaded {} to Cloudinary as {}", local_path.display(), uploaded);

        let mut handle = JobHandle::new(uploaded.clone(), local_path, settings);
        handle.output_url = Some(self.delivery_url(&uploaded, settings));
        Ok(handle)
    }

    async fn poll(&self, handle: &JobHandle) -> Result<PollStatus, RemoteTranscodeError> {
        let url = handle
            .output_url
            .clone()
            .unwrap_or_else(|| self.delivery_url(&handle.remote_id, &handle.settings));
        let response = self.http.head(&url).send().await?;
        match response.status() {
            s if s.is_success() => Ok(PollStatus::Ready(url)),
            StatusCode::LOCKED => Ok(PollStatus::Pending),
            StatusCode::NOT_FOUND => Ok(PollStatus::Failed(format!(
                "derived video for {} not found",
                handle.remote_id
            ))),
            _ => Err(error_for_response(response, "poll derived video").await),
        }
    }

    async fn fetch(&self, handle: &JobHandle, dest_dir: &Path) -> Result<PathBuf, RemoteTranscodeError> {
        let url = handle
            .output_url
            .clone()
            .unwrap_or_else(|| self.delivery_url(&handle.remote_id, &handle.settings));
        let ext = handle
            .settings
            .delivery_format
            .as_deref()
            .unwrap_or(&handle.settings.output_format);
        let dest = download_path(dest_dir, &handle.local_path, ext);
        let bytes = download_to(&self.http, &url, &dest).await?;
        debug!("Downloaded {} bytes for {}", bytes, handle.remote_id);
        Ok(dest)
    }

    async fn cleanup(&self, handle: &JobHandle) -> Result<(), RemoteTranscodeError> {
        let ts = timestamp();
        let params = [
            ("invalidate", "true".to_string()),
            ("public_id", handle.remote_id.clone()),
            ("timestamp", ts.clone()),
        ];
        let signature = sign(&params, &self.api_secret);
        let form = [
            ("api_key", self.api_key.as_str()),
            ("invalidate", "true"),
            ("public_id", handle.remote_id.as_str()),
            ("timestamp", ts.as_str()),
            ("signature", signature.as_str()),
        ];

        let response = self
            .http
            .post(self.api_url("video/destroy"))
            .form(&form)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(error_for_response(response, "destroy").await);
        }
        let body: DestroyResponse = response.json().await?;
        match body.result.as_str() {
            "ok" | "not found" => Ok(()),
            other => Err(RemoteTranscodeError::permanent(format!(
                "destroy {} returned {:?}",
                handle.remote_id, other
            ))),
        }
    }
}
