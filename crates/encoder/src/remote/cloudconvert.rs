//! CloudConvert v2 jobs API: import/upload → convert → export/url.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::{debug, info, warn};
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{download_to, error_for_response, JobHandle, PollStatus, RemoteTranscoder};
use crate::error::RemoteTranscodeError;
use crate::settings::TranscodeSettings;
use crate::sidecar::download_path;

const IMPORT_TASK: &str = "import-video";
const CONVERT_TASK: &str = "convert-video";
const EXPORT_TASK: &str = "export-video";

pub struct CloudConvertClient {
    http: Client,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct JobEnvelope {
    data: Job,
}

#[derive(Debug, Deserialize)]
struct Job {
    id: String,
    status: String,
    #[serde(default)]
    tasks: Vec<Task>,
}

#[derive(Debug, Deserialize)]
struct Task {
    #[serde(default)]
    name: Option<String>,
    operation: String,
    status: String,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    result: Option<TaskResult>,
}

#[derive(Debug, Deserialize)]
struct TaskResult {
    #[serde(default)]
    form: Option<UploadForm>,
    #[serde(default)]
    files: Vec<ResultFile>,
}

#[derive(Debug, Deserialize)]
struct UploadForm {
    url: String,
    #[serde(default)]
    parameters: serde_json::Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct ResultFile {
    url: String,
}

impl CloudConvertClient {
    pub fn new(http: Client, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn create_job(&self, settings: &TranscodeSettings) -> Result<Job, RemoteTranscodeError> {
        let response = self
            .http
            .post(self.url("/jobs"))
            .bearer_auth(&self.api_key)
            .json(&job_payload(settings))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(error_for_response(response, "create job").await);
        }
        let envelope: JobEnvelope = response.json().await?;
        Ok(envelope.data)
    }

    async fn upload(&self, form: &UploadForm, local_path: &Path) -> Result<(), RemoteTranscodeError> {
        let file = tokio::fs::File::open(local_path).await.map_err(|e| {
            RemoteTranscodeError::transient(format!("failed to open {}: {}", local_path.display(), e))
        })?;
        let len = file
            .metadata()
            .await
            .map_err(|e| RemoteTranscodeError::transient(format!("failed to stat {}: {}", local_path.display(), e)))?
            .len();
        let file_name = local_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "video".to_string());

        // Signed storage parameters must precede the file part
        let mut multipart = Form::new();
        for (key, value) in &form.parameters {
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            multipart = multipart.text(key.clone(), value);
        }
        let part = Part::stream_with_length(Body::from(file), len).file_name(file_name);
        multipart = multipart.part("file", part);

        let response = self.http.post(&form.url).multipart(multipart).send().await?;
        if !(response.status().is_success() || response.status().is_redirection()) {
            return Err(error_for_response(response, "upload").await);
        }
        debug!("Uploaded {} ({} bytes)", local_path.display(), len);
        Ok(())
    }

    async fn delete_job(&self, id: &str) -> Result<(), RemoteTranscodeError> {
        let response = self
            .http
            .delete(self.url(&format!("/jobs/{}", id)))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        match response.status() {
            s if s.is_success() || s == StatusCode::NOT_FOUND => Ok(()),
            _ => Err(error_for_response(response, "delete job").await),
        }
    }
}

/// Task graph for one transcode
fn job_payload(settings: &TranscodeSettings) -> Value {
    let mut convert = json!({
        "operation": "convert",
        "input": IMPORT_TASK,
        "output_format": settings.output_format,
        "video_codec": settings.video_codec.cloudconvert_name(),
        "audio_codec": settings.audio_codec.as_str(),
        "crf": settings.effective_crf(),
    });
    if let Some(obj) = convert.as_object_mut() {
        if let Some(preset) = &settings.preset {
            obj.insert("preset".into(), json!(preset));
        }
        if let Some(fps) = settings.fps {
            obj.insert("fps".into(), json!(fps));
        }
        if let Some(w) = settings.max_width {
            obj.insert("width".into(), json!(w));
        }
        if let Some(h) = settings.max_height {
            obj.insert("height".into(), json!(h));
        }
        if settings.max_width.is_some() || settings.max_height.is_some() {
            obj.insert("fit".into(), json!("max"));
        }
    }

    json!({
        "tag": "cloudenc",
        "tasks": {
            IMPORT_TASK: { "operation": "import/upload" },
            CONVERT_TASK: convert,
            EXPORT_TASK: { "operation": "export/url", "input": CONVERT_TASK },
        }
    })
}

fn job_error(job: &Job) -> String {
    let failed: Vec<String> = job
        .tasks
        .iter()
        .filter(|t| t.status == "error")
        .map(|t| {
            format!(
                "task {} failed: {} {}",
                t.name.as_deref().unwrap_or(&t.operation),
                t.code.as_deref().unwrap_or("ERROR"),
                t.message.as_deref().unwrap_or("no message")
            )
        })
        .collect();
    if failed.is_empty() {
        format!("job {} ended with status {}", job.id, job.status)
    } else {
        failed.join("; ")
    }
}

fn export_url(job: &Job) -> Option<String> {
    job.tasks
        .iter()
        .find(|t| t.operation == "export/url" && t.status == "finished")
        .and_then(|t| t.result.as_ref())
        .and_then(|r| r.files.first())
        .map(|f| f.url.clone())
}

#[async_trait]
impl RemoteTranscoder for CloudConvertClient {
    fn name(&self) -> &'static str {
        "cloudconvert"
    }

    async fn verify(&self) -> Result<(), RemoteTranscodeError> {
        let response = self
            .http
            .get(self.url("/users/me"))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(error_for_response(response, "verify credentials").await);
        }
        Ok(())
    }

    async fn submit(
        &self,
        local_path: &Path,
        settings: &TranscodeSettings,
    ) -> Result<JobHandle, RemoteTranscodeError> {
        let job = self.create_job(settings).await?;
        info!("Created CloudConvert job {} for {}", job.id, local_path.display());

        let form = job
            .tasks
            .iter()
            .find(|t| t.operation == "import/upload")
            .and_then(|t| t.result.as_ref())
            .and_then(|r| r.form.as_ref());

        let uploaded = match form {
            Some(form) => self.upload(form, local_path).await,
            None => Err(RemoteTranscodeError::permanent(format!(
                "job {} has no upload form",
                job.id
            ))),
        };

        if let Err(e) = uploaded {
            if let Err(cleanup) = self.delete_job(&job.id).await {
                warn!("Failed to delete job {} after upload error: {}", job.id, cleanup);
            }
            return Err(e);
        }

        Ok(JobHandle::new(job.id, local_path, settings))
    }

    async fn poll(&self, handle: &JobHandle) -> Result<PollStatus, RemoteTranscodeError> {
        let response = self
            .http
            .get(self.url(&format!("/jobs/{}", handle.remote_id)))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(error_for_response(response, "poll job").await);
        }
        let job = response.json::<JobEnvelope>().await?.data;

        Ok(match job.status.as_str() {
            "finished" => match export_url(&job) {
                Some(url) => PollStatus::Ready(url),
                None => PollStatus::Failed(format!("job {} finished without an export file", job.id)),
            },
            "error" => PollStatus::Failed(job_error(&job)),
            _ => PollStatus::Pending,
        })
    }

    async fn fetch(&self, handle: &JobHandle, dest_dir: &Path) -> Result<PathBuf, RemoteTranscodeError> {
        let url = handle.output_url.as_deref().ok_or_else(|| {
            RemoteTranscodeError::permanent(format!("job {} has no output url", handle.remote_id))
        })?;
        let dest = download_path(dest_dir, &handle.local_path, &handle.settings.output_format);
        let bytes = download_to(&self.http, url, &dest).await?;
        debug!("Downloaded {} bytes for job {}", bytes, handle.remote_id);
        Ok(dest)
    }

    async fn cleanup(&self, handle: &JobHandle) -> Result<(), RemoteTranscodeError> {
        self.delete_job(&handle.remote_id).await
    }
}
