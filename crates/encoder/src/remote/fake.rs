//! In-memory transcoder for driver and orchestrator tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{JobHandle, PollStatus, RemoteTranscoder};
use crate::error::RemoteTranscodeError;
use crate::settings::TranscodeSettings;
use crate::sidecar::download_path;

#[derive(Debug, Clone)]
pub(crate) enum FakeBehavior {
    /// Produce an output of `size` bytes after `pending_polls` pending polls
    Encode { size: u64, pending_polls: u32 },
    RejectSubmit(RemoteTranscodeError),
    /// Fail `failures` submits transiently, then encode to `size` bytes
    FlakySubmit { failures: u32, size: u64 },
    /// The remote job ends in error
    JobFails(String),
    /// Polls never answer
    StallPoll,
}

pub(crate) struct FakeTranscoder {
    default: FakeBehavior,
    per_file: HashMap<String, FakeBehavior>,
    submits: AtomicU32,
    polls: AtomicU32,
    next_id: AtomicU32,
    submit_attempts: Mutex<HashMap<String, u32>>,
    polls_by_job: Mutex<HashMap<String, u32>>,
    jobs: Mutex<HashMap<String, FakeBehavior>>,
    cleaned_up: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeTranscoder {
    pub(crate) fn new(default: FakeBehavior) -> Self {
        Self {
            default,
            per_file: HashMap::new(),
            submits: AtomicU32::new(0),
            polls: AtomicU32::new(0),
            next_id: AtomicU32::new(1),
            submit_attempts: Mutex::new(HashMap::new()),
            polls_by_job: Mutex::new(HashMap::new()),
            jobs: Mutex::new(HashMap::new()),
            cleaned_up: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Use `behavior` for files named `file_name`
    pub(crate) fn with_file(mut self, file_name: &str, behavior: FakeBehavior) -> Self {
        self.per_file.insert(file_name.to_string(), behavior);
        self
    }

    pub(crate) fn submits(&self) -> u32 {
        self.submits.load(Ordering::SeqCst)
    }

    pub(crate) fn polls(&self) -> u32 {
        self.polls.load(Ordering::SeqCst)
    }

    /// Most remote jobs that existed at the same time
    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn cleaned_up(&self) -> Vec<String> {
        self.cleaned_up.lock().unwrap().clone()
    }

    fn behavior_for(&self, path: &Path) -> (String, FakeBehavior) {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let behavior = self.per_file.get(&name).unwrap_or(&self.default).clone();
        (name, behavior)
    }

    fn job_behavior(&self, handle: &JobHandle) -> FakeBehavior {
        self.jobs
            .lock()
            .unwrap()
            .get(&handle.remote_id)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}

#[async_trait]
impl RemoteTranscoder for FakeTranscoder {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn verify(&self) -> Result<(), RemoteTranscodeError> {
        Ok(())
    }

    async fn submit(
        &self,
        local_path: &Path,
        settings: &TranscodeSettings,
    ) -> Result<JobHandle, RemoteTranscodeError> {
        self.submits.fetch_add(1, Ordering::SeqCst);
        let (name, behavior) = self.behavior_for(local_path);

        match &behavior {
            FakeBehavior::RejectSubmit(err) => return Err(err.clone()),
            FakeBehavior::FlakySubmit { failures, .. } => {
                let mut attempts = self.submit_attempts.lock().unwrap();
                let seen = attempts.entry(name.clone()).or_insert(0);
                *seen += 1;
                if *seen <= *failures {
                    return Err(RemoteTranscodeError::transient("503 Service Unavailable"));
                }
            }
            _ => {}
        }

        let id = format!("job-{}-{}", self.next_id.fetch_add(1, Ordering::SeqCst), name);
        self.jobs.lock().unwrap().insert(id.clone(), behavior);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Ok(JobHandle::new(id, local_path, settings))
    }

    async fn poll(&self, handle: &JobHandle) -> Result<PollStatus, RemoteTranscodeError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let seen = {
            let mut polls = self.polls_by_job.lock().unwrap();
            let seen = polls.entry(handle.remote_id.clone()).or_insert(0);
            *seen += 1;
            *seen
        };

        match self.job_behavior(handle) {
            FakeBehavior::StallPoll => std::future::pending::<()>().await,
            // let other files make progress between polls
            _ => tokio::task::yield_now().await,
        }

        Ok(match self.job_behavior(handle) {
            FakeBehavior::Encode { pending_polls, .. } if seen <= pending_polls => PollStatus::Pending,
            FakeBehavior::JobFails(reason) => PollStatus::Failed(reason),
            _ => PollStatus::Ready(format!("https://fake.invalid/{}", handle.remote_id)),
        })
    }

    async fn fetch(&self, handle: &JobHandle, dest_dir: &Path) -> Result<PathBuf, RemoteTranscodeError> {
        let size = match self.job_behavior(handle) {
            FakeBehavior::Encode { size, .. } | FakeBehavior::FlakySubmit { size, .. } => size,
            other => return Err(RemoteTranscodeError::permanent(format!("nothing to fetch for {:?}", other))),
        };
        std::fs::create_dir_all(dest_dir).map_err(|e| RemoteTranscodeError::transient(e.to_string()))?;
        let dest = download_path(dest_dir, &handle.local_path, &handle.settings.output_format);
        let file = std::fs::File::create(&dest).map_err(|e| RemoteTranscodeError::transient(e.to_string()))?;
        file.set_len(size)
            .map_err(|e| RemoteTranscodeError::transient(e.to_string()))?;
        Ok(dest)
    }

    async fn cleanup(&self, handle: &JobHandle) -> Result<(), RemoteTranscodeError> {
        self.cleaned_up.lock().unwrap().push(handle.remote_id.clone());
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}
