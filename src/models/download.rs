//! Model artifact acquisition
//!
//! Downloads every required file of a model into a private staging directory,
//! validates it, and only then renames the files into the model directory.
//! Transient transport failures are retried with exponential backoff; a
//! reader of the model directory never sees a half-written artifact.

use super::descriptor::{ModelDescriptor, ModelKey};
use super::store::{ArtifactStore, STAGING_PREFIX};
use crate::metrics;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Errors from a single fetch attempt
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP {status} from {url}")]
    Status { url: String, status: u16 },

    #[error("transport error fetching {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("failed writing {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Other(String),
}

/// Unrecoverable acquisition failures
#[derive(Debug, Error)]
pub enum AcquisitionError {
    #[error("downloading {file} failed after {attempts} attempts: {source}")]
    Download {
        file: String,
        attempts: u32,
        #[source]
        source: FetchError,
    },

    #[error("{path:?} is {size} bytes, expected more than {min}")]
    Integrity { path: PathBuf, size: u64, min: u64 },

    #[error("storage error at {path:?}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl AcquisitionError {
    fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        AcquisitionError::Storage {
            path: path.into(),
            source,
        }
    }
}

/// Transport used to pull one remote file onto local disk
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Write the body of `url` to `dest`, returning the number of bytes written
    async fn fetch(&self, url: &str, dest: &Path) -> Result<u64, FetchError>;
}

/// Streaming HTTP fetcher
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    /// Client with explicit connect and read timeouts
    pub fn new(connect_timeout: Duration, read_timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .read_timeout(read_timeout)
            .user_agent(concat!("model-keeper/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<u64, FetchError> {
        let transport = |source| FetchError::Transport {
            url: url.to_string(),
            source,
        };
        let io = |source| FetchError::Io {
            path: dest.to_path_buf(),
            source,
        };

        let response = self.client.get(url).send().await.map_err(transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let mut file = tokio::fs::File::create(dest).await.map_err(io)?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(transport)?;
            file.write_all(&chunk).await.map_err(io)?;
            written += chunk.len() as u64;
        }

        file.flush().await.map_err(io)?;
        file.sync_all().await.map_err(io)?;

        Ok(written)
    }
}

/// Retry budget and backoff schedule for one file
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts per file, including the first
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    pub initial_backoff: Duration,
    /// Multiplier applied after every failure
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    fn next_backoff(&self, current: Duration) -> Duration {
        Duration::from_secs_f64(current.as_secs_f64() * self.backoff_multiplier)
    }

    /// Delays slept between attempts, in order
    pub fn schedule(&self) -> Vec<Duration> {
        let mut delays = Vec::new();
        let mut delay = self.initial_backoff;
        for _ in 1..self.max_attempts.max(1) {
            delays.push(delay);
            delay = self.next_backoff(delay);
        }
        delays
    }
}

/// What `acquire` had to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// Every file was already on disk
    AlreadyPresent,
    /// These files were downloaded and promoted
    Downloaded { files: Vec<String>, bytes: u64 },
}

/// State of one in-flight acquisition
///
/// Owns the staging directory; dropping the job removes it.
struct DownloadJob<'a> {
    descriptor: &'a ModelDescriptor,
    staging: TempDir,
    pending: VecDeque<String>,
    staged: Vec<(String, u64)>,
    attempt: u32,
    backoff: Duration,
}

impl<'a> DownloadJob<'a> {
    fn new(
        descriptor: &'a ModelDescriptor,
        pending: Vec<String>,
        policy: &RetryPolicy,
    ) -> Result<Self, AcquisitionError> {
        let model_dir = descriptor.model_dir();
        let staging = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(&model_dir)
            .map_err(|e| AcquisitionError::storage(&model_dir, e))?;

        Ok(Self {
            descriptor,
            staging,
            pending: pending.into(),
            staged: Vec::new(),
            attempt: 0,
            backoff: policy.initial_backoff,
        })
    }

    fn staging_path(&self, file: &str) -> PathBuf {
        self.staging.path().join(file)
    }

    fn next_file(&mut self, policy: &RetryPolicy) -> Option<String> {
        self.attempt = 0;
        self.backoff = policy.initial_backoff;
        self.pending.pop_front()
    }

    /// Returns the delay to sleep before the next attempt
    fn record_failure(&mut self, policy: &RetryPolicy) -> Duration {
        let delay = self.backoff;
        self.backoff = policy.next_backoff(self.backoff);
        delay
    }

    fn staged_bytes(&self) -> u64 {
        self.staged.iter().map(|(_, bytes)| bytes).sum()
    }

    /// Remove the staging directory, logging instead of failing
    fn cleanup(self) {
        let path = self.staging.path().to_path_buf();
        if let Err(e) = self.staging.close() {
            tracing::warn!(path = ?path, error = %e, "Failed to remove staging directory");
        }
    }
}

/// Why one attempt did not produce a usable file
enum AttemptFailure {
    Fetch(FetchError),
    TooSmall(u64),
}

/// Downloads model artifacts into an [`ArtifactStore`]
///
/// At most one acquisition per model runs at a time; staging directories are
/// only swept while holding that model's lock.
pub struct Acquirer {
    store: ArtifactStore,
    fetcher: Arc<dyn Fetcher>,
    policy: RetryPolicy,
    locks: DashMap<ModelKey, Arc<Mutex<()>>>,
}

impl Acquirer {
    pub fn new(store: ArtifactStore, fetcher: Arc<dyn Fetcher>, policy: RetryPolicy) -> Self {
        Self {
            store,
            fetcher,
            policy,
            locks: DashMap::new(),
        }
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Make sure every required file of `desc` is on disk
    ///
    /// Plausible weights already on disk are never re-downloaded. Implausibly
    /// small weights are moved aside to a fresh `<weights>.backup*` name first.
    /// Concurrent calls for the same model are serialized; a caller that waited
    /// on another's download finds the files present.
    pub async fn acquire(&self, desc: &ModelDescriptor) -> Result<AcquireOutcome, AcquisitionError> {
        if self.store.missing_files(desc).is_empty() {
            tracing::debug!(model = %desc.key(), "Artifacts already present");
            return Ok(AcquireOutcome::AlreadyPresent);
        }

        let lock = self.locks.entry(desc.key()).or_default().clone();
        let _guard = lock.lock().await;

        let missing = self.store.missing_files(desc);
        if missing.is_empty() {
            tracing::debug!(model = %desc.key(), "Artifacts acquired by a concurrent caller");
            return Ok(AcquireOutcome::AlreadyPresent);
        }

        let model_dir = desc.model_dir();
        tokio::fs::create_dir_all(&model_dir)
            .await
            .map_err(|e| AcquisitionError::storage(&model_dir, e))?;

        let stale = self.store.sweep_stale_staging(desc);
        if stale > 0 {
            tracing::info!(model = %desc.key(), removed = stale, "Removed stale staging directories");
        }

        self.backup_implausible_weights(desc).await?;

        tracing::info!(
            model = %desc.key(),
            files = ?missing,
            "Starting artifact download"
        );

        let mut job = DownloadJob::new(desc, missing, &self.policy)?;
        let result = self.run_job(&mut job).await;
        job.cleanup();

        match &result {
            Ok(AcquireOutcome::Downloaded { files, bytes }) => {
                tracing::info!(model = %desc.key(), files = ?files, bytes = bytes, "Artifacts acquired");
            }
            Ok(AcquireOutcome::AlreadyPresent) => {}
            Err(e) => {
                tracing::error!(model = %desc.key(), error = %e, "Artifact acquisition failed");
                metrics::record_acquisition_failure(&desc.key().to_string());
            }
        }

        result
    }

    async fn backup_implausible_weights(&self, desc: &ModelDescriptor) -> Result<(), AcquisitionError> {
        let weights = desc.weights_path();
        let Some(size) = self.store.file_size(&weights) else {
            return Ok(());
        };
        if self.store.is_plausible_size(size) {
            return Ok(());
        }

        let backup = self.store.next_backup_path(desc);
        tracing::warn!(
            model = %desc.key(),
            size = size,
            min = self.store.min_plausible_size(),
            backup = ?backup,
            "Weights file implausibly small, moving aside"
        );
        tokio::fs::rename(&weights, &backup)
            .await
            .map_err(|e| AcquisitionError::storage(&weights, e))
    }

    async fn run_job(&self, job: &mut DownloadJob<'_>) -> Result<AcquireOutcome, AcquisitionError> {
        while let Some(file) = job.next_file(&self.policy) {
            let bytes = self.download_with_retry(job, &file).await?;
            job.staged.push((file, bytes));
        }

        self.promote(job).await?;

        Ok(AcquireOutcome::Downloaded {
            files: job.staged.iter().map(|(f, _)| f.clone()).collect(),
            bytes: job.staged_bytes(),
        })
    }

    async fn download_with_retry(
        &self,
        job: &mut DownloadJob<'_>,
        file: &str,
    ) -> Result<u64, AcquisitionError> {
        let desc = job.descriptor;
        let model = desc.key().to_string();
        let url = desc.file_url(file);
        let dest = job.staging_path(file);

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AcquisitionError::storage(parent, e))?;
        }

        loop {
            job.attempt += 1;
            metrics::record_download_attempt(&model, file);

            tracing::debug!(model = %model, file = %file, attempt = job.attempt, "Fetching artifact");

            let failure = match self.fetcher.fetch(&url, &dest).await {
                Ok(_) => {
                    let size = self.store.file_size(&dest).unwrap_or(0);
                    if desc.is_weights(file) && !self.store.is_plausible_size(size) {
                        AttemptFailure::TooSmall(size)
                    } else {
                        metrics::record_bytes_downloaded(&model, size);
                        return Ok(size);
                    }
                }
                Err(e) => AttemptFailure::Fetch(e),
            };

            // Never keep a partial or rejected body around for the next attempt
            if dest.exists() {
                let _ = tokio::fs::remove_file(&dest).await;
            }
            metrics::record_download_failure(&model, file);

            if job.attempt >= self.policy.max_attempts {
                return Err(match failure {
                    AttemptFailure::Fetch(source) => AcquisitionError::Download {
                        file: file.to_string(),
                        attempts: job.attempt,
                        source,
                    },
                    AttemptFailure::TooSmall(size) => AcquisitionError::Integrity {
                        path: desc.file_path(file),
                        size,
                        min: self.store.min_plausible_size(),
                    },
                });
            }

            let delay = job.record_failure(&self.policy);
            match &failure {
                AttemptFailure::Fetch(e) => tracing::warn!(
                    model = %model,
                    file = %file,
                    attempt = job.attempt,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "Download attempt failed, retrying"
                ),
                AttemptFailure::TooSmall(size) => tracing::warn!(
                    model = %model,
                    file = %file,
                    attempt = job.attempt,
                    size = size,
                    delay_ms = delay.as_millis() as u64,
                    "Downloaded weights implausibly small, retrying"
                ),
            }
            tokio::time::sleep(delay).await;
        }
    }

    /// Rename staged files into the model directory
    ///
    /// If any rename fails, files already promoted by this job are removed so
    /// the model directory never mixes old and new artifacts.
    async fn promote(&self, job: &DownloadJob<'_>) -> Result<(), AcquisitionError> {
        let mut promoted: Vec<PathBuf> = Vec::new();

        for (file, _) in &job.staged {
            let from = job.staging_path(file);
            let to = job.descriptor.file_path(file);

            let result = async {
                if let Some(parent) = to.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::rename(&from, &to).await
            }
            .await;

            if let Err(e) = result {
                tracing::error!(file = %file, error = %e, "Promotion failed, rolling back");
                for path in &promoted {
                    if let Err(e) = tokio::fs::remove_file(path).await {
                        tracing::warn!(path = ?path, error = %e, "Failed to roll back promoted file");
                    }
                }
                return Err(AcquisitionError::storage(to, e));
            }

            promoted.push(to);
        }

        Ok(())
    }
}
