//! Dataset persistence + HTTP fetch utilities for tajrobe.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::header::{HeaderValue, RETRY_AFTER};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tajrobe_core::{validate_dataset, Company, InvariantViolation};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "tajrobe-storage";

pub const DATASET_FILE: &str = "data.json";
pub const PROGRESS_FILE: &str = "progress.json";
pub const BACKUPS_DIR: &str = "backups";

/// Same-millisecond backups get a `-N` suffix, up to this many.
const MAX_BACKUP_COLLISIONS: usize = 100;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{} is not a list of company records", path.display())]
    InvalidShape {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{} violates a dataset invariant", path.display())]
    Invariant {
        path: PathBuf,
        #[source]
        source: InvariantViolation,
    },
    #[error("serializing {what}")]
    Serialize {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl DatasetError {
    fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Dataset as read at the start of a run.
#[derive(Debug, Clone)]
pub struct LoadedDataset {
    pub companies: Vec<Company>,
    /// Exact file bytes, `None` when no dataset existed yet.
    pub raw: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct BackupRecord {
    pub path: PathBuf,
    pub sha256: String,
    pub byte_size: usize,
}

/// Informational progress record written after every batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressCheckpoint {
    pub last_processed_batch: usize,
    pub total_batches: usize,
    pub processed_reviews: usize,
    pub total_reviews: usize,
    pub last_update: DateTime<Utc>,
}

/// Owns the on-disk layout: dataset file, progress file and backups directory.
#[derive(Debug, Clone)]
pub struct DatasetStore {
    root: PathBuf,
}

impl DatasetStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn dataset_path(&self) -> PathBuf {
        self.root.join(DATASET_FILE)
    }

    pub fn progress_path(&self) -> PathBuf {
        self.root.join(PROGRESS_FILE)
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.root.join(BACKUPS_DIR)
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Read and validate the dataset. A missing file is an empty dataset.
    pub async fn load(&self) -> Result<LoadedDataset, DatasetError> {
        let path = self.dataset_path();
        let raw = match fs::read(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(LoadedDataset {
                    companies: Vec::new(),
                    raw: None,
                });
            }
            Err(err) => return Err(DatasetError::io(format!("reading {}", path.display()), err)),
        };

        let companies: Vec<Company> =
            serde_json::from_slice(&raw).map_err(|source| DatasetError::InvalidShape {
                path: path.clone(),
                source,
            })?;
        validate_dataset(&companies).map_err(|source| DatasetError::Invariant {
            path: path.clone(),
            source,
        })?;

        Ok(LoadedDataset {
            companies,
            raw: Some(raw),
        })
    }

    /// Write a write-once copy of `raw` into the backups directory. Existing backups are never overwritten.
    pub async fn write_backup(
        &self,
        raw: &[u8],
        taken_at: DateTime<Utc>,
    ) -> Result<BackupRecord, DatasetError> {
        let dir = self.backups_dir();
        fs::create_dir_all(&dir)
            .await
            .map_err(|err| DatasetError::io(format!("creating {}", dir.display()), err))?;

        let base_name = backup_file_name(taken_at);
        let mut collisions = 0usize;
        let (path, mut file) = loop {
            let name = match collisions {
                0 => base_name.clone(),
                n => base_name.replacen(".json", &format!("-{n}.json"), 1),
            };
            let path = dir.join(name);
            match fs::OpenOptions::new().create_new(true).write(true).open(&path).await {
                Ok(file) => break (path, file),
                Err(err)
                    if err.kind() == std::io::ErrorKind::AlreadyExists
                        && collisions < MAX_BACKUP_COLLISIONS =>
                {
                    collisions += 1;
                }
                Err(err) => {
                    return Err(DatasetError::io(format!("opening backup {}", path.display()), err))
                }
            }
        };
        file.write_all(raw)
            .await
            .map_err(|err| DatasetError::io(format!("writing backup {}", path.display()), err))?;
        file.sync_all()
            .await
            .map_err(|err| DatasetError::io(format!("syncing backup {}", path.display()), err))?;

        Ok(BackupRecord {
            path,
            sha256: Self::sha256_hex(raw),
            byte_size: raw.len(),
        })
    }

    /// Serialize the dataset and atomically replace the dataset file.
    pub async fn persist(&self, companies: &[Company]) -> Result<usize, DatasetError> {
        let bytes = serde_json::to_vec_pretty(companies).map_err(|source| DatasetError::Serialize {
            what: "dataset",
            source,
        })?;
        let staged = StagedWrite::stage(self.dataset_path(), &bytes).await?;
        staged.commit().await?;
        Ok(bytes.len())
    }

    /// Overwrite the progress file in place; callers treat failures as non-fatal.
    pub async fn write_checkpoint(&self, checkpoint: &ProgressCheckpoint) -> Result<(), DatasetError> {
        let bytes = serde_json::to_vec_pretty(checkpoint).map_err(|source| DatasetError::Serialize {
            what: "progress checkpoint",
            source,
        })?;
        let path = self.progress_path();
        fs::write(&path, bytes)
            .await
            .map_err(|err| DatasetError::io(format!("writing {}", path.display()), err))
    }
}

/// `data-backup-<ISO timestamp>.json` with `:` and `.` replaced by `-`.
pub fn backup_file_name(taken_at: DateTime<Utc>) -> String {
    let stamp = taken_at
        .to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace([':', '.'], "-");
    format!("data-backup-{stamp}.json")
}

/// Bytes written to a temp file next to `target`, not yet visible under `target`.
///
/// Dropping an uncommitted write removes the temp file and leaves `target` untouched.
#[derive(Debug)]
pub struct StagedWrite {
    temp_path: PathBuf,
    target: PathBuf,
    committed: bool,
}

impl StagedWrite {
    pub async fn stage(target: impl Into<PathBuf>, bytes: &[u8]) -> Result<Self, DatasetError> {
        let target = target.into();
        let parent = match target.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)
            .await
            .map_err(|err| DatasetError::io(format!("creating {}", parent.display()), err))?;

        let file_name = target
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "dataset".to_string());
        let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

        // Constructed before the first write so a failed write still cleans up.
        let staged = Self {
            temp_path,
            target,
            committed: false,
        };

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&staged.temp_path)
            .await
            .map_err(|err| {
                DatasetError::io(format!("opening temp file {}", staged.temp_path.display()), err)
            })?;
        file.write_all(bytes).await.map_err(|err| {
            DatasetError::io(format!("writing temp file {}", staged.temp_path.display()), err)
        })?;
        file.flush().await.map_err(|err| {
            DatasetError::io(format!("flushing temp file {}", staged.temp_path.display()), err)
        })?;
        file.sync_all().await.map_err(|err| {
            DatasetError::io(format!("syncing temp file {}", staged.temp_path.display()), err)
        })?;

        Ok(staged)
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    pub async fn commit(mut self) -> Result<(), DatasetError> {
        fs::rename(&self.temp_path, &self.target).await.map_err(|err| {
            DatasetError::io(
                format!(
                    "atomically renaming {} -> {}",
                    self.temp_path.display(),
                    self.target.display()
                ),
                err,
            )
        })?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for StagedWrite {
    fn drop(&mut self) {
        if !self.committed {
            let _ = std::fs::remove_file(&self.temp_path);
        }
    }
}

/// Atomically replace `target` with `bytes`.
pub async fn write_atomic(target: impl Into<PathBuf>, bytes: &[u8]) -> Result<(), DatasetError> {
    StagedWrite::stage(target, bytes).await?.commit().await
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    /// 429: wait for the server-specified interval, then retry.
    RateLimited,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::RateLimited
    } else if status.is_server_error() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// `Retry-After` in seconds; falls back to `default` when missing, not numeric or out of range.
pub fn parse_retry_after(header: Option<&HeaderValue>, default: Duration) -> Duration {
    header
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<f64>().ok())
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .unwrap_or(default)
}

/// Explicit retry policy consulted for every request made by [`HttpFetcher`].
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Wait applied to a 429 that carries no usable `Retry-After`.
    pub rate_limit_default: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(10),
            rate_limit_default: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    /// Wait before the next attempt, or `None` to give up.
    ///
    /// `attempt_index` is zero-based: the first request is attempt 0.
    pub fn next_delay(
        &self,
        attempt_index: usize,
        disposition: RetryDisposition,
        retry_after: Option<Duration>,
    ) -> Option<Duration> {
        if attempt_index + 1 >= self.max_attempts.max(1) {
            return None;
        }
        match disposition {
            RetryDisposition::Retryable => Some(self.delay_for_attempt(attempt_index)),
            RetryDisposition::RateLimited => Some(retry_after.unwrap_or(self.rate_limit_default)),
            RetryDisposition::NonRetryable => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub concurrency: usize,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            concurrency: 1,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// Response body of a 2xx answer.
    Found(Vec<u8>),
    /// The server answered 404; the resource does not exist.
    NotFound,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed after {attempts} attempt(s)")]
    Request {
        url: String,
        attempts: usize,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url} after {attempts} attempt(s)")]
    HttpStatus {
        status: u16,
        url: String,
        attempts: usize,
    },
    #[error("request limiter closed")]
    LimiterClosed,
}

/// Rate-limited, retrying GET client shared by every remote source.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limiter: Arc<Semaphore>,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            limiter: Arc::new(Semaphore::new(config.concurrency.max(1))),
            retry: config.retry,
        })
    }

    pub async fn fetch(&self, url: &str) -> Result<FetchOutcome, FetchError> {
        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| FetchError::LimiterClosed)?;

        let span = info_span!("http_fetch", url);
        self.fetch_with_retry(url).instrument(span).await
    }

    async fn fetch_with_retry(&self, url: &str) -> Result<FetchOutcome, FetchError> {
        let mut attempt = 0usize;
        loop {
            let failure = match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();

                    if status == StatusCode::NOT_FOUND {
                        return Ok(FetchOutcome::NotFound);
                    }

                    if status.is_success() {
                        match resp.bytes().await {
                            Ok(body) => return Ok(FetchOutcome::Found(body.to_vec())),
                            Err(err) => {
                                let disposition = classify_reqwest_error(&err);
                                (disposition, None, FetchError::Request {
                                    url: url.to_string(),
                                    attempts: attempt + 1,
                                    source: err,
                                })
                            }
                        }
                    } else {
                        let disposition = classify_status(status);
                        let retry_after = (disposition == RetryDisposition::RateLimited).then(|| {
                            parse_retry_after(
                                resp.headers().get(RETRY_AFTER),
                                self.retry.rate_limit_default,
                            )
                        });
                        (disposition, retry_after, FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: url.to_string(),
                            attempts: attempt + 1,
                        })
                    }
                }
                Err(err) => (classify_reqwest_error(&err), None, FetchError::Request {
                    url: url.to_string(),
                    attempts: attempt + 1,
                    source: err,
                }),
            };
            let (disposition, retry_after, error) = failure;

            let Some(wait) = self.retry.next_delay(attempt, disposition, retry_after) else {
                return Err(error);
            };
            if disposition == RetryDisposition::RateLimited {
                warn!(attempt, wait_ms = wait.as_millis() as u64, "rate limited; waiting before retry");
            } else {
                debug!(attempt, wait_ms = wait.as_millis() as u64, error = ?error, "retrying request");
            }
            tokio::time::sleep(wait).await;
            attempt += 1;
        }
    }
}
