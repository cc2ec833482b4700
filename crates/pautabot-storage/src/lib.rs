//! Durable reconciliation state, run locking, raw payload archive and HTTP fetch
//! utilities for pautabot.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use pautabot_core::ReconciliationState;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pautabot-storage";

pub const STATE_FORMAT: &str = "pautabot-state";
pub const STATE_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state store {} is unavailable: {source}", .path.display())]
    Unavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("state store {} is corrupt: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("state store {} has format {format:?} v{version}; expected \"pautabot-state\" v1", .path.display())]
    UnsupportedFormat {
        path: PathBuf,
        format: String,
        version: u32,
    },
    #[error("state store {} already exists", .path.display())]
    AlreadyExists { path: PathBuf },
    #[error("writing state store {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serializing state: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error(
        "another cycle holds the run lock {}; if no pautabot process is running the lock is stale from an interrupted run and can be deleted",
        .path.display()
    )]
    Locked { path: PathBuf },
}

#[derive(Serialize)]
struct EnvelopeOut<'a> {
    format: &'a str,
    version: u32,
    state: &'a ReconciliationState,
}

#[derive(Deserialize)]
struct EnvelopeIn {
    format: String,
    version: u32,
    state: serde_json::Value,
}

/// Single-file store holding the versioned [`ReconciliationState`] envelope.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted state. A missing or unreadable store is an error; there is no
    /// implicit fresh start.
    pub async fn load(&self) -> Result<ReconciliationState, StoreError> {
        let bytes = fs::read(&self.path)
            .await
            .map_err(|source| StoreError::Unavailable {
                path: self.path.clone(),
                source,
            })?;
        let envelope: EnvelopeIn =
            serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
                path: self.path.clone(),
                source,
            })?;
        if envelope.format != STATE_FORMAT || envelope.version != STATE_VERSION {
            return Err(StoreError::UnsupportedFormat {
                path: self.path.clone(),
                format: envelope.format,
                version: envelope.version,
            });
        }
        serde_json::from_value(envelope.state).map_err(|source| StoreError::Corrupt {
            path: self.path.clone(),
            source,
        })
    }

    /// Write the state through a temp file in the same directory and rename it into place,
    /// so a crash mid-write leaves the previous store intact.
    pub async fn persist(&self, state: &ReconciliationState) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(&EnvelopeOut {
            format: STATE_FORMAT,
            version: STATE_VERSION,
            state,
        })?;
        let write_err = |source| StoreError::Write {
            path: self.path.clone(),
            source,
        };

        replace_file(&self.path, &bytes).await.map_err(write_err)?;
        debug!(path = %self.path.display(), bytes = bytes.len(), "state persisted");
        Ok(())
    }

    /// Create an empty store. Refuses to overwrite an existing one.
    pub async fn init(&self, now: DateTime<Utc>) -> Result<ReconciliationState, StoreError> {
        let exists = fs::try_exists(&self.path)
            .await
            .map_err(|source| StoreError::Unavailable {
                path: self.path.clone(),
                source,
            })?;
        if exists {
            return Err(StoreError::AlreadyExists {
                path: self.path.clone(),
            });
        }
        let state = ReconciliationState::empty(now);
        self.persist(&state).await?;
        Ok(state)
    }
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Write `bytes` to a hidden temp file beside `target`, fsync it and rename it over `target`.
/// Readers see either the old file or the complete new one.
async fn replace_file(target: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = parent_dir(target);
    fs::create_dir_all(&parent).await?;

    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "state".to_string());
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let result: std::io::Result<()> = async {
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp_path, target).await
    }
    .await;

    if result.is_err() {
        let _ = fs::remove_file(&temp_path).await;
    }
    result
}

/// Exclusive marker file next to the state store; released on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    pub fn lock_path_for(state_path: &Path) -> PathBuf {
        let mut name = state_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "state".into());
        name.push(".lock");
        state_path.with_file_name(name)
    }

    pub fn acquire(state_path: &Path) -> Result<Self, StoreError> {
        let path = Self::lock_path_for(state_path);
        let opened = std::fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path);
        match opened {
            Ok(mut file) => {
                use std::io::Write;
                let _ = writeln!(file, "pid={} at={}", std::process::id(), Utc::now().to_rfc3339());
                Ok(Self { path })
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Err(StoreError::Locked { path }),
            Err(source) => Err(StoreError::Write { path, source }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %err, "failed to release run lock");
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArchivedPayload {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Hash-addressed archive of raw feed bodies, one directory per cycle.
#[derive(Debug, Clone)]
pub struct PayloadArchive {
    root: PathBuf,
}

impl PayloadArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn relative_path(&self, fetched_at: DateTime<Utc>, feed: &str, content_hash: &str) -> PathBuf {
        let stamp = fetched_at.format("%Y%m%d_%H%M%S").to_string();
        PathBuf::from(stamp)
            .join(feed)
            .join(format!("{content_hash}.json"))
    }

    pub async fn store(
        &self,
        fetched_at: DateTime<Utc>,
        feed: &str,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedPayload> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.relative_path(fetched_at, feed, &content_hash);
        let absolute_path = self.root.join(&relative_path);

        // Same stamp, same feed, same hash: the body is already on disk.
        let deduplicated = fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?;
        if !deduplicated {
            replace_file(&absolute_path, bytes)
                .await
                .with_context(|| format!("archiving {feed} payload to {}", absolute_path.display()))?;
        }

        Ok(ArchivedPayload {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
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

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// GET-only fetcher with bounded retries for idempotent reads. Requests are issued one at
/// a time by the caller; there is no internal concurrency.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
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
            backoff: config.backoff,
        })
    }

    /// Underlying client, for non-idempotent calls that must not go through the retry loop.
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub async fn fetch_bytes(&self, feed: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", feed, url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            let (err, disposition) = match self.get_once(url).await {
                Ok(response) => return Ok(response),
                Err(failure) => failure,
            };
            if disposition == RetryDisposition::NonRetryable || attempt >= self.backoff.max_retries {
                return Err(err);
            }
            warn!(error = %err, attempt, "retrying feed request");
            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
            attempt += 1;
        }
    }

    async fn get_once(&self, url: &str) -> Result<FetchedResponse, (FetchError, RetryDisposition)> {
        let resp = match self.client.get(url).send().await {
            Ok(resp) => resp,
            Err(err) => {
                let disposition = classify_reqwest_error(&err);
                return Err((FetchError::Request(err), disposition));
            }
        };
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            let err = FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            };
            return Err((err, classify_status(status)));
        }
        // A body cut off mid-read is worth another attempt like any transport error.
        let body = resp
            .bytes()
            .await
            .map_err(|err| (FetchError::Request(err), RetryDisposition::Retryable))?
            .to_vec();
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }
}
