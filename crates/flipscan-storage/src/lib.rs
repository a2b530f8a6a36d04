//! Persistent state, picture archive and HTTP fetch utilities for flipscan.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

mod dedup;

pub use dedup::{is_contention, DedupStore, StoreError, StoreOptions};

pub const CRATE_NAME: &str = "flipscan-storage";

#[derive(Debug, Clone)]
pub struct ArchivedPicture {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Hash-addressed store for downloaded listing pictures.
#[derive(Debug, Clone)]
pub struct PictureArchive {
    root: PathBuf,
}

impl PictureArchive {
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

    pub fn picture_relative_path(
        &self,
        fetched_at: DateTime<Utc>,
        site: &str,
        external_id: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let day = fetched_at.format("%Y%m%d").to_string();
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "jpg" } else { ext };
        let short_hash = &content_hash[..content_hash.len().min(12)];
        PathBuf::from(day)
            .join(site)
            .join(format!("{external_id}-{short_hash}.{ext}"))
    }

    /// Writes through a temp file + rename so readers never observe partial images.
    pub async fn store_picture(
        &self,
        fetched_at: DateTime<Utc>,
        site: &str,
        external_id: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedPicture> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path =
            self.picture_relative_path(fetched_at, site, external_id, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating picture directory {}", parent.display()))?;

        let archived = |deduplicated| ArchivedPicture {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking picture path {}", absolute_path.display()))?
        {
            return Ok(archived(true));
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp picture file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp picture file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp picture file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(archived(false)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(archived(true))
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "renaming temp picture {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
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
    /// Policy for SQLite lock contention: many short waits.
    pub fn store_contention() -> Self {
        Self {
            max_retries: 8,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    /// Uniformly random delay in `[d/2, d]` where `d` is the capped exponential delay.
    pub fn jittered_delay(&self, attempt_index: usize) -> Duration {
        let ceiling = self.delay_for_attempt(attempt_index).as_millis() as u64;
        if ceiling == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(ceiling / 2..=ceiling))
    }
}

#[derive(Debug)]
pub enum RetryError<E> {
    Exhausted { attempts: usize, last: E },
    Fatal(E),
}

/// Runs `op` until it succeeds, fails with a non-transient error, or the policy is spent.
pub async fn retry_transient<T, E, F, Fut, C>(
    policy: &BackoffPolicy,
    label: &str,
    is_transient: C,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt = 0usize;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if is_transient(&err) => {
                attempt += 1;
                if attempt > policy.max_retries {
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: err,
                    });
                }
                let delay = policy.jittered_delay(attempt - 1);
                warn!(
                    label,
                    attempt,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient failure; retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(RetryError::Fatal(err)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Opaque egress proxy, applied to every request.
    pub proxy_url: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            proxy_url: None,
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

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("empty response body from {url}")]
    EmptyBody { url: String },
}

fn is_transient_fetch(err: &FetchError) -> bool {
    let disposition = match err {
        FetchError::Request(err) => classify_reqwest_error(err),
        FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
            .map(classify_status)
            .unwrap_or(RetryDisposition::NonRetryable),
        FetchError::EmptyBody { .. } => RetryDisposition::NonRetryable,
    };
    disposition == RetryDisposition::Retryable
}

async fn send_once(request: reqwest::RequestBuilder) -> Result<FetchedResponse, FetchError> {
    let resp = request.send().await?;
    let status = resp.status();
    let final_url = resp.url().to_string();
    if !status.is_success() {
        return Err(FetchError::HttpStatus {
            status: status.as_u16(),
            url: final_url,
        });
    }
    let body = resp.bytes().await?.to_vec();
    debug!(%status, bytes = body.len(), "fetched");
    Ok(FetchedResponse {
        status,
        final_url,
        body,
    })
}

/// Outbound page access used by the marketplace adapters.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn get_text(&self, url: &str) -> Result<String, FetchError>;

    async fn get_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError>;

    async fn post_form(&self, url: &str, fields: &[(&str, &str)]) -> Result<String, FetchError>;
}

#[derive(Debug)]
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

        if let Some(proxy_url) = &config.proxy_url {
            let proxy = reqwest::Proxy::all(proxy_url)
                .with_context(|| format!("parsing proxy url {proxy_url}"))?;
            builder = builder.proxy(proxy);
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    async fn send_with_retry<F>(&self, url: &str, build: F) -> Result<FetchedResponse, FetchError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let span = info_span!("http_fetch", url);
        let attempt = || send_once(build(&self.client));
        match retry_transient(&self.backoff, url, is_transient_fetch, attempt)
            .instrument(span)
            .await
        {
            Ok(resp) => Ok(resp),
            Err(RetryError::Exhausted { last, .. }) | Err(RetryError::Fatal(last)) => Err(last),
        }
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        self.send_with_retry(url, |client| client.get(url)).await
    }
}

#[async_trait]
impl PageSource for HttpFetcher {
    async fn get_text(&self, url: &str) -> Result<String, FetchError> {
        let resp = self.fetch_bytes(url).await?;
        if resp.body.is_empty() {
            return Err(FetchError::EmptyBody { url: resp.final_url });
        }
        Ok(resp.text())
    }

    async fn get_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let resp = self.fetch_bytes(url).await?;
        if resp.body.is_empty() {
            return Err(FetchError::EmptyBody { url: resp.final_url });
        }
        Ok(resp.body)
    }

    async fn post_form(&self, url: &str, fields: &[(&str, &str)]) -> Result<String, FetchError> {
        let resp = self
            .send_with_retry(url, |client| client.post(url).form(fields))
            .await?;
        Ok(resp.text())
    }
}
