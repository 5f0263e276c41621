//! HTTP fetch utilities and the latest-snapshot cache for the briefing.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Method, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub use reqwest::Url;

pub const CRATE_NAME: &str = "mrb-storage";

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
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

/// Exponential backoff: `base_delay * 2^attempt`, capped at `max_delay`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
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
    pub bearer_token: Option<String>,
    pub max_in_flight: usize,
    pub backoff: BackoffPolicy,
    pub rate_limit: Option<RateLimitConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            bearer_token: None,
            max_in_flight: 10,
            backoff: BackoffPolicy::default(),
            rate_limit: None,
        }
    }
}

/// Request budget refilled one token per `refill_every`, up to `capacity`.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

#[derive(Debug)]
struct RateLimiter {
    config: RateLimitConfig,
    state: AsyncMutex<(u32, Instant)>,
}

impl RateLimiter {
    fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            state: AsyncMutex::new((config.capacity, Instant::now())),
        }
    }

    async fn acquire(&self) {
        let refill_ms = self.config.refill_every.as_millis();
        loop {
            let mut state = self.state.lock().await;
            let (tokens, last_refill) = &mut *state;
            if refill_ms > 0 {
                let refills = (last_refill.elapsed().as_millis() / refill_ms) as u32;
                if refills > 0 {
                    *tokens = tokens.saturating_add(refills).min(self.config.capacity);
                    *last_refill = Instant::now();
                }
            }
            if *tokens > 0 {
                *tokens -= 1;
                return;
            }
            drop(state);
            tokio::time::sleep(self.config.refill_every).await;
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("malformed response body from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::Request(err) => classify_reqwest_error(err),
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            FetchError::Decode { .. } => RetryDisposition::NonRetryable,
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
    pub fn json(&self) -> Result<JsonValue, FetchError> {
        serde_json::from_slice(&self.body).map_err(|source| FetchError::Decode {
            url: self.final_url.clone(),
            source,
        })
    }
}

/// Shared client with an in-flight cap, optional rate limit and retry/backoff.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    in_flight: Arc<Semaphore>,
    rate_limit: Option<RateLimiter>,
    bearer_token: Option<String>,
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
            in_flight: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            rate_limit: config.rate_limit.map(RateLimiter::new),
            bearer_token: config.bearer_token,
            backoff: config.backoff,
        })
    }

    pub async fn get_json(&self, url: &str) -> Result<JsonValue, FetchError> {
        self.send(Method::GET, url, None).await?.json()
    }

    pub async fn post_json(&self, url: &str, body: &JsonValue) -> Result<JsonValue, FetchError> {
        self.send(Method::POST, url, Some(body)).await?.json()
    }

    pub async fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<&JsonValue>,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %method, url);
        self.send_with_retry(method, url, body).instrument(span).await
    }

    async fn send_with_retry(
        &self,
        method: Method,
        url: &str,
        body: Option<&JsonValue>,
    ) -> Result<FetchedResponse, FetchError> {
        let _permit = self
            .in_flight
            .acquire()
            .await
            .expect("in-flight semaphore is never closed");

        let mut attempt = 0;
        loop {
            if let Some(limiter) = &self.rate_limit {
                limiter.acquire().await;
            }

            match self.send_once(method.clone(), url, body).await {
                Ok(resp) => return Ok(resp),
                Err(err)
                    if err.disposition() == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries =>
                {
                    let delay = self.backoff.delay_for_attempt(attempt);
                    debug!(attempt, ?delay, error = %err, "retrying request");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn send_once(
        &self,
        method: Method,
        url: &str,
        body: Option<&JsonValue>,
    ) -> Result<FetchedResponse, FetchError> {
        let mut request = self.client.request(method, url);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

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
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }
}

// ---------------------------------------------------------------------------
// Snapshot cache
// ---------------------------------------------------------------------------

/// The two string slots the snapshot cache owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheSlot {
    Dataset,
    Timestamp,
}

impl CacheSlot {
    pub const ALL: [CacheSlot; 2] = [CacheSlot::Dataset, CacheSlot::Timestamp];

    pub fn key(&self) -> &'static str {
        match self {
            CacheSlot::Dataset => "mrb.snapshot.data",
            CacheSlot::Timestamp => "mrb.snapshot.timestamp",
        }
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cache serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("cache lock poisoned")]
    Poisoned,
}

/// Durable string storage behind the snapshot cache. Synchronous by contract.
pub trait CacheStore: Send + Sync {
    fn get(&self, slot: CacheSlot) -> Result<Option<String>, CacheError>;
    fn set(&self, slot: CacheSlot, value: &str) -> Result<(), CacheError>;
    fn clear(&self) -> Result<(), CacheError>;
}

/// One file per slot under `root`, replaced atomically via temp-file rename.
#[derive(Debug, Clone)]
pub struct FileCacheStore {
    root: PathBuf,
}

impl FileCacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn slot_path(&self, slot: CacheSlot) -> PathBuf {
        self.root.join(slot.key())
    }

    fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> CacheError + '_ {
        move |source| CacheError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl CacheStore for FileCacheStore {
    fn get(&self, slot: CacheSlot) -> Result<Option<String>, CacheError> {
        let path = self.slot_path(slot);
        match fs::read_to_string(&path) {
            Ok(text) => Ok(Some(text)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(Self::io_err(&path)(err)),
        }
    }

    fn set(&self, slot: CacheSlot, value: &str) -> Result<(), CacheError> {
        fs::create_dir_all(&self.root).map_err(Self::io_err(&self.root))?;
        let path = self.slot_path(slot);
        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", slot.key(), Uuid::new_v4()));

        let write = || -> std::io::Result<()> {
            let mut file = fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&temp_path)?;
            file.write_all(value.as_bytes())?;
            file.sync_all()?;
            fs::rename(&temp_path, &path)
        };

        write().map_err(|err| {
            let _ = fs::remove_file(&temp_path);
            Self::io_err(&path)(err)
        })
    }

    fn clear(&self) -> Result<(), CacheError> {
        for slot in CacheSlot::ALL {
            let path = self.slot_path(slot);
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(Self::io_err(&path)(err)),
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    slots: Mutex<HashMap<CacheSlot, String>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheStore for MemoryCacheStore {
    fn get(&self, slot: CacheSlot) -> Result<Option<String>, CacheError> {
        let slots = self.slots.lock().map_err(|_| CacheError::Poisoned)?;
        Ok(slots.get(&slot).cloned())
    }

    fn set(&self, slot: CacheSlot, value: &str) -> Result<(), CacheError> {
        let mut slots = self.slots.lock().map_err(|_| CacheError::Poisoned)?;
        slots.insert(slot, value.to_string());
        Ok(())
    }

    fn clear(&self) -> Result<(), CacheError> {
        self.slots.lock().map_err(|_| CacheError::Poisoned)?.clear();
        Ok(())
    }
}

/// Last good dataset with the exact ISO-8601 string it was stored under.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedSnapshot<T> {
    pub dataset: T,
    pub cached_at: String,
}

/// Write dataset then timestamp; returns the stored timestamp.
pub fn save_snapshot<T: Serialize>(
    store: &dyn CacheStore,
    dataset: &T,
    at: DateTime<Utc>,
) -> Result<String, CacheError> {
    let data = serde_json::to_string(dataset)?;
    let stamp = at.to_rfc3339_opts(SecondsFormat::Millis, true);
    store.set(CacheSlot::Dataset, &data)?;
    store.set(CacheSlot::Timestamp, &stamp)?;
    Ok(stamp)
}

/// `None` unless both slots are present.
pub fn load_snapshot<T: DeserializeOwned>(
    store: &dyn CacheStore,
) -> Result<Option<CachedSnapshot<T>>, CacheError> {
    let (Some(data), Some(cached_at)) = (
        store.get(CacheSlot::Dataset)?,
        store.get(CacheSlot::Timestamp)?,
    ) else {
        return Ok(None);
    };
    Ok(Some(CachedSnapshot {
        dataset: serde_json::from_str(&data)?,
        cached_at,
    }))
}
