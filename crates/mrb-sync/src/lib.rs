//! Enrichment, delivery strategies and the fetch cycle behind the briefing.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, FixedOffset, Local, NaiveDate, SecondsFormat, Utc};
use futures::future::join_all;
use mrb_adapters::{
    envelope_records, AdapterError, FixtureUpstreamSource, HttpUpstreamSource, StatusResolution,
    UpstreamSource, STATUS_REFERENCE_KEY,
};
use mrb_core::{
    epoch_ms_to_date, format_last_known_good, format_short_date, parse_local_date,
    plausible_epoch_ms, reconcile_all, RawRecord, Task, WindowView, MIN_EPOCH_MS,
};
use mrb_storage::{
    load_snapshot, save_snapshot, BackoffPolicy, CacheStore, FetchError, FileCacheStore,
    HttpClientConfig, HttpFetcher, RateLimitConfig, Url,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "mrb-sync";

pub const BRIEFING_FILE: &str = "briefing.yaml";
pub const DEFAULT_PAGE_SIZE: usize = 500;
pub const DEFAULT_MAX_RECORDS: usize = 10_000;
pub const DEFAULT_LOOKUP_BATCH: usize = 10;
pub const UNKNOWN_STATUS: &str = "Unknown";

/// Custom-field source keys and the flat keys they are published under.
pub const CUSTOM_FIELD_MAP: [(&str, &str); 8] = [
    ("cp_walk_date", "cpWalkDate"),
    ("evs", "evs"),
    ("key_release", "keyRelease"),
    ("hhg", "hhg"),
    ("move_in", "moveIn"),
    ("ntv", "ntv"),
    ("vacate", "vacate"),
    ("kti", "kti"),
];

const STATUS_LABELS: &[(&str, &str)] = &[
    ("internalDispatch", "Internal Dispatch"),
    ("vendorDispatch", "Vendor Dispatch"),
    ("inProgress", "In Progress"),
    ("onHold", "On Hold"),
    ("waitingForParts", "Waiting for Parts"),
    ("pendingApproval", "Pending Approval"),
    ("completed", "Completed"),
    ("cancelled", "Cancelled"),
    ("new", "New"),
    ("closed", "Closed"),
];

fn default_workflow_prefixes() -> Vec<String> {
    vec!["Capital Projects: ".to_string()]
}

fn default_proxy_param() -> String {
    "url".to_string()
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct BriefingConfig {
    pub api_base_url: Option<String>,
    pub api_token: Option<String>,
    pub search_path: String,
    pub status_path: String,
    pub fixture_path: Option<PathBuf>,
    pub enriched_url: Option<String>,
    pub cache_dir: PathBuf,
    pub http_timeout_secs: u64,
    pub attempt_timeout_secs: u64,
    pub max_attempts: usize,
    pub user_agent: String,
    pub web_port: u16,
    pub request_url_template: String,
    pub workspace_root: PathBuf,
}

impl Default for BriefingConfig {
    fn default() -> Self {
        Self {
            api_base_url: None,
            api_token: None,
            search_path: "/serviceRequests/search".to_string(),
            status_path: "/serviceWorkflowToServiceStatus".to_string(),
            fixture_path: None,
            enriched_url: None,
            cache_dir: PathBuf::from("./cache"),
            http_timeout_secs: 30,
            attempt_timeout_secs: 120,
            max_attempts: 3,
            user_agent: "mrb-briefing/0.1".to_string(),
            web_port: 8000,
            request_url_template: "{api_base}/serviceRequests/{id}".to_string(),
            workspace_root: PathBuf::from("."),
        }
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl BriefingConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            api_base_url: env_value("MRB_API_BASE_URL"),
            api_token: env_value("MRB_API_TOKEN"),
            search_path: env_value("MRB_SEARCH_PATH").unwrap_or(defaults.search_path),
            status_path: env_value("MRB_STATUS_PATH").unwrap_or(defaults.status_path),
            fixture_path: env_value("MRB_FIXTURE_PATH").map(PathBuf::from),
            enriched_url: env_value("MRB_ENRICHED_URL"),
            cache_dir: env_value("MRB_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.cache_dir),
            http_timeout_secs: env_value("MRB_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            attempt_timeout_secs: env_value("MRB_ATTEMPT_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.attempt_timeout_secs),
            max_attempts: env_value("MRB_MAX_ATTEMPTS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_attempts),
            user_agent: env_value("MRB_USER_AGENT").unwrap_or(defaults.user_agent),
            web_port: env_value("MRB_WEB_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.web_port),
            request_url_template: env_value("MRB_REQUEST_URL_TEMPLATE")
                .unwrap_or(defaults.request_url_template),
            workspace_root: defaults.workspace_root,
        }
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs.max(1))
    }

    /// Link to a service request, or `None` when the template needs an API base that is unset.
    pub fn request_link(&self, service_request_id: &str) -> Option<String> {
        let id = service_request_id.trim();
        if id.is_empty() {
            return None;
        }
        let mut link = self.request_url_template.clone();
        if link.contains("{api_base}") {
            let base = self.api_base_url.as_deref()?;
            link = link.replace("{api_base}", base.trim_end_matches('/'));
        }
        Some(link.replace("{id}", id))
    }
}

/// CORS proxy route: `base` plus a query parameter carrying the target URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyRoute {
    pub base: String,
    #[serde(default = "default_proxy_param")]
    pub param: String,
}

impl ProxyRoute {
    pub fn wrap(&self, target: &str) -> Result<String> {
        let url = Url::parse_with_params(&self.base, &[(self.param.as_str(), target)])
            .with_context(|| format!("invalid proxy base url {}", self.base))?;
        Ok(url.into())
    }
}

/// Deployment settings read from `briefing.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BriefingFile {
    #[serde(default)]
    pub search_filter: Map<String, JsonValue>,
    #[serde(default)]
    pub proxies: Vec<ProxyRoute>,
    #[serde(default = "default_workflow_prefixes")]
    pub workflow_prefixes: Vec<String>,
    /// Fixed offset for epoch conversion; the host zone is used when unset.
    #[serde(default)]
    pub utc_offset_minutes: Option<i32>,
    /// Client-side request budget shared by every upstream call.
    #[serde(default)]
    pub rate_limit: Option<RateLimitSettings>,
}

/// `capacity` requests may burst; one more is allowed every `refill_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitSettings {
    pub capacity: u32,
    pub refill_ms: u64,
}

impl Default for BriefingFile {
    fn default() -> Self {
        Self {
            search_filter: Map::new(),
            proxies: Vec::new(),
            workflow_prefixes: default_workflow_prefixes(),
            utc_offset_minutes: None,
            rate_limit: None,
        }
    }
}

impl BriefingFile {
    /// A missing file yields the defaults; a malformed one is an error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!(path = %path.display(), "no briefing file; using defaults");
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&data).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_workspace_root(root: impl AsRef<Path>) -> Result<Self> {
        Self::load(root.as_ref().join(BRIEFING_FILE))
    }

    pub fn rate_limit_config(&self) -> Option<RateLimitConfig> {
        self.rate_limit
            .filter(|settings| settings.capacity > 0)
            .map(|settings| RateLimitConfig {
                capacity: settings.capacity,
                refill_every: Duration::from_millis(settings.refill_ms),
            })
    }

    pub fn enrichment_config(&self) -> EnrichmentConfig {
        EnrichmentConfig {
            workflow_prefixes: self.workflow_prefixes.clone(),
            utc_offset: self
                .utc_offset_minutes
                .and_then(|minutes| FixedOffset::east_opt(minutes * 60)),
            ..EnrichmentConfig::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Enrichment
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct EnrichmentConfig {
    pub page_size: usize,
    pub max_records: usize,
    pub lookup_batch: usize,
    pub min_epoch_ms: i64,
    pub workflow_prefixes: Vec<String>,
    pub utc_offset: Option<FixedOffset>,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            max_records: DEFAULT_MAX_RECORDS,
            lookup_batch: DEFAULT_LOOKUP_BATCH,
            min_epoch_ms: MIN_EPOCH_MS,
            workflow_prefixes: default_workflow_prefixes(),
            utc_offset: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum EnrichmentError {
    #[error("search page at offset {skip} failed: {source}")]
    Search {
        skip: usize,
        #[source]
        source: AdapterError,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EnrichmentStats {
    pub fetched: usize,
    pub included: usize,
    pub distinct_references: usize,
    pub resolved: usize,
    pub failed_lookups: usize,
}

#[derive(Debug, Clone)]
pub struct EnrichmentRun {
    pub records: Vec<RawRecord>,
    pub stats: EnrichmentStats,
}

/// `"fooBar"` → `"Foo Bar"`.
pub fn format_enum_label(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 4);
    for (i, ch) in raw.trim().chars().enumerate() {
        if i == 0 {
            out.extend(ch.to_uppercase());
            continue;
        }
        if ch.is_uppercase() {
            out.push(' ');
        }
        out.push(ch);
    }
    out
}

pub fn status_label(raw: &str) -> String {
    let raw = raw.trim();
    STATUS_LABELS
        .iter()
        .find(|(key, _)| *key == raw)
        .map(|(_, label)| label.to_string())
        .unwrap_or_else(|| format_enum_label(raw))
}

/// Status label from the record's own enum, for records whose reference did not resolve.
pub fn fallback_status(record: &RawRecord) -> String {
    ["status", "requestStatus"]
        .iter()
        .filter_map(|key| record.get(*key).and_then(JsonValue::as_str))
        .map(str::trim)
        .find(|raw| !raw.is_empty())
        .map(status_label)
        .unwrap_or_else(|| UNKNOWN_STATUS.to_string())
}

pub fn strip_workflow_prefix(name: &str, prefixes: &[String]) -> String {
    prefixes
        .iter()
        .find_map(|prefix| name.strip_prefix(prefix.as_str()))
        .unwrap_or(name)
        .trim()
        .to_string()
}

/// Non-blank workflow-status reference id, numbers rendered as text.
pub fn reference_id(record: &RawRecord) -> Option<String> {
    match record.get(STATUS_REFERENCE_KEY)? {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn epoch_date(value: &JsonValue, config: &EnrichmentConfig) -> Option<NaiveDate> {
    plausible_epoch_ms(value, config.min_epoch_ms)
        .and_then(|ms| epoch_ms_to_date(ms, config.utc_offset))
}

/// Flattened custom fields of one record. Absent keys are omitted.
pub fn flatten_custom_fields(
    custom_fields: Option<&JsonValue>,
    config: &EnrichmentConfig,
    current_year: i32,
) -> Vec<(&'static str, JsonValue)> {
    let Some(JsonValue::Object(fields)) = custom_fields else {
        return Vec::new();
    };
    let years = CUSTOM_FIELD_MAP
        .iter()
        .filter_map(|(source, _)| fields.get(*source))
        .filter_map(|value| epoch_date(value, config))
        .map(|date| date.year())
        .collect::<HashSet<_>>();
    let elide_year = years.len() == 1 && years.contains(&current_year);

    CUSTOM_FIELD_MAP
        .iter()
        .filter_map(|(source, target)| {
            let value = fields.get(*source)?;
            let rendered = match value {
                JsonValue::String(s) => s.clone(),
                JsonValue::Number(_) => epoch_date(value, config)
                    .map(|date| format_short_date(date, !elide_year))
                    .unwrap_or_default(),
                _ => String::new(),
            };
            Some((*target, JsonValue::String(rendered)))
        })
        .collect()
}

/// `YYYY-MM-DD` from an epoch or date-string due date, else `""`.
pub fn due_date_formatted(value: Option<&JsonValue>, config: &EnrichmentConfig) -> String {
    let date = match value {
        Some(number @ JsonValue::Number(_)) => epoch_date(number, config),
        Some(JsonValue::String(s)) => parse_local_date(s),
        _ => None,
    };
    date.map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_default()
}

/// Original record plus the derived fields.
pub fn enrich_record(
    record: &RawRecord,
    resolution: Option<&StatusResolution>,
    config: &EnrichmentConfig,
    current_year: i32,
) -> RawRecord {
    let status_name = resolution
        .and_then(|r| r.status_name.clone())
        .unwrap_or_else(|| fallback_status(record));
    let workflow_name = resolution
        .and_then(|r| r.workflow_name.as_deref())
        .map(|name| strip_workflow_prefix(name, &config.workflow_prefixes))
        .unwrap_or_default();

    let mut out = record.clone();
    out.insert("statusName".to_string(), JsonValue::String(status_name));
    out.insert("workflowName".to_string(), JsonValue::String(workflow_name));
    out.insert(
        "dueDateFormatted".to_string(),
        JsonValue::String(due_date_formatted(record.get("dueDate"), config)),
    );
    for (key, value) in flatten_custom_fields(record.get("customFields"), config, current_year) {
        out.insert(key.to_string(), value);
    }
    out
}

/// Paginate, filter, resolve references and enrich.
pub struct EnrichmentPipeline<S> {
    source: S,
    filter: Map<String, JsonValue>,
    config: EnrichmentConfig,
}

impl<S: UpstreamSource> EnrichmentPipeline<S> {
    pub fn new(source: S, filter: Map<String, JsonValue>, config: EnrichmentConfig) -> Self {
        Self {
            source,
            filter,
            config,
        }
    }

    pub fn config(&self) -> &EnrichmentConfig {
        &self.config
    }

    pub fn source_id(&self) -> &str {
        self.source.source_id()
    }

    pub async fn run(&self) -> Result<EnrichmentRun, EnrichmentError> {
        self.run_for_year(Local::now().year()).await
    }

    pub async fn run_for_year(&self, current_year: i32) -> Result<EnrichmentRun, EnrichmentError> {
        let span = info_span!("enrichment", source = self.source.source_id());
        async move {
            let fetched = self.fetch_all().await?;
            let fetched_count = fetched.len();
            let included = fetched
                .into_iter()
                .filter_map(|record| reference_id(&record).map(|id| (id, record)))
                .collect::<Vec<_>>();

            let mut seen = HashSet::new();
            let distinct = included
                .iter()
                .filter(|(id, _)| seen.insert(id.clone()))
                .map(|(id, _)| id.clone())
                .collect::<Vec<_>>();
            let (resolved, failed_lookups) = self.resolve_references(&distinct).await;

            let records = included
                .iter()
                .map(|(id, record)| {
                    enrich_record(record, resolved.get(id), &self.config, current_year)
                })
                .collect::<Vec<_>>();
            let stats = EnrichmentStats {
                fetched: fetched_count,
                included: records.len(),
                distinct_references: distinct.len(),
                resolved: resolved.len(),
                failed_lookups,
            };
            info!(
                fetched = stats.fetched,
                included = stats.included,
                distinct_references = stats.distinct_references,
                resolved = stats.resolved,
                failed_lookups = stats.failed_lookups,
                "enrichment finished"
            );
            Ok::<_, EnrichmentError>(EnrichmentRun { records, stats })
        }
        .instrument(span)
        .await
    }

    /// Sequential `take`/`skip` pages until a short page or the record ceiling.
    pub async fn fetch_all(&self) -> Result<Vec<RawRecord>, EnrichmentError> {
        let page_size = self.config.page_size.max(1);
        let mut records = Vec::new();
        let mut skip = 0;
        while records.len() < self.config.max_records {
            let take = page_size.min(self.config.max_records - records.len());
            let page = self
                .source
                .search(&self.filter, take, skip)
                .await
                .map_err(|source| EnrichmentError::Search { skip, source })?;
            let received = page.len();
            debug!(skip, take, received, "fetched search page");
            records.extend(page.into_iter().take(take));
            if received < take {
                break;
            }
            skip += take;
        }
        info!(fetched = records.len(), "search complete");
        Ok(records)
    }

    /// Each id looked up once, `lookup_batch` at a time. Failures are counted, not raised.
    pub async fn resolve_references(
        &self,
        ids: &[String],
    ) -> (HashMap<String, StatusResolution>, usize) {
        let mut resolved = HashMap::with_capacity(ids.len());
        let mut failed = 0;
        for batch in ids.chunks(self.config.lookup_batch.max(1)) {
            let lookups = batch.iter().map(|id| async move {
                let result = self.source.resolve_status(id).await;
                (id, result)
            });
            for (id, result) in join_all(lookups).await {
                match result {
                    Ok(resolution) => {
                        resolved.insert(id.clone(), resolution);
                    }
                    Err(err) => {
                        failed += 1;
                        warn!(reference_id = %id, error = %err, "status lookup failed; using raw status");
                    }
                }
            }
        }
        (resolved, failed)
    }
}

// ---------------------------------------------------------------------------
// Delivery strategies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("{strategy} timed out after {after:?}")]
    Timeout { strategy: String, after: Duration },
    #[error("malformed upstream response: {0}")]
    UpstreamShape(String),
    #[error("upstream error: {0}")]
    Upstream(String),
}

impl DeliveryError {
    fn from_adapter(err: &AdapterError, message: String) -> Self {
        match err {
            AdapterError::Fetch(FetchError::Decode { .. }) | AdapterError::Shape(_) => {
                Self::UpstreamShape(message)
            }
            AdapterError::Upstream(_) => Self::Upstream(message),
            _ => Self::Transient(message),
        }
    }
}

impl From<AdapterError> for DeliveryError {
    fn from(err: AdapterError) -> Self {
        let message = err.to_string();
        Self::from_adapter(&err, message)
    }
}

impl From<EnrichmentError> for DeliveryError {
    fn from(err: EnrichmentError) -> Self {
        let message = err.to_string();
        match &err {
            EnrichmentError::Search { source, .. } => Self::from_adapter(source, message),
        }
    }
}

/// One way of obtaining the enriched record list.
#[async_trait]
pub trait DeliveryStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Budget for a single attempt.
    fn timeout(&self) -> Duration;

    async fn deliver(&self) -> Result<Vec<RawRecord>, DeliveryError>;
}

pub struct InProcessEnrichment<S> {
    name: String,
    pipeline: EnrichmentPipeline<S>,
    timeout: Duration,
}

impl<S: UpstreamSource> InProcessEnrichment<S> {
    pub fn new(pipeline: EnrichmentPipeline<S>, timeout: Duration) -> Self {
        Self {
            name: format!("in-process enrichment ({})", pipeline.source_id()),
            pipeline,
            timeout,
        }
    }

    pub fn pipeline(&self) -> &EnrichmentPipeline<S> {
        &self.pipeline
    }
}

#[async_trait]
impl<S: UpstreamSource> DeliveryStrategy for InProcessEnrichment<S> {
    fn name(&self) -> &str {
        &self.name
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn deliver(&self) -> Result<Vec<RawRecord>, DeliveryError> {
        Ok(self.pipeline.run().await?.records)
    }
}

/// GET against an endpoint that already speaks the enrichment envelope.
pub struct EnrichedEndpoint {
    name: String,
    url: String,
    http: Arc<HttpFetcher>,
    timeout: Duration,
}

impl EnrichedEndpoint {
    pub fn direct(http: Arc<HttpFetcher>, url: impl Into<String>, timeout: Duration) -> Self {
        let url = url.into();
        Self {
            name: format!("enriched endpoint {url}"),
            url,
            http,
            timeout,
        }
    }

    pub fn proxied(
        http: Arc<HttpFetcher>,
        route: &ProxyRoute,
        target: &str,
        timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            name: format!("enriched endpoint via {}", route.base),
            url: route.wrap(target)?,
            http,
            timeout,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl DeliveryStrategy for EnrichedEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn deliver(&self) -> Result<Vec<RawRecord>, DeliveryError> {
        let value = self
            .http
            .get_json(&self.url)
            .await
            .map_err(AdapterError::from)?;
        Ok(envelope_records(value)?)
    }
}

/// One attempt under the strategy's own time budget; a late result is dropped.
pub async fn attempt_delivery(
    strategy: &dyn DeliveryStrategy,
) -> Result<Vec<RawRecord>, DeliveryError> {
    let budget = strategy.timeout();
    match tokio::time::timeout(budget, strategy.deliver()).await {
        Ok(result) => result,
        Err(_) => Err(DeliveryError::Timeout {
            strategy: strategy.name().to_string(),
            after: budget,
        }),
    }
}

/// `{ "data": [...] }` on success, `{ "error": "..." }` otherwise.
pub async fn enrichment_envelope(strategy: &dyn DeliveryStrategy) -> JsonValue {
    match attempt_delivery(strategy).await {
        Ok(records) => json!({ "data": records }),
        Err(err) => json!({ "error": err.to_string() }),
    }
}

// ---------------------------------------------------------------------------
// Fetch orchestration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_retries: self.max_attempts.saturating_sub(1),
            base_delay: self.initial_delay,
            max_delay: self.max_delay,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CycleError {
    #[error("all delivery strategies failed after {attempts} attempt(s); last error: {last}")]
    Exhausted { attempts: usize, last: DeliveryError },
    #[error("all delivery strategies failed after {attempts} attempt(s) and no cached snapshot is available; last error: {last}")]
    CacheUnavailable { attempts: usize, last: DeliveryError },
    #[error("all delivery strategies failed after {attempts} attempt(s) and the cached snapshot is unreadable ({cause}); last error: {last}")]
    CacheUnreadable {
        attempts: usize,
        last: DeliveryError,
        cause: String,
    },
}

impl CycleError {
    pub fn last(&self) -> &DeliveryError {
        match self {
            Self::Exhausted { last, .. }
            | Self::CacheUnavailable { last, .. }
            | Self::CacheUnreadable { last, .. } => last,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FetchPhase {
    Idle,
    Fetching,
    Success,
    Degraded,
    Failed,
}

impl FetchPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Fetching => "fetching",
            Self::Success => "success",
            Self::Degraded => "degraded",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Success {
        tasks: Vec<Task>,
        fetched_at: String,
        strategy: String,
    },
    /// Live fetch exhausted; serving the cached snapshot as stored.
    Degraded {
        tasks: Vec<Task>,
        cached_at: String,
        error: CycleError,
    },
    Failed {
        error: CycleError,
    },
}

impl FetchOutcome {
    pub fn phase(&self) -> FetchPhase {
        match self {
            Self::Success { .. } => FetchPhase::Success,
            Self::Degraded { .. } => FetchPhase::Degraded,
            Self::Failed { .. } => FetchPhase::Failed,
        }
    }

    pub fn tasks(&self) -> &[Task] {
        match self {
            Self::Success { tasks, .. } | Self::Degraded { tasks, .. } => tasks,
            Self::Failed { .. } => &[],
        }
    }

    pub fn error(&self) -> Option<&CycleError> {
        match self {
            Self::Success { .. } => None,
            Self::Degraded { error, .. } | Self::Failed { error } => Some(error),
        }
    }

    /// Readable cache timestamp while degraded.
    pub fn last_known_good(&self) -> Option<String> {
        match self {
            Self::Degraded { cached_at, .. } => Some(format_last_known_good(cached_at)),
            _ => None,
        }
    }
}

/// Runs delivery strategies with retries and falls back to the cached snapshot.
pub struct FetchOrchestrator {
    strategies: Vec<Arc<dyn DeliveryStrategy>>,
    cache: Arc<dyn CacheStore>,
    policy: RetryPolicy,
    phase: FetchPhase,
}

impl FetchOrchestrator {
    pub fn new(
        strategies: Vec<Arc<dyn DeliveryStrategy>>,
        cache: Arc<dyn CacheStore>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            strategies,
            cache,
            policy,
            phase: FetchPhase::Idle,
        }
    }

    pub fn phase(&self) -> FetchPhase {
        self.phase
    }

    pub fn strategy_names(&self) -> Vec<&str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    pub fn cache(&self) -> &Arc<dyn CacheStore> {
        &self.cache
    }

    pub async fn run_cycle(&mut self) -> FetchOutcome {
        self.phase = FetchPhase::Fetching;
        let span = info_span!("fetch_cycle", strategies = self.strategies.len());
        let outcome = async {
            match self.fetch_live().await {
                Ok((strategy, records)) => {
                    let tasks = reconcile_all(&records);
                    let fetched_at = self.persist(&tasks);
                    info!(%strategy, tasks = tasks.len(), "fetch cycle succeeded");
                    FetchOutcome::Success {
                        tasks,
                        fetched_at,
                        strategy,
                    }
                }
                Err(error) => self.fall_back(error),
            }
        }
        .instrument(span)
        .await;
        self.phase = outcome.phase();
        outcome
    }

    async fn fetch_live(&self) -> Result<(String, Vec<RawRecord>), CycleError> {
        let attempts = self.policy.max_attempts.max(1);
        let backoff = self.policy.backoff();
        let mut last = DeliveryError::Transient("no delivery strategies configured".to_string());
        if self.strategies.is_empty() {
            return Err(CycleError::Exhausted { attempts: 0, last });
        }
        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = backoff.delay_for_attempt(attempt - 1);
                info!(attempt = attempt + 1, ?delay, "retrying delivery after backoff");
                tokio::time::sleep(delay).await;
            }
            for strategy in &self.strategies {
                match attempt_delivery(strategy.as_ref()).await {
                    Ok(records) => return Ok((strategy.name().to_string(), records)),
                    Err(err) => {
                        warn!(
                            attempt = attempt + 1,
                            strategy = strategy.name(),
                            error = %err,
                            "delivery attempt failed"
                        );
                        last = err;
                    }
                }
            }
        }
        Err(CycleError::Exhausted { attempts, last })
    }

    /// Best effort: a write failure is logged and the fresh data still served.
    fn persist(&self, tasks: &[Task]) -> String {
        let now = Utc::now();
        match save_snapshot(self.cache.as_ref(), &tasks, now) {
            Ok(stamp) => stamp,
            Err(err) => {
                warn!(error = %err, "failed to persist snapshot");
                now.to_rfc3339_opts(SecondsFormat::Millis, true)
            }
        }
    }

    fn fall_back(&self, error: CycleError) -> FetchOutcome {
        let (attempts, last) = match &error {
            CycleError::Exhausted { attempts, last }
            | CycleError::CacheUnavailable { attempts, last }
            | CycleError::CacheUnreadable { attempts, last, .. } => (*attempts, last.clone()),
        };
        match load_snapshot::<Vec<Task>>(self.cache.as_ref()) {
            Ok(Some(snapshot)) => {
                warn!(
                    cached_at = %snapshot.cached_at,
                    error = %error,
                    "serving cached snapshot"
                );
                FetchOutcome::Degraded {
                    tasks: snapshot.dataset,
                    cached_at: snapshot.cached_at,
                    error,
                }
            }
            Ok(None) => FetchOutcome::Failed {
                error: CycleError::CacheUnavailable { attempts, last },
            },
            Err(cache_err) => {
                warn!(error = %cache_err, "cached snapshot unreadable");
                FetchOutcome::Failed {
                    error: CycleError::CacheUnreadable {
                        attempts,
                        last,
                        cause: cache_err.to_string(),
                    },
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Assembly
// ---------------------------------------------------------------------------

/// Everything a binary needs, wired from [`BriefingConfig`] and `briefing.yaml`.
pub struct Briefing {
    pub config: BriefingConfig,
    pub file: BriefingFile,
    /// The in-process pipeline, when an upstream or fixture is configured.
    pub enrichment: Option<Arc<dyn DeliveryStrategy>>,
    pub strategies: Vec<Arc<dyn DeliveryStrategy>>,
    pub cache: Arc<dyn CacheStore>,
}

impl Briefing {
    pub fn from_env() -> Result<Self> {
        Self::from_config(BriefingConfig::from_env())
    }

    pub fn from_config(config: BriefingConfig) -> Result<Self> {
        let file = BriefingFile::from_workspace_root(&config.workspace_root)?;
        let http = Arc::new(HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs.max(1)),
            user_agent: Some(config.user_agent.clone()),
            bearer_token: config.api_token.clone(),
            rate_limit: file.rate_limit_config(),
            ..HttpClientConfig::default()
        })?);
        let timeout = config.attempt_timeout();

        let enrichment: Option<Arc<dyn DeliveryStrategy>> = if let Some(path) = &config.fixture_path {
            let source = FixtureUpstreamSource::from_path(path)
                .with_context(|| format!("loading upstream fixture {}", path.display()))?;
            let pipeline = EnrichmentPipeline::new(
                source,
                file.search_filter.clone(),
                file.enrichment_config(),
            );
            Some(Arc::new(InProcessEnrichment::new(pipeline, timeout)))
        } else if let Some(base) = &config.api_base_url {
            let source = HttpUpstreamSource::new(
                http.clone(),
                base.clone(),
                config.search_path.clone(),
                config.status_path.clone(),
            );
            let pipeline = EnrichmentPipeline::new(
                source,
                file.search_filter.clone(),
                file.enrichment_config(),
            );
            Some(Arc::new(InProcessEnrichment::new(pipeline, timeout)))
        } else {
            None
        };

        let mut strategies = enrichment.iter().cloned().collect::<Vec<_>>();
        if let Some(url) = &config.enriched_url {
            strategies.push(Arc::new(EnrichedEndpoint::direct(http.clone(), url.clone(), timeout)));
            for route in &file.proxies {
                strategies.push(Arc::new(EnrichedEndpoint::proxied(
                    http.clone(),
                    route,
                    url,
                    timeout,
                )?));
            }
        }
        if strategies.is_empty() {
            warn!("no delivery strategy configured; set MRB_API_BASE_URL, MRB_FIXTURE_PATH or MRB_ENRICHED_URL");
        }

        let cache: Arc<dyn CacheStore> = Arc::new(FileCacheStore::new(config.cache_dir.clone()));
        Ok(Self {
            config,
            file,
            enrichment,
            strategies,
            cache,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.config.max_attempts,
            ..RetryPolicy::default()
        }
    }

    pub fn orchestrator(&self) -> FetchOrchestrator {
        FetchOrchestrator::new(
            self.strategies.clone(),
            self.cache.clone(),
            self.retry_policy(),
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub phase: FetchPhase,
    pub strategy: Option<String>,
    pub tasks: usize,
    pub cached_at: Option<String>,
    pub error: Option<String>,
}

impl FetchSummary {
    pub fn from_outcome(outcome: &FetchOutcome, started_at: DateTime<Utc>) -> Self {
        let (strategy, cached_at) = match outcome {
            FetchOutcome::Success { strategy, .. } => (Some(strategy.clone()), None),
            FetchOutcome::Degraded { cached_at, .. } => (None, Some(cached_at.clone())),
            FetchOutcome::Failed { .. } => (None, None),
        };
        Self {
            started_at,
            finished_at: Utc::now(),
            phase: outcome.phase(),
            strategy,
            tasks: outcome.tasks().len(),
            cached_at,
            error: outcome.error().map(ToString::to_string),
        }
    }
}

pub async fn run_fetch_once_from_env() -> Result<FetchSummary> {
    let briefing = Briefing::from_env()?;
    let started_at = Utc::now();
    let outcome = briefing.orchestrator().run_cycle().await;
    Ok(FetchSummary::from_outcome(&outcome, started_at))
}

/// Markdown rendering of one window of the briefing.
pub fn report_markdown(
    view: &WindowView,
    generated_at: DateTime<Utc>,
    notice: Option<&str>,
    config: &BriefingConfig,
) -> String {
    let mut lines = vec!["# Make-Ready Briefing".to_string(), String::new()];
    lines.push(format!(
        "_Generated {}_",
        generated_at.format("%Y-%m-%d %H:%M UTC")
    ));
    lines.push(String::new());
    if let Some(notice) = notice {
        lines.push(format!("> {notice}"));
        lines.push(String::new());
    }
    lines.push(format!(
        "**Window:** {} ({} of {} tasks)",
        view.range_label, view.visible_count, view.total_count
    ));

    for group in &view.groups {
        lines.push(String::new());
        lines.push(format!("## {}", group.display_date));
        for task in &group.tasks {
            let title = match task
                .service_request_id
                .as_deref()
                .and_then(|id| config.request_link(id))
            {
                Some(link) => format!("[{}]({link})", task.title),
                None => task.title.clone(),
            };
            let when = if task.time.is_empty() {
                String::new()
            } else {
                format!(" {}", task.time)
            };
            lines.push(format!("- **{title}**{when} `{}`", task.status));
            if !task.details.is_empty() {
                lines.push(format!("  - {}", task.details));
            }
            if !task.description.is_empty() {
                lines.push(format!("  - {}", task.description));
            }
            let milestones = task
                .milestones()
                .into_iter()
                .filter(|(_, value)| !value.is_empty())
                .map(|(label, value)| format!("{label}: {value}"))
                .collect::<Vec<_>>();
            if !milestones.is_empty() {
                lines.push(format!("  - {}", milestones.join("; ")));
            }
        }
    }
    if view.groups.is_empty() {
        lines.push(String::new());
        lines.push("_No tasks in this window._".to_string());
    }
    lines.push(String::new());
    lines.join("\n")
}
