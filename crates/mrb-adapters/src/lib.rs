//! Upstream facilities API contracts plus HTTP and fixture-backed sources.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mrb_core::RawRecord;
use mrb_storage::{FetchError, HttpFetcher};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "mrb-adapters";

/// Key on each service request that points at its workflow/status pair.
pub const STATUS_REFERENCE_KEY: &str = "serviceWorkflowToServiceStatusId";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("unexpected response shape: {0}")]
    Shape(String),
    #[error("upstream reported an error: {0}")]
    Upstream(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Names behind one workflow-status reference.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResolution {
    pub status_name: Option<String>,
    pub workflow_name: Option<String>,
}

impl StatusResolution {
    /// Reads `serviceStatus.name` / `serviceWorkflow.name`, or a flat `name`.
    pub fn from_response(value: &JsonValue) -> Self {
        let status_name = json_str(value, &["serviceStatus", "name"])
            .or_else(|| json_str(value, &["name"]))
            .map(ToString::to_string);
        let workflow_name = json_str(value, &["serviceWorkflow", "name"]).map(ToString::to_string);
        Self {
            status_name,
            workflow_name,
        }
    }
}

#[async_trait]
pub trait UpstreamSource: Send + Sync {
    fn source_id(&self) -> &str;

    /// One page of the search, `take` records starting at offset `skip`.
    async fn search(
        &self,
        filter: &Map<String, JsonValue>,
        take: usize,
        skip: usize,
    ) -> Result<Vec<RawRecord>, AdapterError>;

    async fn resolve_status(&self, reference_id: &str) -> Result<StatusResolution, AdapterError>;
}

#[async_trait]
impl<S: UpstreamSource + ?Sized> UpstreamSource for Arc<S> {
    fn source_id(&self) -> &str {
        (**self).source_id()
    }

    async fn search(
        &self,
        filter: &Map<String, JsonValue>,
        take: usize,
        skip: usize,
    ) -> Result<Vec<RawRecord>, AdapterError> {
        (**self).search(filter, take, skip).await
    }

    async fn resolve_status(&self, reference_id: &str) -> Result<StatusResolution, AdapterError> {
        (**self).resolve_status(reference_id).await
    }
}

/// Either side of the `{ data: [...] }` / `{ error: "..." }` envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordEnvelope {
    Data(Vec<RawRecord>),
    Error(String),
}

/// Accepts a bare array, `{ "data": [...] }` or `{ "error": "..." }`.
/// Non-object array entries are dropped.
pub fn parse_record_envelope(value: JsonValue) -> Result<RecordEnvelope, AdapterError> {
    let items = match value {
        JsonValue::Array(items) => items,
        JsonValue::Object(mut obj) => match (obj.remove("data"), obj.remove("error")) {
            (Some(JsonValue::Array(items)), _) => items,
            (_, Some(JsonValue::String(message))) => return Ok(RecordEnvelope::Error(message)),
            (_, Some(other)) if !other.is_null() => {
                return Ok(RecordEnvelope::Error(other.to_string()));
            }
            _ => {
                return Err(AdapterError::Shape(
                    "object without a `data` array".to_string(),
                ));
            }
        },
        other => {
            return Err(AdapterError::Shape(format!(
                "expected array or object, got {}",
                json_kind(&other)
            )));
        }
    };

    let total = items.len();
    let records = items
        .into_iter()
        .filter_map(|item| match item {
            JsonValue::Object(record) => Some(record),
            _ => None,
        })
        .collect::<Vec<_>>();
    if records.len() != total {
        debug!(dropped = total - records.len(), "ignoring non-object records");
    }
    Ok(RecordEnvelope::Data(records))
}

pub fn envelope_records(value: JsonValue) -> Result<Vec<RawRecord>, AdapterError> {
    match parse_record_envelope(value)? {
        RecordEnvelope::Data(records) => Ok(records),
        RecordEnvelope::Error(message) => Err(AdapterError::Upstream(message)),
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_str().map(str::trim).filter(|s| !s.is_empty())
}

fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Live facilities API: POST search with `take`/`skip`, GET status by id.
#[derive(Debug, Clone)]
pub struct HttpUpstreamSource {
    http: Arc<HttpFetcher>,
    base_url: String,
    search_path: String,
    status_path: String,
}

impl HttpUpstreamSource {
    pub fn new(
        http: Arc<HttpFetcher>,
        base_url: impl Into<String>,
        search_path: impl Into<String>,
        status_path: impl Into<String>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            search_path: search_path.into(),
            status_path: status_path.into(),
        }
    }

    pub fn search_url(&self) -> String {
        join_url(&self.base_url, &self.search_path)
    }

    pub fn status_url(&self, reference_id: &str) -> String {
        join_url(&join_url(&self.base_url, &self.status_path), reference_id)
    }
}

#[async_trait]
impl UpstreamSource for HttpUpstreamSource {
    fn source_id(&self) -> &str {
        &self.base_url
    }

    async fn search(
        &self,
        filter: &Map<String, JsonValue>,
        take: usize,
        skip: usize,
    ) -> Result<Vec<RawRecord>, AdapterError> {
        let mut body = filter.clone();
        body.insert("take".to_string(), JsonValue::from(take));
        body.insert("skip".to_string(), JsonValue::from(skip));
        let value = self
            .http
            .post_json(&self.search_url(), &JsonValue::Object(body))
            .await?;
        envelope_records(value)
    }

    async fn resolve_status(&self, reference_id: &str) -> Result<StatusResolution, AdapterError> {
        let value = self.http.get_json(&self.status_url(reference_id)).await?;
        if !value.is_object() {
            return Err(AdapterError::Shape(format!(
                "status {reference_id}: expected object, got {}",
                json_kind(&value)
            )));
        }
        Ok(StatusResolution::from_response(&value))
    }
}

/// Captured upstream responses: search records plus status lookups keyed by id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpstreamFixture {
    #[serde(default)]
    pub captured_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub notes: Option<String>,
    pub records: Vec<RawRecord>,
    #[serde(default)]
    pub statuses: BTreeMap<String, JsonValue>,
}

pub fn load_upstream_fixture(path: impl AsRef<Path>) -> Result<UpstreamFixture> {
    read_json_file(path)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Offline source replaying an [`UpstreamFixture`]. The search filter is ignored.
#[derive(Debug, Clone)]
pub struct FixtureUpstreamSource {
    source_id: String,
    fixture: UpstreamFixture,
}

impl FixtureUpstreamSource {
    pub fn new(source_id: impl Into<String>, fixture: UpstreamFixture) -> Self {
        Self {
            source_id: source_id.into(),
            fixture,
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let fixture = load_upstream_fixture(path)?;
        Ok(Self::new(format!("fixture:{}", path.display()), fixture))
    }

    pub fn fixture(&self) -> &UpstreamFixture {
        &self.fixture
    }
}

#[async_trait]
impl UpstreamSource for FixtureUpstreamSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn search(
        &self,
        _filter: &Map<String, JsonValue>,
        take: usize,
        skip: usize,
    ) -> Result<Vec<RawRecord>, AdapterError> {
        Ok(self
            .fixture
            .records
            .iter()
            .skip(skip)
            .take(take)
            .cloned()
            .collect())
    }

    async fn resolve_status(&self, reference_id: &str) -> Result<StatusResolution, AdapterError> {
        self.fixture
            .statuses
            .get(reference_id)
            .map(StatusResolution::from_response)
            .ok_or_else(|| AdapterError::Message(format!("no status captured for {reference_id}")))
    }
}
