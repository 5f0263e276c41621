//! Axum + Askama briefing page, refresh trigger and JSON endpoints.

use std::path::PathBuf;
use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Local;
use mrb_core::{format_last_known_good, DateRange, ReportModel, Task, WindowView};
use mrb_sync::{
    enrichment_envelope, Briefing, BriefingConfig, DeliveryStrategy, FetchOrchestrator,
    FetchOutcome, FetchPhase,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, RwLock};
use tracing::info;

pub const CRATE_NAME: &str = "mrb-web";

#[derive(Default)]
struct Snapshot {
    model: ReportModel,
    outcome: Option<FetchOutcome>,
    window: Option<DateRange>,
}

pub struct AppState {
    pub workspace_root: PathBuf,
    pub config: BriefingConfig,
    orchestrator: Mutex<FetchOrchestrator>,
    snapshot: RwLock<Snapshot>,
    enrichment: Option<Arc<dyn DeliveryStrategy>>,
}

impl AppState {
    pub fn new(
        config: BriefingConfig,
        orchestrator: FetchOrchestrator,
        enrichment: Option<Arc<dyn DeliveryStrategy>>,
    ) -> Self {
        Self {
            workspace_root: config.workspace_root.clone(),
            config,
            orchestrator: Mutex::new(orchestrator),
            snapshot: RwLock::new(Snapshot::default()),
            enrichment,
        }
    }

    pub fn from_briefing(briefing: Briefing) -> Self {
        let orchestrator = briefing.orchestrator();
        Self::new(briefing.config, orchestrator, briefing.enrichment)
    }

    pub fn is_refreshing(&self) -> bool {
        self.orchestrator.try_lock().is_err()
    }

    /// Runs one fetch cycle and publishes it; `None` if a cycle is already in flight.
    pub async fn refresh(&self) -> Option<FetchPhase> {
        let mut orchestrator = self.orchestrator.try_lock().ok()?;
        let outcome = orchestrator.run_cycle().await;
        let phase = outcome.phase();
        let model = ReportModel::new(outcome.tasks().to_vec());
        let window = model.default_window(Local::now().date_naive());
        *self.snapshot.write().await = Snapshot {
            model,
            outcome: Some(outcome),
            window,
        };
        Some(phase)
    }
}

#[derive(Debug, Default, Deserialize)]
struct WindowQuery {
    start: Option<usize>,
    end: Option<usize>,
    #[serde(default)]
    reset: bool,
}

fn select_window(
    model: &ReportModel,
    current: Option<DateRange>,
    query: &WindowQuery,
) -> Option<DateRange> {
    if query.reset {
        return model.reset_window();
    }
    if query.start.is_none() && query.end.is_none() {
        return current;
    }
    let base = current.or_else(|| model.reset_window())?;
    model.set_window(DateRange {
        start: query.start.unwrap_or(base.start),
        end: query.end.unwrap_or(base.end),
    })
}

struct Notice {
    kind: &'static str,
    headline: String,
    detail: Option<String>,
    dismissible: bool,
}

impl Notice {
    fn for_outcome(outcome: Option<&FetchOutcome>) -> Option<Self> {
        match outcome {
            None => Some(Self {
                kind: "info",
                headline: "No briefing loaded yet.".to_string(),
                detail: Some("Use Refresh to fetch the latest service requests.".to_string()),
                dismissible: false,
            }),
            Some(FetchOutcome::Success { .. }) => None,
            Some(FetchOutcome::Degraded {
                cached_at, error, ..
            }) => Some(Self {
                kind: "warning",
                headline: format!(
                    "Live data is unavailable. Showing the last known good briefing from {}.",
                    format_last_known_good(cached_at)
                ),
                detail: Some(error.to_string()),
                dismissible: true,
            }),
            Some(FetchOutcome::Failed { error }) => Some(Self {
                kind: "error",
                headline: "The briefing could not be loaded.".to_string(),
                detail: Some(error.to_string()),
                dismissible: false,
            }),
        }
    }
}

struct MonthOption {
    index: usize,
    label: String,
    is_start: bool,
    is_end: bool,
}

struct Milestone {
    label: &'static str,
    value: String,
}

struct TaskRow {
    title: String,
    link: Option<String>,
    time: String,
    status: String,
    category: &'static str,
    details: String,
    description: String,
    milestones: Vec<Milestone>,
}

impl TaskRow {
    fn new(task: &Task, config: &BriefingConfig) -> Self {
        Self {
            title: task.title.clone(),
            link: task
                .service_request_id
                .as_deref()
                .and_then(|id| config.request_link(id)),
            time: task.time.clone(),
            status: task.status.clone(),
            category: task.status_category().as_str(),
            details: task.details.clone(),
            description: task.description.clone(),
            milestones: task
                .milestones()
                .into_iter()
                .filter(|(_, value)| !value.is_empty())
                .map(|(label, value)| Milestone {
                    label,
                    value: value.to_string(),
                })
                .collect(),
        }
    }
}

struct DateSection {
    display_date: String,
    rows: Vec<TaskRow>,
}

#[derive(Template)]
#[template(path = "briefing.html")]
struct BriefingTemplate {
    phase: &'static str,
    fetching: bool,
    notice: Option<Notice>,
    range_label: String,
    visible_count: usize,
    total_count: usize,
    months: Vec<MonthOption>,
    sections: Vec<DateSection>,
}

impl BriefingTemplate {
    fn build(
        config: &BriefingConfig,
        outcome: Option<&FetchOutcome>,
        view: &WindowView,
        fetching: bool,
    ) -> Self {
        let phase = if fetching {
            FetchPhase::Fetching
        } else {
            outcome.map(FetchOutcome::phase).unwrap_or(FetchPhase::Idle)
        };
        let months = view
            .months
            .iter()
            .enumerate()
            .map(|(index, label)| MonthOption {
                index,
                label: label.clone(),
                is_start: view.range.is_some_and(|r| r.start == index),
                is_end: view.range.is_some_and(|r| r.end == index),
            })
            .collect();
        let sections = view
            .groups
            .iter()
            .map(|group| DateSection {
                display_date: group.display_date.clone(),
                rows: group.tasks.iter().map(|t| TaskRow::new(t, config)).collect(),
            })
            .collect();
        Self {
            phase: phase.as_str(),
            fetching,
            notice: Notice::for_outcome(outcome),
            range_label: view.range_label.clone(),
            visible_count: view.visible_count,
            total_count: view.total_count,
            months,
            sections,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BriefingPayload {
    phase: FetchPhase,
    strategy: Option<String>,
    fetched_at: Option<String>,
    cached_at: Option<String>,
    last_known_good: Option<String>,
    error: Option<String>,
    view: WindowView,
}

pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/refresh", post(refresh_handler))
        .route("/api/briefing", get(api_briefing_handler))
        .route("/api/enriched", get(api_enriched_handler))
        .route("/assets/static/app.css", get(app_css_handler))
        .with_state(state)
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let briefing = Briefing::from_env()?;
    let port = briefing.config.web_port;
    let state = Arc::new(AppState::from_briefing(briefing));

    let initial = state.clone();
    tokio::spawn(async move {
        initial.refresh().await;
    });

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving briefing");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn index_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WindowQuery>,
) -> Response {
    let fetching = state.is_refreshing();
    let snapshot = state.snapshot.read().await;
    let window = select_window(&snapshot.model, snapshot.window, &query);
    let view = snapshot.model.window_view(window);
    render_html(BriefingTemplate::build(
        &state.config,
        snapshot.outcome.as_ref(),
        &view,
        fetching,
    ))
}

async fn refresh_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.refresh().await {
        Some(phase) => {
            info!(phase = phase.as_str(), "refresh finished");
            Redirect::to("/").into_response()
        }
        None => (
            StatusCode::CONFLICT,
            Html("A refresh is already in progress.".to_string()),
        )
            .into_response(),
    }
}

async fn api_briefing_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WindowQuery>,
) -> Response {
    let fetching = state.is_refreshing();
    let snapshot = state.snapshot.read().await;
    let window = select_window(&snapshot.model, snapshot.window, &query);
    let outcome = snapshot.outcome.as_ref();
    let phase = if fetching {
        FetchPhase::Fetching
    } else {
        outcome.map(FetchOutcome::phase).unwrap_or(FetchPhase::Idle)
    };
    let (strategy, fetched_at, cached_at) = match outcome {
        Some(FetchOutcome::Success {
            strategy,
            fetched_at,
            ..
        }) => (Some(strategy.clone()), Some(fetched_at.clone()), None),
        Some(FetchOutcome::Degraded { cached_at, .. }) => (None, None, Some(cached_at.clone())),
        _ => (None, None, None),
    };
    Json(BriefingPayload {
        phase,
        strategy,
        fetched_at,
        cached_at,
        last_known_good: outcome.and_then(FetchOutcome::last_known_good),
        error: outcome.and_then(FetchOutcome::error).map(ToString::to_string),
        view: snapshot.model.window_view(window),
    })
    .into_response()
}

async fn api_enriched_handler(State(state): State<Arc<AppState>>) -> Response {
    let Some(strategy) = &state.enrichment else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "no upstream source configured" })),
        )
            .into_response();
    };
    let envelope = enrichment_envelope(strategy.as_ref()).await;
    let status = if envelope.get("error").is_some() {
        StatusCode::BAD_GATEWAY
    } else {
        StatusCode::OK
    };
    (status, Json(envelope)).into_response()
}

async fn app_css_handler(State(state): State<Arc<AppState>>) -> Response {
    let css_path = state.workspace_root.join("assets/static/app.css");
    match tokio::fs::read_to_string(&css_path).await {
        Ok(css) => ([(header::CONTENT_TYPE, "text/css; charset=utf-8")], css).into_response(),
        Err(_) => (StatusCode::NOT_FOUND, Html("/* missing app.css */".to_string())).into_response(),
    }
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}
