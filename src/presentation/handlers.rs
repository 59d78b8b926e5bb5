// HTTP request handlers
use crate::application::catalog::CatalogError;
use crate::application::chart_linking::Interaction;
use crate::application::dashboard_service::{DashboardEvent, DashboardSession, DashboardView, SessionError};
use crate::domain::refresh::RefreshOptions;
use crate::domain::time_span::{TimeSpanSelection, find_builtin};
use crate::infrastructure::chunked_stream::stream_from_broadcast;
use crate::infrastructure::http_response::{accepts_brotli, json_response};
use crate::infrastructure::table_mapper::table_window_to_rows;
use crate::presentation::app_state::AppState;
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Largest row window served per request.
pub const MAX_VIEWPORT_ROWS: usize = 1000;

pub fn routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .route("/dashboards", get(list_dashboards))
        .route("/dashboards/:name", get(get_dashboard).delete(close_dashboard))
        .route("/dashboards/:name/refresh", post(refresh_dashboard))
        .route("/dashboards/:name/span", put(set_external_span))
        .route("/dashboards/:name/filter", put(set_filter))
        .route("/dashboards/:name/stream", get(stream_dashboard))
        .route("/dashboards/:name/groups/:group/toggle", post(toggle_group))
        .route("/dashboards/:name/panels/:panel", get(get_panel))
        .route("/dashboards/:name/panels/:panel/toggle", post(toggle_panel))
        .route("/dashboards/:name/panels/:panel/hidden", put(set_panel_hidden))
        .route("/dashboards/:name/panels/:panel/sort", post(sort_panel))
        .route("/dashboards/:name/panels/:panel/rows", get(panel_rows))
        .route("/dashboards/:name/panels/:panel/interact", post(interact))
        .route(
            "/dashboards/:name/panels/:panel/drilldown/:drilldown",
            post(open_drilldown),
        )
        .route(
            "/dashboards/:name/drilldowns/:id",
            get(get_drilldown).delete(close_drilldown),
        )
        .with_state(state)
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("{0}")]
    BadRequest(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Catalog(CatalogError::UnknownDashboard(_)) => StatusCode::NOT_FOUND,
            ApiError::Session(SessionError::NotATable(_)) | ApiError::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Session(SessionError::Closed) => StatusCode::CONFLICT,
            ApiError::Session(_) => StatusCode::NOT_FOUND,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

async fn respond<T: Serialize>(result: Result<T, ApiError>, compress: bool) -> Response {
    let built = match result {
        Ok(data) => json_response(&data, StatusCode::OK, compress).await,
        Err(error) => {
            tracing::debug!(%error, "Request rejected");
            let body = ErrorBody {
                error: error.to_string(),
            };
            json_response(&body, error.status(), compress).await
        }
    };
    match built {
        Ok(response) => response,
        Err(status) => status.into_response(),
    }
}

fn session(state: &AppState, name: &str) -> Result<Arc<DashboardSession>, ApiError> {
    Ok(state.catalog.session(name)?)
}

#[derive(Debug, Default, Deserialize)]
pub struct RefreshRequest {
    /// Explicit selection; takes precedence over `label`.
    pub span: Option<TimeSpanSelection>,
    /// Label of a built-in span such as "Last 1 Hour".
    pub label: Option<String>,
}

impl RefreshRequest {
    fn selection(&self) -> Result<Option<TimeSpanSelection>, ApiError> {
        if let Some(span) = &self.span {
            return Ok(Some(span.clone()));
        }
        self.label
            .as_deref()
            .map(|label| {
                find_builtin(label)
                    .map(TimeSpanSelection::Relative)
                    .ok_or_else(|| ApiError::BadRequest(format!("unknown time span '{}'", label)))
            })
            .transpose()
    }
}

#[derive(Debug, Deserialize)]
pub struct FilterRequest {
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HiddenRequest {
    pub hidden: bool,
}

#[derive(Debug, Deserialize)]
pub struct SortRequest {
    pub column: String,
}

#[derive(Debug, Deserialize)]
pub struct RowsQuery {
    #[serde(default)]
    pub offset: usize,
    #[serde(default = "default_viewport")]
    pub viewport: usize,
}

fn default_viewport() -> usize {
    50
}

#[derive(Debug, Default, Deserialize)]
pub struct DrilldownRequest {
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Toggled {
    collapsed: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Hidden {
    hidden: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Accepted {
    accepted: bool,
}

/// Frames sent on the dashboard stream.
#[derive(Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum StreamMessage {
    Snapshot(Box<DashboardView>),
    Event(DashboardEvent),
}

impl From<DashboardEvent> for StreamMessage {
    fn from(event: DashboardEvent) -> Self {
        StreamMessage::Event(event)
    }
}

/// Health check endpoint
pub async fn health_check() -> &'static str {
    "ok"
}

pub async fn list_dashboards(headers: HeaderMap, State(state): State<Arc<AppState>>) -> Response {
    respond(Ok::<_, ApiError>(state.catalog.list()), accepts_brotli(&headers)).await
}

/// Layout plus panel snapshots; opens the session on first access.
pub async fn get_dashboard(
    Path(name): Path<String>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    let result = session(&state, &name).map(|s| s.view());
    respond(result, accepts_brotli(&headers)).await
}

pub async fn close_dashboard(
    Path(name): Path<String>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    let result = state
        .catalog
        .close(&name)
        .map(|_| Accepted { accepted: true })
        .map_err(ApiError::from);
    respond(result, accepts_brotli(&headers)).await
}

pub async fn refresh_dashboard(
    Path(name): Path<String>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
    body: Option<Json<RefreshRequest>>,
) -> Response {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let result = (|| -> Result<RefreshOptions, ApiError> {
        let session = session(&state, &name)?;
        let options = match request.selection()? {
            Some(selection) => session.select_time_span(selection, Utc::now())?,
            None => session.refresh(None, Utc::now())?,
        };
        Ok(options)
    })();
    respond(result, accepts_brotli(&headers)).await
}

/// Span pushed by an embedding page. An empty body clears it.
pub async fn set_external_span(
    Path(name): Path<String>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
    body: Option<Json<RefreshRequest>>,
) -> Response {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let result = (|| -> Result<RefreshOptions, ApiError> {
        let session = session(&state, &name)?;
        Ok(session.set_external_span(request.selection()?, Utc::now())?)
    })();
    respond(result, accepts_brotli(&headers)).await
}

pub async fn set_filter(
    Path(name): Path<String>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
    Json(request): Json<FilterRequest>,
) -> Response {
    let result = session(&state, &name).and_then(|s| {
        s.set_filter(request.text)?;
        Ok(Accepted { accepted: true })
    });
    respond(result, accepts_brotli(&headers)).await
}

pub async fn toggle_group(
    Path((name, group)): Path<(String, usize)>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    let result = session(&state, &name)
        .and_then(|s| Ok(s.toggle_group(group)?))
        .map(|collapsed| Toggled { collapsed });
    respond(result, accepts_brotli(&headers)).await
}

pub async fn toggle_panel(
    Path((name, panel)): Path<(String, usize)>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    let result = session(&state, &name)
        .and_then(|s| Ok(s.toggle_panel(panel)?))
        .map(|collapsed| Toggled { collapsed });
    respond(result, accepts_brotli(&headers)).await
}

pub async fn set_panel_hidden(
    Path((name, panel)): Path<(String, usize)>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
    Json(request): Json<HiddenRequest>,
) -> Response {
    let result = session(&state, &name)
        .and_then(|s| Ok(s.set_panel_hidden(panel, request.hidden)?))
        .map(|hidden| Hidden { hidden });
    respond(result, accepts_brotli(&headers)).await
}

pub async fn get_panel(
    Path((name, panel)): Path<(String, usize)>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    let result = session(&state, &name).and_then(|s| Ok(s.panel_snapshot(panel)?));
    respond(result, accepts_brotli(&headers)).await
}

pub async fn sort_panel(
    Path((name, panel)): Path<(String, usize)>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
    Json(request): Json<SortRequest>,
) -> Response {
    let result = session(&state, &name).and_then(|s| Ok(s.sort_column(panel, &request.column)?));
    respond(result, accepts_brotli(&headers)).await
}

pub async fn panel_rows(
    Path((name, panel)): Path<(String, usize)>,
    Query(query): Query<RowsQuery>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    let result = session(&state, &name)
        .and_then(|s| Ok(s.table_window(panel, query.offset, query.viewport.min(MAX_VIEWPORT_ROWS))?))
        .map(table_window_to_rows);
    respond(result, accepts_brotli(&headers)).await
}

pub async fn interact(
    Path((name, panel)): Path<(String, usize)>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
    Json(interaction): Json<Interaction>,
) -> Response {
    let result = session(&state, &name).and_then(|s| Ok(s.interact(panel, interaction)?));
    respond(result, accepts_brotli(&headers)).await
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OpenedDrilldown {
    id: u64,
    panel: crate::application::panel_runtime::PanelSnapshot,
}

pub async fn open_drilldown(
    Path((name, panel, drilldown)): Path<(String, usize, String)>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
    body: Option<Json<DrilldownRequest>>,
) -> Response {
    let parameters = body.map(|Json(r)| r.parameters).unwrap_or_default();
    let result = session(&state, &name).and_then(|s| {
        let (id, snapshot) = s.open_drilldown(panel, &drilldown, parameters, Utc::now())?;
        Ok(OpenedDrilldown { id, panel: snapshot })
    });
    respond(result, accepts_brotli(&headers)).await
}

pub async fn get_drilldown(
    Path((name, id)): Path<(String, u64)>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    let result = session(&state, &name).and_then(|s| Ok(s.drilldown_snapshot(id)?));
    respond(result, accepts_brotli(&headers)).await
}

pub async fn close_drilldown(
    Path((name, id)): Path<(String, u64)>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    let result = session(&state, &name).and_then(|s| {
        s.close_drilldown(id)?;
        Ok(Accepted { accepted: true })
    });
    respond(result, accepts_brotli(&headers)).await
}

/// Stream the dashboard snapshot, then every panel and interaction event.
pub async fn stream_dashboard(
    Path(name): Path<String>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    let compress = accepts_brotli(&headers);
    match session(&state, &name) {
        Ok(session) => {
            let rx = session.subscribe();
            let first = StreamMessage::Snapshot(Box::new(session.view()));
            stream_from_broadcast::<StreamMessage, DashboardEvent>(first, rx, compress).into_response()
        }
        Err(error) => respond::<()>(Err(error), compress).await,
    }
}
