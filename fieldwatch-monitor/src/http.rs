//! HTTP control surface.
//!
//! Every route except `/health` requires the `x-api-key` header to match the
//! configured key. Operator actions map one-to-one onto `Dashboard` methods;
//! errors come back as `{"error": "..."}` with 422 for rejected input, 409
//! for controls disabled by the current posture and 503 for store failures.

use crate::state::SharedDashboard;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use fieldwatch_core::config_sync::InputField;
use fieldwatch_core::render::{ChartState, MapState};
use fieldwatch_core::{normalize, ChartModel, ConfigPatch, DashboardError, DashboardView, MapModel, Notice};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use time::OffsetDateTime;
use tracing::warn;

#[derive(Clone)]
pub struct AppState {
    pub dashboard: SharedDashboard,
    pub map: MapModel,
    pub chart: ChartModel,
    pub store_id: String,
    /// `None` locks every route but `/health`.
    pub api_key: Option<String>,
}

pub struct ApiError(DashboardError);

impl From<DashboardError> for ApiError {
    fn from(e: DashboardError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            DashboardError::Validation(_) | DashboardError::Threshold(_) => StatusCode::UNPROCESSABLE_ENTITY,
            DashboardError::UnknownRecord(_) => StatusCode::NOT_FOUND,
            DashboardError::SwitchInProgress(_) | DashboardError::ControlsLocked => StatusCode::CONFLICT,
            DashboardError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
            DashboardError::Settings(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

async fn require_api_key(State(app): State<AppState>, req: Request, next: Next) -> Result<Response, StatusCode> {
    if req.uri().path().starts_with("/health") {
        return Ok(next.run(req).await);
    }

    let Some(expected) = app.api_key.as_deref().filter(|k| !k.is_empty()) else {
        warn!("SECURITY: FIELDWATCH_API_KEY not set - API access denied");
        return Err(StatusCode::UNAUTHORIZED);
    };

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false);

    if !ok {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/state", get(get_state))
        .route("/notices", get(take_notices))
        .route("/map", get(get_map))
        .route("/chart", get(get_chart))
        .route("/command/toggle", post(toggle))
        .route("/thresholds", put(put_thresholds))
        .route("/config", post(post_config))
        .route("/project", post(post_project))
        .route("/import", post(post_import))
        .route("/settings/open", post(open_settings))
        .route("/settings/close", post(close_settings))
        .route("/settings/focus", post(focus_input))
        .route("/settings/blur", post(blur_input))
        .route("/settings/input", post(type_input))
        .route("/settings/submit", post(submit_settings))
        .route("/chart/select", post(select_point))
        .layer(middleware::from_fn_with_state(app_state.clone(), require_api_key))
        .with_state(app_state)
}

fn now() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

#[derive(Serialize)]
struct StateResponse {
    store_id: String,
    #[serde(flatten)]
    view: DashboardView,
}

// GET /state
async fn get_state(State(app): State<AppState>) -> Json<StateResponse> {
    let view = app.dashboard.lock().view();
    Json(StateResponse {
        store_id: app.store_id.clone(),
        view,
    })
}

// GET /notices (drains)
async fn take_notices(State(app): State<AppState>) -> Json<Vec<Notice>> {
    Json(app.dashboard.lock().take_notices())
}

async fn get_map(State(app): State<AppState>) -> Json<MapState> {
    Json(app.map.state())
}

async fn get_chart(State(app): State<AppState>) -> Json<ChartState> {
    Json(app.chart.state())
}

// POST /command/toggle
async fn toggle(State(app): State<AppState>) -> Result<Json<Value>, ApiError> {
    let command = app.dashboard.lock().toggle_recording()?;
    Ok(Json(json!({ "command": command })))
}

#[derive(Debug, Deserialize)]
struct ThresholdInput {
    a: Value,
    b: Value,
    c: Value,
}

// Operators may send numbers or the raw text of the inputs.
fn input_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

// PUT /thresholds
async fn put_thresholds(
    State(app): State<AppState>,
    Json(input): Json<ThresholdInput>,
) -> Result<Json<Value>, ApiError> {
    let cfg = app
        .dashboard
        .lock()
        .commit_thresholds(&input_text(&input.a), &input_text(&input.b), &input_text(&input.c))?;
    Ok(Json(json!({ "thresholds": cfg })))
}

// POST /config
async fn post_config(State(app): State<AppState>, Json(patch): Json<ConfigPatch>) -> Result<StatusCode, ApiError> {
    app.dashboard.lock().propose_config_update(patch, now())?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize)]
struct ProjectRequest {
    target: String,
    #[serde(default)]
    patch: ConfigPatch,
}

// POST /project
async fn post_project(
    State(app): State<AppState>,
    Json(req): Json<ProjectRequest>,
) -> Result<Json<Value>, ApiError> {
    let mut d = app.dashboard.lock();
    d.switch_project(&req.target, req.patch, now())?;
    Ok(Json(json!({ "namespace": d.namespace(), "state": d.state() })))
}

#[derive(Debug, Deserialize)]
struct ImportRequest {
    target: String,
    samples: Vec<Value>,
}

// POST /import
async fn post_import(State(app): State<AppState>, Json(req): Json<ImportRequest>) -> Result<Json<Value>, ApiError> {
    let total = req.samples.len();
    let samples: Vec<_> = req.samples.iter().filter_map(normalize).collect();
    let imported = app.dashboard.lock().import_history(&req.target, samples, now())?;
    Ok(Json(json!({ "imported": imported, "skipped": total - imported })))
}

async fn open_settings(State(app): State<AppState>) -> Result<StatusCode, ApiError> {
    app.dashboard.lock().open_settings()?;
    Ok(StatusCode::NO_CONTENT)
}

async fn close_settings(State(app): State<AppState>) -> StatusCode {
    app.dashboard.lock().close_settings();
    StatusCode::NO_CONTENT
}

#[derive(Debug, Deserialize)]
struct FieldRequest {
    field: InputField,
}

async fn focus_input(State(app): State<AppState>, Json(req): Json<FieldRequest>) -> StatusCode {
    app.dashboard.lock().focus_input(req.field);
    StatusCode::NO_CONTENT
}

async fn blur_input(State(app): State<AppState>, Json(req): Json<FieldRequest>) -> StatusCode {
    app.dashboard.lock().blur_input(req.field);
    StatusCode::NO_CONTENT
}

#[derive(Debug, Deserialize)]
struct InputRequest {
    field: InputField,
    text: String,
}

// POST /settings/input (typing into the editor)
async fn type_input(State(app): State<AppState>, Json(req): Json<InputRequest>) -> Response {
    match req.field {
        InputField::Config(field) => {
            app.dashboard.lock().type_into(field, &req.text);
            StatusCode::NO_CONTENT.into_response()
        }
        InputField::Threshold(_) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "error": "thresholds are committed through PUT /thresholds" })),
        )
            .into_response(),
    }
}

async fn submit_settings(State(app): State<AppState>) -> Result<StatusCode, ApiError> {
    app.dashboard.lock().submit_editor(now())?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize)]
struct SelectRequest {
    key: String,
}

// POST /chart/select
async fn select_point(State(app): State<AppState>, Json(req): Json<SelectRequest>) -> Result<Json<Value>, ApiError> {
    let position = app.dashboard.lock().select_chart_point(&req.key)?;
    Ok(Json(json!({ "key": req.key, "position": position })))
}
