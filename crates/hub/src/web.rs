use anyhow::Context;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use std::env;
use std::net::SocketAddr;
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::info;

use pump_engine::{ControlCommand, EngineError};

use crate::config::{CalibrationEntry, Config, PumpEntry};
use crate::state::{SharedState, StatusResponse};

#[derive(Clone)]
pub struct AppState {
    pub shared: SharedState,
    /// Operator commands share the poller's channel to the sink.
    pub commands: mpsc::Sender<ControlCommand>,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/settings", get(api_settings).put(api_update_settings))
        .route("/api/pump", post(api_pump))
        .route("/api/auto", post(api_auto))
        .route("/api/maintenance", post(api_maintenance))
        .route("/api/daily-reset", post(api_daily_reset))
        .route("/api/maintenance-reset", post(api_maintenance_reset))
        .route("/api/clear-error", post(api_clear_error))
        .route("/api/trip", post(api_trip))
        .with_state(state)
}

#[derive(Deserialize)]
struct Toggle {
    on: bool,
}

/// Replacement calibration and pump policy. Keys left out of a section
/// take their defaults.
#[derive(Deserialize)]
struct SettingsUpdate {
    calibration: CalibrationEntry,
    pump: PumpEntry,
}

#[derive(Deserialize)]
struct Trip {
    #[serde(default)]
    reason: String,
}

async fn api_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let st = state.shared.read().await;
    Json(st.to_status())
}

async fn api_settings(State(state): State<AppState>) -> Json<Config> {
    let st = state.shared.read().await;
    Json(Config::from(&st.settings))
}

async fn api_update_settings(
    State(state): State<AppState>,
    Json(body): Json<SettingsUpdate>,
) -> Result<Json<Config>, ApiError> {
    let mut st = state.shared.write().await;
    let next = st
        .settings
        .with_policy(body.calibration, body.pump)
        .map_err(|e| ApiError::Invalid(format!("{e:#}")))?;
    st.apply_settings(next);
    Ok(Json(Config::from(&st.settings)))
}

async fn api_pump(
    State(state): State<AppState>,
    Json(body): Json<Toggle>,
) -> Result<Json<StatusResponse>, ApiError> {
    let cmd = {
        let mut st = state.shared.write().await;
        let cmd = st.engine.request_manual(body.on)?;
        st.record_system(format!("operator requested {cmd}"));
        cmd
    };
    queue(&state, cmd).await
}

async fn api_auto(
    State(state): State<AppState>,
    Json(body): Json<Toggle>,
) -> Result<Json<StatusResponse>, ApiError> {
    let cmd = {
        let mut st = state.shared.write().await;
        let cmd = st.engine.request_auto(body.on)?;
        st.record_system(format!("operator requested {cmd}"));
        cmd
    };
    queue(&state, cmd).await
}

async fn api_maintenance(
    State(state): State<AppState>,
    Json(body): Json<Toggle>,
) -> Json<StatusResponse> {
    let mut st = state.shared.write().await;
    if st.engine.maintenance_requested() != body.on {
        st.engine.set_maintenance(body.on);
        let detail = if body.on {
            "maintenance requested"
        } else {
            "maintenance released"
        };
        st.record_system(detail.to_string());
    }
    Json(st.to_status())
}

async fn api_daily_reset(State(state): State<AppState>) -> Json<StatusResponse> {
    let mut st = state.shared.write().await;
    st.engine.reset_daily_runs();
    st.record_system("daily runs reset".to_string());
    Json(st.to_status())
}

async fn api_maintenance_reset(
    State(state): State<AppState>,
) -> Result<Json<StatusResponse>, ApiError> {
    let mut st = state.shared.write().await;
    st.engine.maintenance_reset()?;
    st.record_system("runtime and run counters reset".to_string());
    Ok(Json(st.to_status()))
}

async fn api_clear_error(State(state): State<AppState>) -> Result<Json<StatusResponse>, ApiError> {
    let mut st = state.shared.write().await;
    st.engine.clear_error()?;
    st.record_system("fault cleared".to_string());
    Ok(Json(st.to_status()))
}

async fn api_trip(State(state): State<AppState>, Json(body): Json<Trip>) -> Json<StatusResponse> {
    let reason = match body.reason.trim() {
        "" => "emergency stop".to_string(),
        r => r.to_string(),
    };
    let mut st = state.shared.write().await;
    st.engine.trip(reason.as_str(), OffsetDateTime::now_utc());
    st.record_error(format!("pump tripped: {reason}"));
    Json(st.to_status())
}

/// Hand a command to the sink. The state lock must not be held here: the
/// sink takes it after publishing.
async fn queue(state: &AppState, cmd: ControlCommand) -> Result<Json<StatusResponse>, ApiError> {
    state
        .commands
        .send(cmd)
        .await
        .map_err(|_| ApiError::SinkClosed)?;
    let st = state.shared.read().await;
    Ok(Json(st.to_status()))
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

enum ApiError {
    Rejected(EngineError),
    Invalid(String),
    SinkClosed,
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        ApiError::Rejected(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Rejected(e) => (StatusCode::CONFLICT, e.to_string()),
            ApiError::Invalid(msg) => (StatusCode::CONFLICT, msg),
            ApiError::SinkClosed => (
                StatusCode::SERVICE_UNAVAILABLE,
                "command sink unavailable".to_string(),
            ),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState) -> anyhow::Result<()> {
    let port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {addr}"))?;

    info!(%addr, "api listening");

    axum::serve(listener, router(state))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================
