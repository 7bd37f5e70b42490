//! HTTP control surface.
//!
//! Thin JSON wrappers over [`MotionCoordinator`] and [`TourController`]. Every
//! core call does blocking serial I/O, so handlers hand it to the tokio
//! blocking pool instead of running it on the async executor.
//!
//! Routes:
//! - `POST /api/pan/start {"direction": -1|0|1}`
//! - `POST /api/stop`, `/api/energize`, `/api/deenergize`, `/api/reset`
//! - `POST /api/learn {"slot": n}`, `POST /api/goto {"slot": n}`
//! - `POST /api/tour/start`, `/api/tour/stop`, `/api/tour/delay {"delay": s}`
//! - `GET /api/status`, `GET /api/presets`, `DELETE /api/presets/:slot`
//!
//! A web UI directory, when given, supplies `index.html` at `/` and the rest
//! of its files under `/static`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use clap::Args;
use serde::{Deserialize, Serialize};
use tower_http::services::{ServeDir, ServeFile};
use tracing::{error, info, warn};

use crate::coordinator::{MotionCoordinator, MountStatus, PanDirection};
use crate::error::{MountError, MountResult};
use crate::presets::PresetMap;
use crate::tour::{TourController, TourStart, TourState};

/// HTTP server settings.
#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:8000")]
    pub bind: SocketAddr,

    /// Web UI directory: `index.html` is served at `/`, other files under `/static`
    #[arg(long)]
    pub web_dir: Option<PathBuf>,
}

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<MotionCoordinator>,
    pub tour: Arc<TourController>,
}

#[derive(Debug, Deserialize)]
pub struct PanRequest {
    pub direction: i32,
}

#[derive(Debug, Deserialize)]
pub struct SlotRequest {
    pub slot: u32,
}

#[derive(Debug, Deserialize)]
pub struct DelayRequest {
    pub delay: f64,
}

/// Reply to every command route.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slot: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay: Option<f64>,
}

impl CommandResponse {
    fn status(status: &'static str) -> Self {
        Self {
            status,
            slot: None,
            position: None,
            delay: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusResponse {
    #[serde(flatten)]
    pub mount: MountStatus,
    pub tour: TourState,
    pub tour_delay: f64,
}

#[derive(Debug)]
pub enum ApiError {
    Mount(MountError),
    /// The blocking task panicked or was cancelled.
    Internal(String),
}

impl From<MountError> for ApiError {
    fn from(e: MountError) -> Self {
        ApiError::Mount(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Mount(e) => {
                let status = match e {
                    MountError::Device(_) => StatusCode::SERVICE_UNAVAILABLE,
                    MountError::InvalidDirection(_) | MountError::InvalidDelay(_) => {
                        StatusCode::UNPROCESSABLE_ENTITY
                    }
                    MountError::Presets(_) | MountError::InvalidConfig(_) | MountError::Io(_) => {
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                (status, e.to_string())
            }
            ApiError::Internal(message) => (StatusCode::INTERNAL_SERVER_ERROR, message),
        };

        if status.is_server_error() {
            error!("Request failed: {message}");
        } else {
            warn!("Rejected request: {message}");
        }
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> MountResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::Internal(format!("worker task failed: {e}")))?
        .map_err(ApiError::from)
}

pub async fn pan_start(
    State(state): State<AppState>,
    Json(req): Json<PanRequest>,
) -> ApiResult<CommandResponse> {
    let direction = PanDirection::try_from(req.direction)?;
    blocking(move || state.coordinator.pan(direction)).await?;
    let status = match direction {
        PanDirection::Stop => "stopped",
        _ => "moving",
    };
    Ok(Json(CommandResponse::status(status)))
}

pub async fn stop(State(state): State<AppState>) -> ApiResult<CommandResponse> {
    blocking(move || state.coordinator.stop()).await?;
    Ok(Json(CommandResponse::status("stopped")))
}

pub async fn energize(State(state): State<AppState>) -> ApiResult<CommandResponse> {
    blocking(move || state.coordinator.energize()).await?;
    Ok(Json(CommandResponse::status("energized")))
}

pub async fn deenergize(State(state): State<AppState>) -> ApiResult<CommandResponse> {
    blocking(move || state.coordinator.deenergize()).await?;
    Ok(Json(CommandResponse::status("deenergized")))
}

pub async fn reset(State(state): State<AppState>) -> ApiResult<CommandResponse> {
    blocking(move || state.coordinator.reset_position()).await?;
    Ok(Json(CommandResponse::status("reset")))
}

pub async fn learn(
    State(state): State<AppState>,
    Json(req): Json<SlotRequest>,
) -> ApiResult<CommandResponse> {
    let position = blocking(move || state.coordinator.learn(req.slot)).await?;
    Ok(Json(CommandResponse {
        slot: Some(req.slot),
        position: Some(position),
        ..CommandResponse::status("saved")
    }))
}

pub async fn goto(
    State(state): State<AppState>,
    Json(req): Json<SlotRequest>,
) -> ApiResult<CommandResponse> {
    let position = blocking(move || state.coordinator.goto(req.slot)).await?;
    let status = if position.is_some() {
        "moving"
    } else {
        "not found"
    };
    Ok(Json(CommandResponse {
        slot: Some(req.slot),
        position,
        ..CommandResponse::status(status)
    }))
}

pub async fn tour_start(State(state): State<AppState>) -> ApiResult<CommandResponse> {
    let status = match blocking(move || state.tour.start_tour()).await? {
        TourStart::Started { .. } => "tour started",
        TourStart::AlreadyRunning => "tour already running",
        TourStart::NoPresets => "no presets",
    };
    Ok(Json(CommandResponse::status(status)))
}

pub async fn tour_stop(State(state): State<AppState>) -> ApiResult<CommandResponse> {
    blocking(move || state.tour.stop_tour()).await?;
    Ok(Json(CommandResponse::status("tour stopped")))
}

pub async fn tour_delay(
    State(state): State<AppState>,
    Json(req): Json<DelayRequest>,
) -> ApiResult<CommandResponse> {
    let delay = state.tour.set_tour_delay(req.delay)?;
    Ok(Json(CommandResponse {
        delay: Some(delay),
        ..CommandResponse::status("delay updated")
    }))
}

pub async fn status(State(state): State<AppState>) -> ApiResult<StatusResponse> {
    let tour = Arc::clone(&state.tour);
    let mount = blocking(move || state.coordinator.status()).await?;
    Ok(Json(StatusResponse {
        mount,
        tour: tour.state(),
        tour_delay: tour.tour_delay(),
    }))
}

pub async fn presets(State(state): State<AppState>) -> ApiResult<PresetMap> {
    let presets = blocking(move || state.coordinator.presets()).await?;
    Ok(Json(presets))
}

pub async fn forget_preset(
    State(state): State<AppState>,
    Path(slot): Path<u32>,
) -> ApiResult<CommandResponse> {
    let removed = blocking(move || state.coordinator.forget(slot)).await?;
    Ok(Json(CommandResponse {
        slot: Some(slot),
        ..CommandResponse::status(if removed { "deleted" } else { "not found" })
    }))
}

/// API routes, plus the static UI when `web_dir` is set.
pub fn router(state: AppState, web_dir: Option<PathBuf>) -> Router {
    let api = Router::new()
        .route("/api/pan/start", post(pan_start))
        .route("/api/stop", post(stop))
        .route("/api/energize", post(energize))
        .route("/api/deenergize", post(deenergize))
        .route("/api/reset", post(reset))
        .route("/api/learn", post(learn))
        .route("/api/goto", post(goto))
        .route("/api/tour/start", post(tour_start))
        .route("/api/tour/stop", post(tour_stop))
        .route("/api/tour/delay", post(tour_delay))
        .route("/api/status", get(status))
        .route("/api/presets", get(presets))
        .route("/api/presets/:slot", delete(forget_preset))
        .with_state(state);

    match web_dir {
        Some(dir) => api
            .route_service("/", ServeFile::new(dir.join("index.html")))
            .nest_service("/static", ServeDir::new(dir)),
        None => api,
    }
}

/// Serve until Ctrl-C, then stop any tour and the motor.
pub async fn run_server(state: AppState, args: ServerArgs) -> anyhow::Result<()> {
    if let Some(dir) = &args.web_dir {
        if !dir.is_dir() {
            anyhow::bail!("Web UI directory {} does not exist", dir.display());
        }
        if !dir.join("index.html").is_file() {
            warn!("No index.html in {}", dir.display());
        }
        info!("Serving web UI from {}", dir.display());
    }

    let app = router(state.clone(), args.web_dir);
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    info!("Pan mount server listening on http://{}", args.bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {e}");
            }
            info!("Shutting down...");
        })
        .await?;

    let tour = Arc::clone(&state.tour);
    if let Err(e) = blocking(move || tour.stop_tour()).await {
        warn!("Could not stop motion on shutdown: {e:?}");
    }
    Ok(())
}
