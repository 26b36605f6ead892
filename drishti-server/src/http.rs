// HTTP surface: health, metrics, frame injection and the stream sockets

use axum::{
    body::{Body, Bytes},
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, warn};

use crate::encoding::decode_image;
use crate::metrics::Metrics;
use crate::transport::StreamTransport;
use crate::websocket::{raw_feed_handler, stream_handler, upload_handler};
use drishti_core::{ChannelOrder, PixelBuffer};
use drishti_eye::{FrameInjector, SchedulerStats};

/// Shared state for every route
#[derive(Clone)]
pub struct AppState {
    pub transport: Arc<StreamTransport>,
    pub scheduler: Arc<SchedulerStats>,
    pub metrics: Arc<Metrics>,
    /// Present only with the injected source
    pub injector: Option<FrameInjector>,
}

impl AppState {
    pub fn new(
        transport: Arc<StreamTransport>,
        scheduler: Arc<SchedulerStats>,
        injector: Option<FrameInjector>,
    ) -> Self {
        let metrics = Arc::new(Metrics::new(
            scheduler.clone(),
            transport.clone(),
            injector.clone(),
        ));
        Self {
            transport,
            scheduler,
            metrics,
            injector,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub sessions: usize,
    pub safe_mode: bool,
    pub fps: Option<f64>,
    pub frames_raw: u64,
    pub frames_inferred: u64,
    pub frames_dropped: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InjectResponse {
    pub accepted: bool,
}

/// Query for `POST /frames`. The body is `height * width * 3` bytes.
#[derive(Debug, Deserialize)]
pub struct FrameQuery {
    pub width: usize,
    pub height: usize,
    #[serde(default)]
    pub order: Option<String>,
}

/// Create the HTTP router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/frames", post(inject_frame_handler))
        .route("/frames/jpeg", post(inject_jpeg_handler))
        .route("/ws/stream", get(stream_handler))
        .route("/ws/raw_feed", get(raw_feed_handler))
        .route("/ws/upload", get(upload_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Health check endpoint
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.scheduler.snapshot();
    Json(HealthResponse {
        status: if stats.safe_mode { "degraded" } else { "healthy" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        sessions: state.transport.session_count(),
        safe_mode: stats.safe_mode,
        fps: stats.fps,
        frames_raw: stats.frames_raw,
        frames_inferred: stats.frames_inferred,
        frames_dropped: stats.frames_dropped,
    })
}

/// Metrics endpoint (Prometheus format)
async fn metrics_handler(State(state): State<AppState>) -> Response {
    let body = state.metrics.get_prometheus_metrics();
    match Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/plain; version=0.0.4")
        .body(Body::from(body))
    {
        Ok(response) => response,
        Err(e) => {
            error!("Failed to build metrics response: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub(crate) fn error_response(status: StatusCode, code: &str, error: impl Into<String>) -> Response {
    let body = Json(ErrorResponse {
        error: error.into(),
        code: code.to_string(),
    });
    (status, body).into_response()
}

/// Push one raw frame into the injected source
async fn inject_frame_handler(
    State(state): State<AppState>,
    Query(query): Query<FrameQuery>,
    body: Bytes,
) -> Response {
    let Some(injector) = &state.injector else {
        return injection_disabled();
    };

    let order = match query.order.as_deref().map(str::to_ascii_lowercase).as_deref() {
        None | Some("bgr") => ChannelOrder::Bgr,
        Some("rgb") => ChannelOrder::Rgb,
        Some(other) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "INVALID_ORDER",
                format!("Unknown channel order '{}'", other),
            );
        }
    };

    let pixels = match PixelBuffer::from_hwc(query.height, query.width, body.to_vec(), order) {
        Ok(pixels) => pixels,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, "INVALID_FRAME", e.to_string()),
    };

    push_frame(injector, pixels)
}

/// Push one JPEG-compressed frame, as a phone camera would send it
async fn inject_jpeg_handler(State(state): State<AppState>, body: Bytes) -> Response {
    let Some(injector) = &state.injector else {
        return injection_disabled();
    };

    match decode_image(&body) {
        Ok(pixels) => push_frame(injector, pixels),
        Err(e) => {
            warn!("Rejected uploaded frame: {}", e);
            error_response(StatusCode::BAD_REQUEST, "INVALID_IMAGE", e.to_string())
        }
    }
}

pub(crate) fn injection_disabled() -> Response {
    error_response(
        StatusCode::NOT_FOUND,
        "INJECTION_DISABLED",
        "Frame injection requires source.kind = injected",
    )
}

fn push_frame(injector: &FrameInjector, pixels: PixelBuffer) -> Response {
    if injector.push(pixels) {
        (StatusCode::ACCEPTED, Json(InjectResponse { accepted: true })).into_response()
    } else {
        debug!("Injected frame rejected: queue full");
        error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "QUEUE_FULL",
            "Frame queue is full, frame dropped",
        )
    }
}
