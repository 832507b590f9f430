//! HTTP transport shim exposing the §6 external operations over axum.
//!
//! Out of scope as a *designed* contract (§1: no wire-format
//! versioning, auth, or multi-client concerns are specified) — this is
//! the reference's thin `Router`-over-`State<Arc<AppState>>` pattern
//! carried over so the crate runs end-to-end, pattern-matched on the
//! reference's own route list rather than a spec'd API surface.

use std::sync::Arc;

use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::error;

use crate::driver::FakeSensorDriver;
use crate::error::CoreError;
use crate::facade::{ColorMatchingFacade, StandardCalibrationKind};
use crate::trainer::MatrixSlot;

/// Shared application state. The demo server runs against
/// `FakeSensorDriver` since no concrete I2C backend is in scope (§1);
/// swapping in a real `SensorDriver` impl is the only change a
/// production integration needs here.
pub struct AppState {
    pub facade: Mutex<ColorMatchingFacade<FakeSensorDriver>>,
}

fn core_error_response(e: CoreError) -> impl IntoResponse {
    let status = match &e {
        CoreError::InsufficientData(_) | CoreError::InvalidMatrix(_) => StatusCode::BAD_REQUEST,
        CoreError::QualityTooLow(_) => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::SERVICE_UNAVAILABLE,
    };
    error!("operation failed: {}", e);
    (
        status,
        Json(serde_json::json!({ "error": e.kind(), "message": e.to_string() })),
    )
}

async fn get_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let facade = state.facade.lock();
    Json(facade.get_device_status())
}

async fn post_scan(State(state): State<Arc<AppState>>) -> axum::response::Response {
    let mut facade = state.facade.lock();
    match facade.scan() {
        Ok(result) => Json(result).into_response(),
        Err(e) => core_error_response(e).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct SetLedRequest {
    brightness: u8,
    r: Option<u8>,
    g: Option<u8>,
    b: Option<u8>,
    keep_on: Option<bool>,
    enhanced: Option<bool>,
}

async fn post_led(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SetLedRequest>,
) -> impl IntoResponse {
    let mut facade = state.facade.lock();
    let rgb = match (req.r, req.g, req.b) {
        (Some(r), Some(g), Some(b)) => Some((r, g, b)),
        _ => None,
    };
    Json(facade.set_led(req.brightness, rgb, req.keep_on, req.enhanced))
}

#[derive(Debug, Deserialize)]
struct StandardCalibrationRequest {
    kind: StandardCalibrationKind,
    brightness: Option<u8>,
}

async fn post_standard_calibration(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StandardCalibrationRequest>,
) -> impl IntoResponse {
    let mut facade = state.facade.lock();
    Json(facade.start_standard_calibration(req.kind, req.brightness))
}

#[derive(Debug, Deserialize)]
struct StartMatrixCalibrationRequest {
    slot: MatrixSlot,
}

async fn post_start_matrix_calibration(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StartMatrixCalibrationRequest>,
) -> impl IntoResponse {
    let mut facade = state.facade.lock();
    Json(facade.start_matrix_calibration(req.slot))
}

#[derive(Debug, Deserialize)]
struct MeasureMatrixCalibrationRequest {
    index: usize,
    ref_r: u8,
    ref_g: u8,
    ref_b: u8,
    name: String,
}

async fn post_measure_matrix_calibration(
    State(state): State<Arc<AppState>>,
    Json(req): Json<MeasureMatrixCalibrationRequest>,
) -> axum::response::Response {
    let mut facade = state.facade.lock();
    match facade.measure_matrix_calibration(req.index, (req.ref_r, req.ref_g, req.ref_b), &req.name) {
        Ok(result) => Json(result).into_response(),
        Err(e) => core_error_response(e).into_response(),
    }
}

async fn post_compute_matrix_calibration(
    State(state): State<Arc<AppState>>,
) -> axum::response::Response {
    let mut facade = state.facade.lock();
    match facade.compute_matrix_calibration() {
        Ok(result) => Json(result).into_response(),
        Err(e) => core_error_response(e).into_response(),
    }
}

async fn get_matrix_calibration_results(
    State(state): State<Arc<AppState>>,
) -> axum::response::Response {
    let facade = state.facade.lock();
    match facade.get_matrix_calibration_results() {
        Ok(result) => Json(result).into_response(),
        Err(e) => core_error_response(e).into_response(),
    }
}

#[derive(Debug, Deserialize, Default)]
struct ApplyMatrixCalibrationRequest {
    #[serde(default)]
    force: bool,
}

async fn post_apply_matrix_calibration(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ApplyMatrixCalibrationRequest>,
) -> axum::response::Response {
    let mut facade = state.facade.lock();
    match facade.apply_matrix_calibration(req.force) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => core_error_response(e).into_response(),
    }
}

async fn post_clear_matrix_calibration(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut facade = state.facade.lock();
    facade.clear_matrix_calibration();
    StatusCode::NO_CONTENT
}

#[derive(Debug, Serialize)]
struct InfoResponse {
    name: &'static str,
    version: &'static str,
}

async fn get_info() -> impl IntoResponse {
    Json(InfoResponse {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Build the router wiring every §6 operation to a route, with the
/// reference's permissive `CorsLayer` for local/dev use.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/info", get(get_info))
        .route("/api/status", get(get_status))
        .route("/api/scan", post(post_scan))
        .route("/api/led", post(post_led))
        .route("/api/calibration/standard", post(post_standard_calibration))
        .route("/api/calibration/matrix/start", post(post_start_matrix_calibration))
        .route("/api/calibration/matrix/measure", post(post_measure_matrix_calibration))
        .route("/api/calibration/matrix/compute", post(post_compute_matrix_calibration))
        .route("/api/calibration/matrix/results", get(get_matrix_calibration_results))
        .route("/api/calibration/matrix/apply", post(post_apply_matrix_calibration))
        .route("/api/calibration/matrix/clear", post(post_clear_matrix_calibration))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::RawSample;
    use crate::persistence::CalibrationStore;
    use crate::trainer::DeltaEMetric;

    fn test_state() -> (Arc<AppState>, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let driver = FakeSensorDriver::new(RawSample::new(8_000, 8_000, 8_000, 500, 0));
        let store = CalibrationStore::open(tmp.path()).unwrap();
        let facade = ColorMatchingFacade::new(driver, store, DeltaEMetric::CieLab76).unwrap();
        (
            Arc::new(AppState {
                facade: Mutex::new(facade),
            }),
            tmp,
        )
    }

    #[test]
    fn router_builds_without_panicking() {
        let (state, _tmp) = test_state();
        let _router = build_router(state);
    }
}
