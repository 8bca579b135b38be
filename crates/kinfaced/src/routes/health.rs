//! Liveness, readiness and service information routes.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use crate::response::ApiError;
use crate::state::{AppState, StatsSnapshot};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const DETECTOR_INPUT_SIZE: [u32; 2] = [640, 640];
const EMBEDDING_SIZE: usize = 512;
const SUPPORTED_FEATURES: [&str; 6] = [
    "face_detection",
    "face_comparison",
    "embedding_extraction",
    "batch_analysis",
    "family_similarity",
    "parent_search",
];

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub model_loaded: bool,
    pub version: &'static str,
    pub uptime_seconds: u64,
    pub started_at: DateTime<Utc>,
}

pub async fn root() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "service": "kinface",
        "version": VERSION,
        "health": "/health",
    }))
}

pub async fn health(State(state): State<Arc<AppState>>) -> Response {
    let loaded = state.model_loaded();
    let body = HealthStatus {
        status: if loaded { "healthy" } else { "unhealthy" },
        model_loaded: loaded,
        version: VERSION,
        uptime_seconds: state.uptime().as_secs(),
        started_at: state.started_utc,
    };
    let status = if loaded { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(body)).into_response()
}

pub async fn ping() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "message": "pong",
        "timestamp": Utc::now(),
        "version": VERSION,
    }))
}

pub async fn ready(State(state): State<Arc<AppState>>) -> Response {
    if state.model_loaded() {
        (StatusCode::OK, Json(serde_json::json!({ "ready": true }))).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "ready": false, "reason": "model not loaded" })),
        )
            .into_response()
    }
}

pub async fn live() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "alive": true }))
}

#[derive(Debug, Serialize)]
pub struct ModelInfo {
    pub model_name: String,
    pub model_version: String,
    pub input_size: [u32; 2],
    pub embedding_size: usize,
    pub supported_features: Vec<&'static str>,
}

pub async fn model_info(State(state): State<Arc<AppState>>) -> Result<Json<ModelInfo>, ApiError> {
    let engine = state.engine()?;
    Ok(Json(ModelInfo {
        model_name: state.config.model_name.clone(),
        model_version: engine.model_version().to_string(),
        input_size: DETECTOR_INPUT_SIZE,
        embedding_size: EMBEDDING_SIZE,
        supported_features: SUPPORTED_FEATURES.to_vec(),
    }))
}

#[derive(Debug, Serialize)]
pub struct Metrics {
    #[serde(flatten)]
    pub requests: StatsSnapshot,
    pub uptime_seconds: u64,
    pub model_loaded: bool,
}

pub async fn metrics(State(state): State<Arc<AppState>>) -> Json<Metrics> {
    Json(Metrics {
        requests: state.stats.snapshot(),
        uptime_seconds: state.uptime().as_secs(),
        model_loaded: state.model_loaded(),
    })
}
