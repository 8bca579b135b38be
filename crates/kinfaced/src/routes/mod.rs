//! HTTP routing.

mod faces;
mod health;

use axum::extract::DefaultBodyLimit;
use axum::middleware::from_fn_with_state;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;

use crate::middleware::{require_api_key, track_requests};
use crate::state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    let body_limit = state.config.max_request_size();

    Router::new()
        .route("/", get(health::root))
        .route("/health", get(health::health))
        .route("/ping", get(health::ping))
        .route("/ready", get(health::ready))
        .route("/live", get(health::live))
        .route("/model-info", get(health::model_info))
        .route("/metrics", get(health::metrics))
        .route("/compare-faces", post(faces::compare_faces))
        .route("/detect-faces", post(faces::detect_faces))
        .route("/extract-embedding", post(faces::extract_embedding))
        .route("/batch-analysis", post(faces::batch_analysis))
        .route("/compare-family-faces", post(faces::compare_family_faces))
        .route("/find-most-similar-parent", post(faces::find_most_similar_parent))
        // The last layer added runs first, so tracking also sees rejected requests.
        .layer(from_fn_with_state(state.clone(), require_api_key))
        .layer(from_fn_with_state(state.clone(), track_requests))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}
