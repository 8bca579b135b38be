use axum::extract::{Request, State};
use axum::http::header::CONTENT_LENGTH;
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::response::ApiError;
use crate::state::AppState;

const SLOW_REQUEST: Duration = Duration::from_secs(2);
const API_KEY_HEADER: &str = "x-api-key";
const PROCESSING_TIME_HEADER: &str = "x-processing-time";

/// Monitoring routes that stay reachable without an API key.
const UNAUTHENTICATED_PATHS: [&str; 4] = ["/health", "/ping", "/live", "/ready"];

/// Log every request, count it for `/metrics` and stamp the elapsed time.
/// Oversized bodies are refused from their declared length.
pub async fn track_requests(State(state): State<Arc<AppState>>, req: Request, next: Next) -> Response {
    let started = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let declared_len = req
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());

    let mut response = match declared_len {
        Some(len) if len > state.config.max_request_size() => {
            ApiError::PayloadTooLarge(format!(
                "request body of {len} bytes exceeds {} bytes",
                state.config.max_request_size()
            ))
            .into_response()
        }
        _ => next.run(req).await,
    };

    let elapsed = started.elapsed();
    let status = response.status();
    let slow = elapsed > SLOW_REQUEST;
    state.stats.record(elapsed, status.is_client_error() || status.is_server_error(), slow);

    if slow {
        tracing::warn!(%method, %path, status = status.as_u16(), elapsed_ms = elapsed.as_millis() as u64, "slow request");
    } else {
        tracing::info!(%method, %path, status = status.as_u16(), elapsed_ms = elapsed.as_millis() as u64, "request");
    }

    if let Ok(v) = HeaderValue::from_str(&format!("{:.3}", elapsed.as_secs_f64())) {
        response.headers_mut().insert(PROCESSING_TIME_HEADER, v);
    }
    response
}

/// Reject requests without the configured `x-api-key`, when enabled.
pub async fn require_api_key(State(state): State<Arc<AppState>>, req: Request, next: Next) -> Response {
    if !state.config.api_key_enabled || UNAUTHENTICATED_PATHS.contains(&req.uri().path()) {
        return next.run(req).await;
    }

    let presented = req.headers().get(API_KEY_HEADER).and_then(|v| v.to_str().ok());
    match (presented, state.config.api_key.as_deref()) {
        (Some(given), Some(expected)) if given == expected => next.run(req).await,
        _ => {
            tracing::warn!(path = req.uri().path(), "rejected request with invalid API key");
            ApiError::Unauthorized.into_response()
        }
    }
}
