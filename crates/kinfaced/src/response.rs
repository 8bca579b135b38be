//! Response envelope and error-to-status mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use kinface_core::AnalysisError;
use kinface_img::ImageInputError;
use serde::Serialize;
use std::time::Instant;
use uuid::Uuid;

use crate::engine::EngineError;

#[derive(Debug, Serialize)]
pub struct Metadata {
    pub processing_time_ms: f64,
    pub model_version: String,
    pub request_id: Uuid,
    pub timestamp: DateTime<Utc>,
}

impl Metadata {
    pub fn new(started: Instant, model_version: &str) -> Self {
        let ms = started.elapsed().as_secs_f64() * 1000.0;
        Self {
            processing_time_ms: (ms * 100.0).round() / 100.0,
            model_version: model_version.to_string(),
            request_id: Uuid::new_v4(),
            timestamp: Utc::now(),
        }
    }
}

/// `{success: true, data, metadata}`
#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    pub success: bool,
    pub data: T,
    pub metadata: Metadata,
}

impl<T: Serialize> Envelope<T> {
    pub fn ok(data: T, started: Instant, model_version: &str) -> Json<Self> {
        Json(Self {
            success: true,
            data,
            metadata: Metadata::new(started, model_version),
        })
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
    details: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    success: bool,
    error: ErrorBody,
}

/// Errors a handler can return; each maps to one status and error code.
#[derive(Debug)]
pub enum ApiError {
    InvalidInput(String),
    Unauthorized,
    PayloadTooLarge(String),
    ModelUnavailable,
    Processing(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::ModelUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Processing(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::InvalidInput(_) => "INVALID_INPUT",
            ApiError::Unauthorized => "UNAUTHORIZED",
            ApiError::PayloadTooLarge(_) => "PAYLOAD_TOO_LARGE",
            ApiError::ModelUnavailable => "MODEL_UNAVAILABLE",
            ApiError::Processing(_) => "PROCESSING_ERROR",
        }
    }

    fn message_and_details(&self) -> (String, serde_json::Value) {
        match self {
            ApiError::InvalidInput(msg) | ApiError::PayloadTooLarge(msg) => (msg.clone(), serde_json::json!({})),
            ApiError::Unauthorized => ("invalid or missing API key".to_string(), serde_json::json!({})),
            ApiError::ModelUnavailable => (
                "face model is not loaded".to_string(),
                serde_json::json!({}),
            ),
            ApiError::Processing(original) => (
                "an error occurred while processing the request".to_string(),
                serde_json::json!({ "original_error": original }),
            ),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (message, details) = self.message_and_details();
        let body = ErrorEnvelope {
            success: false,
            error: ErrorBody {
                code: self.code(),
                message,
                details,
            },
        };
        (self.status(), Json(body)).into_response()
    }
}

impl From<AnalysisError> for ApiError {
    fn from(e: AnalysisError) -> Self {
        if e.is_input_error() {
            ApiError::InvalidInput(e.to_string())
        } else {
            ApiError::Processing(e.to_string())
        }
    }
}

impl From<ImageInputError> for ApiError {
    fn from(e: ImageInputError) -> Self {
        match e {
            ImageInputError::TooLarge { .. } => ApiError::PayloadTooLarge(e.to_string()),
            other => ApiError::InvalidInput(other.to_string()),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::ChannelClosed => ApiError::ModelUnavailable,
            other => ApiError::Processing(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(ApiError::InvalidInput("x".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::PayloadTooLarge("x".into()).status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(ApiError::ModelUnavailable.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(ApiError::Processing("x".into()).status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_analysis_error_mapping() {
        let e: ApiError = AnalysisError::NoFace("source").into();
        assert_eq!(e.code(), "INVALID_INPUT");
        let e: ApiError = AnalysisError::Similarity(kinface_core::similarity::SimilarityError::ZeroNorm).into();
        assert_eq!(e.code(), "PROCESSING_ERROR");
    }

    #[test]
    fn test_image_error_mapping() {
        let e: ApiError = ImageInputError::TooLarge { size: 20, limit: 10 }.into();
        assert_eq!(e.status(), StatusCode::PAYLOAD_TOO_LARGE);
        let e: ApiError = ImageInputError::NotDataUrl.into();
        assert_eq!(e.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_envelope_shape() {
        let Json(env) = Envelope::ok(serde_json::json!({"k": 1}), Instant::now(), "buffalo_l");
        let v = serde_json::to_value(&env).unwrap();
        assert_eq!(v["success"], true);
        assert_eq!(v["data"]["k"], 1);
        assert_eq!(v["metadata"]["model_version"], "buffalo_l");
        assert!(v["metadata"]["request_id"].as_str().unwrap().len() == 36);
        assert!(v["metadata"]["timestamp"].is_string());
    }
}
