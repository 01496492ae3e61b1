//! Client-facing error responses.
//!
//! Every pipeline failure is translated here into an HTTP status plus a
//! short machine-readable reason code. Client-caused failures (bad path,
//! unsupported format, oversized source) map to 4xx; origin and
//! infrastructure failures map to 5xx.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::pipeline::{
    detect::DetectError, fetch::FetchError, transform::TransformError, PipelineError,
};

/// JSON error body.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub status: u16,
    pub code: String,
    pub detail: String,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub detail: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, detail: impl Into<String>) -> Self {
        Self {
            status,
            code,
            detail: detail.into(),
        }
    }

    pub fn bad_request(code: &'static str, detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, detail)
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        let detail = err.to_string();
        match err {
            PipelineError::InvalidPath(_) => Self::new(StatusCode::BAD_REQUEST, "bad_path", detail),
            PipelineError::InvalidDimensions => {
                Self::new(StatusCode::BAD_REQUEST, "bad_dimensions", detail)
            }
            PipelineError::Fetch(fetch) => match fetch {
                FetchError::Timeout => {
                    Self::new(StatusCode::GATEWAY_TIMEOUT, "upstream_timeout", detail)
                }
                FetchError::Upstream { .. } => {
                    Self::new(StatusCode::BAD_GATEWAY, "upstream_status", detail)
                }
                FetchError::Network(_) => Self::new(StatusCode::BAD_GATEWAY, "network", detail),
                FetchError::TooLarge { .. } => {
                    Self::new(StatusCode::PAYLOAD_TOO_LARGE, "too_large", detail)
                }
            },
            PipelineError::Detect(DetectError::Unsupported { .. }) => Self::new(
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                "unsupported_format",
                detail,
            ),
            PipelineError::Transform(transform) => match transform {
                TransformError::Decode(_) => {
                    Self::new(StatusCode::UNPROCESSABLE_ENTITY, "decode_failed", detail)
                }
                TransformError::TooLarge { .. } => {
                    Self::new(StatusCode::PAYLOAD_TOO_LARGE, "too_large", detail)
                }
                TransformError::Encode(_) => {
                    Self::new(StatusCode::INTERNAL_SERVER_ERROR, "encode_failed", detail)
                }
            },
            PipelineError::Internal(_) => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", detail)
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            status: self.status.as_u16(),
            code: self.code.to_string(),
            detail: self.detail,
        };
        (self.status, Json(body)).into_response()
    }
}
