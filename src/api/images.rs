//! Image endpoint: the thin glue between HTTP and the pipeline.
//!
//! Builds a normalized `ImageRequest` from the wildcard path and query
//! parameters, runs the serving coordinator, and writes the bytes back
//! with the final content type.

use axum::{
    extract::{rejection::QueryRejection, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde::Deserialize;

use crate::pipeline::{detect::ImageFormat, ImageRequest};
use crate::state::AppState;

use super::error::ApiError;

/// Largest accepted target dimension. Keeps a hostile query from asking
/// for a multi-gigapixel upscale.
const MAX_TARGET_DIMENSION: u32 = 10_000;

#[derive(Debug, Deserialize)]
pub struct TransformParams {
    w: Option<u32>,
    h: Option<u32>,
    format: Option<String>,
}

pub fn routes() -> Router<AppState> {
    Router::new().route("/images/{*path}", get(serve_image))
}

async fn serve_image(
    State(state): State<AppState>,
    Path(path): Path<String>,
    params: Result<Query<TransformParams>, QueryRejection>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    // Unparseable query values get the same JSON error shape as every
    // other client error, not the extractor's plain-text rejection.
    let Query(params) = params.map_err(|e| ApiError::bad_request("bad_query", e.body_text()))?;

    for dim in [params.w, params.h].into_iter().flatten() {
        if dim > MAX_TARGET_DIMENSION {
            return Err(ApiError::bad_request(
                "bad_dimensions",
                format!("target dimensions must be in 1..={MAX_TARGET_DIMENSION}"),
            ));
        }
    }

    let format_override = match &params.format {
        Some(value) => Some(value.parse::<ImageFormat>().map_err(|e| {
            ApiError::new(StatusCode::UNSUPPORTED_MEDIA_TYPE, "unsupported_format", e)
        })?),
        None => negotiate_format(&headers),
    };

    let request = ImageRequest::new(&path, params.w, params.h, format_override)?;
    let served = state.service().serve(&request).await?;

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, served.content_type)],
        served.bytes,
    )
        .into_response())
}

/// Accept-header negotiation when no explicit format was requested: a
/// client advertising WEBP support gets WEBP output.
fn negotiate_format(headers: &HeaderMap) -> Option<ImageFormat> {
    let accept = headers.get(header::ACCEPT)?.to_str().ok()?;
    accept
        .split(',')
        .map(|part| part.split(';').next().unwrap_or(part).trim())
        .find_map(|mime| (mime == "image/webp").then_some(ImageFormat::Webp))
}
