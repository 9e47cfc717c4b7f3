//! Email engagement tracking
//!
//! The open pixel is unauthenticated by nature; it answers with the GIF for
//! unknown log ids too, so probing reveals nothing. Click-throughs carry an
//! HMAC binding the target URL to the usage log that sent it; a bad
//! signature is logged as a security event with the caller's IP.

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

use rebill_recovery::emails::verify_click_signature;

use crate::auth::client_ip_from_headers;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// 1x1 transparent GIF.
const PIXEL_GIF: &[u8] = &[
    0x47, 0x49, 0x46, 0x38, 0x39, 0x61, 0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00,
    0x00, 0xFF, 0xFF, 0xFF, 0x21, 0xF9, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, 0x2C, 0x00, 0x00,
    0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x02, 0x02, 0x44, 0x01, 0x00, 0x3B,
];

fn pixel_response() -> Response {
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "image/gif"),
            (header::CACHE_CONTROL, "no-store, max-age=0"),
        ],
        PIXEL_GIF,
    )
        .into_response()
}

pub async fn open_pixel(
    State(state): State<AppState>,
    Path(log_id): Path<i64>,
) -> ApiResult<Response> {
    let known = state.recovery.usage.record_open(log_id).await?;
    if !known {
        tracing::debug!(log_id, "Open pixel hit for unknown usage log");
    }
    Ok(pixel_response())
}

#[derive(Debug, Deserialize)]
pub struct ClickQuery {
    pub url: String,
    #[serde(rename = "logId")]
    pub log_id: i64,
    pub sig: String,
}

pub async fn click(
    State(state): State<AppState>,
    Query(query): Query<ClickQuery>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let valid = verify_click_signature(
        &state.config.session_secret,
        &query.url,
        query.log_id,
        &query.sig,
    );
    if !valid {
        tracing::warn!(
            ip = %client_ip_from_headers(&headers),
            log_id = query.log_id,
            "Click tracking called with bad signature"
        );
        return Err(ApiError::Forbidden);
    }

    state.recovery.usage.record_click(query.log_id).await?;

    Ok((
        StatusCode::FOUND,
        [(header::LOCATION, query.url.as_str())],
    )
        .into_response())
}
