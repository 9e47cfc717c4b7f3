//! Provider webhook ingress
//!
//! Order of defenses: per-IP rate limit, signature over the raw body, parse,
//! then the idempotency lock inside the handler. Signature failures return
//! 400 with no state mutation; duplicates return 200 `ignored` so the
//! provider stops redelivering.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde_json::json;

use rebill_recovery::webhooks::{verify_signature, WebhookHandler, WebhookOutcome};

use crate::auth::client_ip_from_headers;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

const SIGNATURE_HEADER: &str = "pp-signature";

/// Webhook deliveries allowed per IP per minute.
const WEBHOOK_RATE_LIMIT: u32 = 5;

pub async fn receive(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<serde_json::Value>> {
    let ip = client_ip_from_headers(&headers);

    let limit = state
        .rate_limiter
        .check(&format!("webhook:{ip}"), WEBHOOK_RATE_LIMIT)
        .await;
    if !limit.allowed {
        tracing::warn!(ip = %ip, "Webhook ingress rate limit hit");
        return Err(ApiError::RateLimited {
            retry_after: limit.retry_after_seconds,
        });
    }

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|h| h.to_str().ok())
        .ok_or(ApiError::SignatureInvalid)?;

    let secret = &state.recovery.provider.config().webhook_secret;
    if let Err(e) = verify_signature(secret, &body, signature) {
        tracing::warn!(ip = %ip, error = %e, "Webhook signature verification failed");
        return Err(ApiError::SignatureInvalid);
    }

    let event = WebhookHandler::parse_event(&body).map_err(ApiError::from)?;
    let event_id = event.id.clone();

    let outcome = state.recovery.webhooks.handle_event(event).await?;
    let status = match outcome {
        WebhookOutcome::Processed => "processed",
        WebhookOutcome::Ignored | WebhookOutcome::Duplicate => "ignored",
    };

    tracing::info!(event_id = %event_id, outcome = status, "Webhook handled");
    Ok(Json(json!({ "status": status })))
}
