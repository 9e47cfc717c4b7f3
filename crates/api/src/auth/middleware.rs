//! Authentication middleware for Axum
//!
//! Three layers guard the HTTP surface:
//!
//! - `merchant_auth` trusts the auth provider's headers (`X-Auth-User-Id`,
//!   optional `X-Auth-Email`), resolves the merchant, and auto-provisions a
//!   FREE merchant on first sight. The provisioning race is safe because the
//!   auth user id column is unique and the loser falls back to a select.
//! - `worker_auth` / `admin_auth`: shared-secret headers compared in
//!   constant time.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use subtle::ConstantTimeEq;

use rebill_recovery::Merchant;

use crate::error::ApiError;
use crate::state::AppState;

const USER_ID_HEADER: &str = "x-auth-user-id";
const USER_EMAIL_HEADER: &str = "x-auth-email";
const WORKER_SECRET_HEADER: &str = "x-worker-secret";
const ADMIN_KEY_HEADER: &str = "x-admin-key";

/// The authenticated merchant, injected into request extensions.
#[derive(Debug, Clone)]
pub struct CurrentMerchant(pub Merchant);

fn header_value<'a>(request: &'a Request, name: &str) -> Option<&'a str> {
    request
        .headers()
        .get(name)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Extract the client IP from proxy headers, for security logging and the
/// webhook rate limit.
pub fn extract_client_ip(request: &Request) -> String {
    client_ip_from_headers(request.headers())
}

pub fn client_ip_from_headers(headers: &axum::http::HeaderMap) -> String {
    let value = |name: &str| {
        headers
            .get(name)
            .and_then(|h| h.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    if let Some(xff) = value("x-forwarded-for") {
        if let Some(first) = xff.split(',').next() {
            return first.trim().to_string();
        }
    }
    if let Some(real_ip) = value("x-real-ip") {
        return real_ip.to_string();
    }
    "unknown".to_string()
}

/// Constant-time comparison of a presented secret against the configured one.
/// An empty configured secret never matches; endpoints stay closed rather
/// than open when configuration is missing.
pub(crate) fn secret_matches(presented: &str, configured: &str) -> bool {
    if configured.is_empty() {
        return false;
    }
    presented.as_bytes().ct_eq(configured.as_bytes()).into()
}

/// Resolve (or provision) the merchant for the authenticated user and attach
/// it to the request.
pub async fn merchant_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(user_id) = header_value(&request, USER_ID_HEADER).map(str::to_string) else {
        return Err(ApiError::Unauthorized);
    };
    let email = header_value(&request, USER_EMAIL_HEADER).map(str::to_string);

    let merchant = state
        .recovery
        .merchants
        .find_or_provision(&user_id, email.as_deref())
        .await?;

    request.extensions_mut().insert(CurrentMerchant(merchant));
    Ok(next.run(request).await)
}

pub async fn worker_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let presented = header_value(&request, WORKER_SECRET_HEADER).unwrap_or_default();
    if !secret_matches(presented, &state.config.worker_secret) {
        tracing::warn!(
            ip = %extract_client_ip(&request),
            "Worker endpoint called with bad secret"
        );
        return Err(ApiError::Forbidden);
    }
    Ok(next.run(request).await)
}

pub async fn admin_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let presented = header_value(&request, ADMIN_KEY_HEADER).unwrap_or_default();
    if !secret_matches(presented, &state.config.admin_key) {
        tracing::warn!(
            ip = %extract_client_ip(&request),
            "Admin endpoint called with bad key"
        );
        return Err(ApiError::Forbidden);
    }
    Ok(next.run(request).await)
}
