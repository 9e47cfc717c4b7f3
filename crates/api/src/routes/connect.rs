//! Provider OAuth connection lifecycle
//!
//! `authorize` stamps a fresh CSRF state on the merchant and hands back the
//! provider's consent URL; `callback` validates the state, exchanges the
//! code, and persists the connection (tokens encrypted, state cleared) in a
//! single store write. `disconnect` is best-effort against the provider but
//! always wipes local credentials and unfinished work.

use axum::extract::{Query, State};
use axum::{Extension, Json};
use rand::RngCore;
use serde::Deserialize;
use serde_json::json;

use rebill_recovery::usage::metric;

use crate::auth::CurrentMerchant;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

fn new_csrf_state() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub async fn authorize(
    State(state): State<AppState>,
    Extension(CurrentMerchant(merchant)): Extension<CurrentMerchant>,
) -> ApiResult<Json<serde_json::Value>> {
    let csrf_state = new_csrf_state();
    state
        .recovery
        .merchants
        .set_oauth_state(&merchant.id, &csrf_state)
        .await?;

    let url = state.recovery.provider.oauth_authorize_url(&csrf_state);
    Ok(Json(json!({ "url": url })))
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub code: String,
    pub state: String,
}

pub async fn callback(
    State(state): State<AppState>,
    Extension(CurrentMerchant(merchant)): Extension<CurrentMerchant>,
    Query(query): Query<CallbackQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    // The state must match what `authorize` stamped on this merchant; a
    // mismatch is either a replay or a cross-merchant forgery.
    let expected = merchant.oauth_state.as_deref().unwrap_or_default();
    if expected.is_empty() || expected != query.state {
        tracing::warn!(merchant_id = %merchant.id, "OAuth callback with bad state");
        return Err(ApiError::Forbidden);
    }

    let grant = state
        .recovery
        .provider
        .exchange_oauth_code(&query.code)
        .await
        .map_err(|e| ApiError::Upstream(e.to_string()))?;

    state
        .recovery
        .merchants
        .complete_connection(
            &merchant.id,
            &grant.account_id,
            &grant.access_token,
            grant.refresh_token.as_deref(),
        )
        .await?;
    state
        .recovery
        .usage
        .create_usage_log(&merchant.id, metric::MERCHANT_CONNECTED, 1)
        .await?;

    tracing::info!(merchant_id = %merchant.id, "Merchant connected to provider");
    Ok(Json(json!({ "connected": true })))
}

pub async fn disconnect(
    State(state): State<AppState>,
    Extension(CurrentMerchant(merchant)): Extension<CurrentMerchant>,
) -> ApiResult<Json<serde_json::Value>> {
    if let Some(account) = &merchant.pp_account_id {
        let tenant = state.recovery.provider.for_account(account);

        // Best effort: a dead tenant account must not block the disconnect.
        match tenant.list_active_subscriptions().await {
            Ok(subscriptions) => {
                for subscription in subscriptions {
                    if let Err(e) = tenant.cancel_subscription(&subscription.id).await {
                        tracing::warn!(
                            merchant_id = %merchant.id,
                            subscription_id = %subscription.id,
                            error = %e,
                            "Failed to cancel tenant subscription during disconnect"
                        );
                    }
                }
            }
            Err(e) => {
                tracing::warn!(
                    merchant_id = %merchant.id,
                    error = %e,
                    "Failed to list tenant subscriptions during disconnect"
                );
            }
        }

        if let Err(e) = state.recovery.provider.deauthorize(account).await {
            tracing::warn!(
                merchant_id = %merchant.id,
                error = %e,
                "Provider deauthorization failed during disconnect"
            );
        }
    }

    state.recovery.merchants.clear_connection(&merchant.id).await?;
    let dropped = state.recovery.tasks.delete_live_for(&merchant.id).await?;
    state
        .recovery
        .usage
        .create_usage_log(&merchant.id, metric::MERCHANT_DISCONNECTED, 1)
        .await?;

    tracing::info!(
        merchant_id = %merchant.id,
        dropped_tasks = dropped,
        "Merchant disconnected from provider"
    );
    Ok(Json(json!({ "disconnected": true })))
}
