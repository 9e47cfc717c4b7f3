//! Platform admin: GDPR erasure
//!
//! Erasure must never leave zombie billing behind: if the merchant still has
//! live subscriptions on their connected account and the provider cannot
//! cancel them, the whole erasure aborts with 502 and no rows are deleted.

use axum::extract::{Path, State};
use axum::Json;
use serde_json::json;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

pub async fn erase_merchant(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let merchant = state
        .recovery
        .merchants
        .find(&id)
        .await?
        .ok_or(ApiError::NotFound)?;

    if let Some(account) = &merchant.pp_account_id {
        let tenant = state.recovery.provider.for_account(account);

        let subscriptions = tenant.list_active_subscriptions().await.map_err(|e| {
            tracing::error!(merchant_id = %merchant.id, error = %e, "Erasure aborted: cannot list subscriptions");
            ApiError::Upstream(format!("subscription listing failed: {e}"))
        })?;

        for subscription in &subscriptions {
            tenant.cancel_subscription(&subscription.id).await.map_err(|e| {
                tracing::error!(
                    merchant_id = %merchant.id,
                    subscription_id = %subscription.id,
                    error = %e,
                    "Erasure aborted: cannot cancel subscription"
                );
                ApiError::Upstream(format!("subscription cancel failed: {e}"))
            })?;
        }
    }

    // Provider side is clean; now remove every trace. The merchant delete
    // would cascade anyway, but the explicit order keeps erasure auditable.
    let tasks = state.recovery.tasks.delete_all_for(&merchant.id).await?;
    let logs = state.recovery.usage.delete_logs_for(&merchant.id).await?;
    let metrics = state.recovery.usage.delete_daily_metrics_for(&merchant.id).await?;
    state.recovery.merchants.delete(&merchant.id).await?;

    tracing::info!(
        merchant_id = %merchant.id,
        tasks_deleted = tasks,
        logs_deleted = logs,
        metrics_deleted = metrics,
        "Merchant erased"
    );
    Ok(Json(json!({ "erased": true })))
}
