//! Merchant activity feed

use axum::extract::State;
use axum::{Extension, Json};

use rebill_recovery::UsageLog;

use crate::auth::CurrentMerchant;
use crate::error::ApiResult;
use crate::state::AppState;

const ACTIVITY_LIMIT: i64 = 100;

pub async fn list_activity(
    State(state): State<AppState>,
    Extension(CurrentMerchant(merchant)): Extension<CurrentMerchant>,
) -> ApiResult<Json<Vec<UsageLog>>> {
    let logs = state
        .recovery
        .usage
        .recent(&merchant.id, ACTIVITY_LIMIT)
        .await?;
    Ok(Json(logs))
}
