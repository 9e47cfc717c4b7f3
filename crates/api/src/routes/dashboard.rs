//! Merchant dashboard

use axum::extract::State;
use axum::{Extension, Json};
use serde::Serialize;

use rebill_recovery::usage::MonthlyStats;
use rebill_recovery::{Task, UsageLog};

use crate::auth::CurrentMerchant;
use crate::error::ApiResult;
use crate::state::AppState;

const RECENT_TASKS: i64 = 5;
const RECENT_ACTIVITY: i64 = 10;

#[derive(Debug, Serialize)]
pub struct DashboardResponse {
    pub stats: MonthlyStats,
    pub recent_tasks: Vec<Task>,
    pub recent_activity: Vec<UsageLog>,
    pub usage: UsageSummary,
    pub merchant: MerchantSummary,
}

#[derive(Debug, Serialize)]
pub struct UsageSummary {
    pub current: i64,
    pub limit: i64,
}

#[derive(Debug, Serialize)]
pub struct MerchantSummary {
    pub id: String,
    pub email: Option<String>,
    pub tier: String,
    pub connected: bool,
}

pub async fn get_dashboard(
    State(state): State<AppState>,
    Extension(CurrentMerchant(merchant)): Extension<CurrentMerchant>,
) -> ApiResult<Json<DashboardResponse>> {
    let stats = state.recovery.usage.monthly_stats(&merchant.id).await?;
    let recent_tasks = state
        .recovery
        .tasks
        .list_for_merchant(&merchant.id, None, RECENT_TASKS)
        .await?;
    let recent_activity = state.recovery.usage.recent(&merchant.id, RECENT_ACTIVITY).await?;
    let current = state
        .recovery
        .usage
        .monthly_dunning_count(&merchant.id)
        .await?;

    Ok(Json(DashboardResponse {
        stats,
        recent_tasks,
        recent_activity,
        usage: UsageSummary {
            current,
            limit: merchant.plan().monthly_limit,
        },
        merchant: MerchantSummary {
            connected: merchant.is_connected(),
            id: merchant.id,
            email: merchant.email,
            tier: merchant.tier,
        },
    }))
}
