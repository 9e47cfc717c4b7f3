//! External-worker admin endpoints
//!
//! Secret-gated endpoints for running the claim loop outside this process.
//! They operate on arbitrary tasks, not merchant-scoped ones.

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;

use rebill_recovery::{Task, TaskStatus};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

pub async fn claim(State(state): State<AppState>) -> ApiResult<Json<Option<Task>>> {
    let task = state.recovery.tasks.claim_next().await?;
    Ok(Json(task))
}

#[derive(Debug, Deserialize)]
pub struct CompleteRequest {
    #[serde(default = "default_status")]
    pub status: String,
    /// Revenue recovered by this task, credited into the daily rollup.
    #[serde(default, alias = "recoveredCents")]
    pub recovered_cents: Option<i64>,
}

fn default_status() -> String {
    "completed".to_string()
}

pub async fn complete(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<CompleteRequest>,
) -> ApiResult<Json<Task>> {
    let status = TaskStatus::parse(&body.status)
        .filter(|s| matches!(s, TaskStatus::Completed | TaskStatus::Failed))
        .ok_or_else(|| {
            ApiError::Validation(format!("status must be completed or failed, got '{}'", body.status))
        })?;

    let task = state
        .recovery
        .tasks
        .get(id)
        .await?
        .ok_or(ApiError::NotFound)?;

    state.recovery.tasks.update_status(id, status).await?;

    if status == TaskStatus::Completed {
        if let Some(cents) = body.recovered_cents.filter(|c| *c > 0) {
            state
                .recovery
                .usage
                .add_recovered_cents(&task.merchant_id, cents)
                .await?;
        }
    }

    let task = state
        .recovery
        .tasks
        .get(id)
        .await?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(task))
}
