//! Merchant task management
//!
//! User-initiated task creation is quota-gated at the boundary: queue
//! overflow is a 429 and the monthly dunning limit a 402. The server forces
//! `merchant_id`, `status`, and `run_at` regardless of what the client sent.

use axum::extract::{Path, Query, State};
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::json;
use time::OffsetDateTime;

use rebill_recovery::tasks::{parse_payload, ActionRequiredPayload, DunningRetryPayload};
use rebill_recovery::usage::metric;
use rebill_recovery::{Task, TaskStatus, TaskType};

use crate::auth::CurrentMerchant;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

const LIST_LIMIT: i64 = 100;

/// Task types a merchant may create directly. Self-scheduling system types
/// are excluded; only the watchdog and the worker create those.
const CREATABLE_TYPES: [TaskType; 2] = [TaskType::DunningRetry, TaskType::NotifyActionRequired];

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
}

pub async fn list_tasks(
    State(state): State<AppState>,
    Extension(CurrentMerchant(merchant)): Extension<CurrentMerchant>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<Task>>> {
    let status = match query.status.as_deref() {
        None | Some("") => None,
        Some(raw) => Some(
            TaskStatus::parse(raw)
                .ok_or_else(|| ApiError::Validation(format!("unknown status '{raw}'")))?,
        ),
    };

    let tasks = state
        .recovery
        .tasks
        .list_for_merchant(&merchant.id, status, LIST_LIMIT)
        .await?;
    Ok(Json(tasks))
}

pub async fn get_task(
    State(state): State<AppState>,
    Extension(CurrentMerchant(merchant)): Extension<CurrentMerchant>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Task>> {
    let task = state
        .recovery
        .tasks
        .get_owned(id, &merchant.id)
        .await?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(task))
}

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    #[serde(alias = "type")]
    pub task_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

pub async fn create_task(
    State(state): State<AppState>,
    Extension(CurrentMerchant(merchant)): Extension<CurrentMerchant>,
    Json(body): Json<CreateTaskRequest>,
) -> ApiResult<Json<Task>> {
    let task_type = TaskType::parse(&body.task_type)
        .filter(|t| CREATABLE_TYPES.contains(t))
        .ok_or_else(|| ApiError::Validation(format!("task type '{}' not allowed", body.task_type)))?;

    // Reject malformed payloads before they reach the worker.
    match task_type {
        TaskType::DunningRetry => {
            parse_payload::<DunningRetryPayload>("dunning_retry", &body.payload)
                .map_err(ApiError::from)?;
        }
        TaskType::NotifyActionRequired => {
            parse_payload::<ActionRequiredPayload>("notify_action_required", &body.payload)
                .map_err(ApiError::from)?;
        }
        // Excluded by CREATABLE_TYPES above.
        TaskType::ReportUsage | TaskType::SendWeeklyDigest => {
            return Err(ApiError::Validation(format!(
                "task type '{}' not allowed",
                body.task_type
            )));
        }
    }

    let plan = merchant.plan();
    let queue = state.recovery.quota.queue(&merchant.id, plan).await?;
    if queue.exceeded() {
        return Err(ApiError::QueueLimit {
            used: queue.used,
            limit: queue.limit,
        });
    }
    let monthly = state.recovery.quota.monthly(&merchant.id, plan).await?;
    if monthly.exceeded() {
        return Err(ApiError::MonthlyLimit {
            used: monthly.used,
            limit: monthly.limit,
        });
    }

    // merchant_id, status, and run_at come from the session, never the body.
    let task = state
        .recovery
        .tasks
        .enqueue(
            &merchant.id,
            task_type,
            body.payload,
            OffsetDateTime::now_utc(),
        )
        .await?;
    Ok(Json(task))
}

pub async fn retry_task(
    State(state): State<AppState>,
    Extension(CurrentMerchant(merchant)): Extension<CurrentMerchant>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Task>> {
    state
        .recovery
        .tasks
        .get_owned(id, &merchant.id)
        .await?
        .ok_or(ApiError::NotFound)?;

    state.recovery.tasks.reset_to_pending(id).await?;
    state
        .recovery
        .usage
        .create_usage_log(&merchant.id, metric::TASK_RETRY, 1)
        .await?;

    let task = state
        .recovery
        .tasks
        .get_owned(id, &merchant.id)
        .await?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(task))
}

pub async fn delete_task(
    State(state): State<AppState>,
    Extension(CurrentMerchant(merchant)): Extension<CurrentMerchant>,
    Path(id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    let deleted = state.recovery.tasks.delete_owned(id, &merchant.id).await?;
    if !deleted {
        return Err(ApiError::NotFound);
    }
    Ok(Json(json!({ "deleted": true })))
}

pub async fn delete_completed(
    State(state): State<AppState>,
    Extension(CurrentMerchant(merchant)): Extension<CurrentMerchant>,
) -> ApiResult<Json<serde_json::Value>> {
    let deleted = state.recovery.tasks.delete_completed(&merchant.id).await?;
    Ok(Json(json!({ "deleted": deleted })))
}
