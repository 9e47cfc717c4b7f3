//! Dunning template management

use axum::extract::State;
use axum::{Extension, Json};
use serde::Deserialize;

use rebill_recovery::templates::{MAX_RETRY_ATTEMPT, MAX_SUBJECT_LEN, MIN_RETRY_ATTEMPT};
use rebill_recovery::{sanitize_html, EmailTemplate};

use crate::auth::CurrentMerchant;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct UpsertTemplateRequest {
    pub retry_attempt: i32,
    pub subject: String,
    pub body: String,
}

pub async fn upsert_template(
    State(state): State<AppState>,
    Extension(CurrentMerchant(merchant)): Extension<CurrentMerchant>,
    Json(body): Json<UpsertTemplateRequest>,
) -> ApiResult<Json<EmailTemplate>> {
    if !(MIN_RETRY_ATTEMPT..=MAX_RETRY_ATTEMPT).contains(&body.retry_attempt) {
        return Err(ApiError::Validation(format!(
            "retry_attempt must be between {MIN_RETRY_ATTEMPT} and {MAX_RETRY_ATTEMPT}"
        )));
    }
    if body.subject.trim().is_empty() {
        return Err(ApiError::Validation("subject must not be empty".into()));
    }
    if body.subject.chars().count() > MAX_SUBJECT_LEN {
        return Err(ApiError::Validation(format!(
            "subject must be at most {MAX_SUBJECT_LEN} characters"
        )));
    }

    // Bodies are stored pre-sanitized so render time never re-validates.
    let clean_body = sanitize_html(&body.body);

    let template = state
        .recovery
        .templates
        .upsert(&merchant.id, body.retry_attempt, body.subject.trim(), &clean_body)
        .await?;
    Ok(Json(template))
}
