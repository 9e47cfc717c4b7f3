//! Merchant self-service settings
//!
//! The PATCH surface is a strict field whitelist: billing address fields,
//! sender identity, and branding. Email, tokens, and provider ids are not
//! settable here, and the response strips every sensitive column.

use axum::extract::{Path, State};
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use rebill_recovery::{Merchant, SettingsUpdate};

use crate::auth::CurrentMerchant;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct UpdateMerchantRequest {
    pub billing_country: Option<String>,
    pub billing_address: Option<String>,
    pub from_name: Option<String>,
    pub support_email: Option<String>,
    pub brand_color: Option<String>,
    pub logo_url: Option<String>,
}

/// Public view of a merchant row; tokens, OAuth state, and provider ids
/// never leave the server.
#[derive(Debug, Serialize)]
pub struct MerchantView {
    pub id: String,
    pub email: Option<String>,
    pub tier: String,
    pub plan_id: String,
    pub connected: bool,
    pub billing_country: Option<String>,
    pub billing_address: Option<String>,
    pub from_name: Option<String>,
    pub support_email: Option<String>,
    pub brand_color: Option<String>,
    pub logo_url: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl From<Merchant> for MerchantView {
    fn from(m: Merchant) -> Self {
        Self {
            connected: m.is_connected(),
            id: m.id,
            email: m.email,
            tier: m.tier,
            plan_id: m.plan_id,
            billing_country: m.billing_country,
            billing_address: m.billing_address,
            from_name: m.from_name,
            support_email: m.support_email,
            brand_color: m.brand_color,
            logo_url: m.logo_url,
            created_at: m.created_at,
        }
    }
}

pub(crate) fn is_valid_brand_color(value: &str) -> bool {
    value.len() == 7
        && value.starts_with('#')
        && value[1..].chars().all(|c| c.is_ascii_hexdigit())
}

pub async fn update_merchant(
    State(state): State<AppState>,
    Extension(CurrentMerchant(merchant)): Extension<CurrentMerchant>,
    Path(id): Path<String>,
    Json(body): Json<UpdateMerchantRequest>,
) -> ApiResult<Json<MerchantView>> {
    if id != merchant.id {
        return Err(ApiError::Forbidden);
    }

    if let Some(color) = &body.brand_color {
        if !is_valid_brand_color(color) {
            return Err(ApiError::Validation(
                "brand_color must be a #RRGGBB hex color".into(),
            ));
        }
    }
    if let Some(url) = &body.logo_url {
        if !url.starts_with("https://") {
            return Err(ApiError::Validation("logo_url must start with https://".into()));
        }
    }
    if let Some(email) = &body.support_email {
        if !email.contains('@') {
            return Err(ApiError::Validation("support_email is not an email address".into()));
        }
    }

    let updated = state
        .recovery
        .merchants
        .update_settings(
            &merchant.id,
            SettingsUpdate {
                billing_country: body.billing_country,
                billing_address: body.billing_address,
                from_name: body.from_name,
                support_email: body.support_email,
                brand_color: body.brand_color,
                logo_url: body.logo_url,
            },
        )
        .await?;

    Ok(Json(updated.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn brand_color_validation() {
        assert!(is_valid_brand_color("#1A2b3C"));
        assert!(is_valid_brand_color("#000000"));
        assert!(!is_valid_brand_color("1A2b3C"));
        assert!(!is_valid_brand_color("#1A2b3"));
        assert!(!is_valid_brand_color("#1A2b3CD"));
        assert!(!is_valid_brand_color("#GG0000"));
        assert!(!is_valid_brand_color(""));
    }
}
