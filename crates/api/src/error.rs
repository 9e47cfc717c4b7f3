//! API error type
//!
//! Maps the engine's failures onto the HTTP surface: validation 400, auth
//! 401/403, monthly quota 402, queue and rate limits 429, duplicate events
//! are not errors at all, upstream provider failures 502, and anything
//! unexpected a sanitized 500 (full detail only in debug builds).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use rebill_recovery::RecoveryError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("authentication required")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("not found")]
    NotFound,

    #[error("monthly dunning limit reached ({used}/{limit})")]
    MonthlyLimit { used: i64, limit: i64 },

    #[error("task queue limit reached ({used}/{limit})")]
    QueueLimit { used: i64, limit: i64 },

    #[error("rate limit exceeded")]
    RateLimited { retry_after: Option<u64> },

    #[error("invalid signature")]
    SignatureInvalid,

    #[error("upstream provider failed: {0}")]
    Upstream(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for ApiError {
    fn from(e: sqlx::Error) -> Self {
        ApiError::Internal(e.to_string())
    }
}

impl From<RecoveryError> for ApiError {
    fn from(e: RecoveryError) -> Self {
        match e {
            RecoveryError::MerchantNotFound(_) => ApiError::NotFound,
            RecoveryError::QuotaExceeded { used, limit } => ApiError::MonthlyLimit { used, limit },
            RecoveryError::WebhookSignatureInvalid => ApiError::SignatureInvalid,
            RecoveryError::Payload { message, .. } => ApiError::Validation(message),
            RecoveryError::Provider(p) => ApiError::Upstream(p.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) | ApiError::SignatureInvalid => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::MonthlyLimit { .. } => StatusCode::PAYMENT_REQUIRED,
            ApiError::QueueLimit { .. } | ApiError::RateLimited { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        let message = match &self {
            ApiError::Internal(detail) => {
                tracing::error!(error = %detail, "Internal server error");
                if cfg!(debug_assertions) {
                    self.to_string()
                } else {
                    "Internal Server Error".to_string()
                }
            }
            other => other.to_string(),
        };

        let mut response = (status, Json(json!({ "error": message }))).into_response();

        if let ApiError::RateLimited {
            retry_after: Some(seconds),
        } = self
        {
            if let Ok(value) = seconds.to_string().parse() {
                response.headers_mut().insert("Retry-After", value);
            }
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(
            ApiError::Validation("bad".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ApiError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            ApiError::MonthlyLimit { used: 20, limit: 20 }.status(),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(
            ApiError::QueueLimit { used: 10, limit: 10 }.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ApiError::Upstream("provider down".into()).status(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn quota_errors_map_from_recovery() {
        let e: ApiError = RecoveryError::QuotaExceeded { used: 21, limit: 20 }.into();
        assert!(matches!(e, ApiError::MonthlyLimit { used: 21, limit: 20 }));
    }

    #[test]
    fn payload_errors_become_validation() {
        let e: ApiError = RecoveryError::Payload {
            kind: "dunning_retry",
            message: "unknown field".into(),
        }
        .into();
        assert!(matches!(e, ApiError::Validation(_)));
    }
}
