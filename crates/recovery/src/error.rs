//! Recovery crate error type

use crate::provider::ProviderError;

pub type RecoveryResult<T> = Result<T, RecoveryError>;

#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("merchant {0} not found")]
    MerchantNotFound(String),

    #[error("merchant {0} has no provider connection")]
    NotConnected(String),

    #[error("monthly dunning quota exhausted ({used}/{limit})")]
    QuotaExceeded { used: i64, limit: i64 },

    #[error("webhook signature invalid")]
    WebhookSignatureInvalid,

    #[error("malformed {kind} payload: {message}")]
    Payload {
        kind: &'static str,
        message: String,
    },

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("email gateway rejected send: {0}")]
    Email(String),

    #[error("email gateway not configured")]
    EmailDisabled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Crypto(#[from] rebill_shared::CryptoError),
}
