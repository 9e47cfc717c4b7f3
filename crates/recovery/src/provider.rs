//! Payment-provider REST client
//!
//! Thin reqwest client over the provider's REST API. One platform client is
//! built at startup; tenant-scoped calls go through [`ProviderClient::for_account`],
//! which adds the `PP-Account` header the provider uses to route requests to
//! a connected account. Meter events and OAuth always use the platform client.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{RecoveryError, RecoveryResult};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Header that scopes a call to a connected (tenant) account.
const ACCOUNT_HEADER: &str = "PP-Account";

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Network(String),

    #[error("provider returned {status}: {message}")]
    Api {
        status: u16,
        code: Option<String>,
        kind: Option<String>,
        message: String,
    },
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        ProviderError::Network(e.to_string())
    }
}

impl ProviderError {
    /// Permanent failures are poison pills: retrying the same request can
    /// never succeed, so the caller must isolate the offending unit.
    pub fn is_permanent(&self) -> bool {
        match self {
            ProviderError::Network(_) => false,
            ProviderError::Api {
                status, code, kind, ..
            } => {
                if *status == 429 {
                    return false;
                }
                (400..500).contains(status)
                    || code.as_deref().is_some_and(|c| c.starts_with("resource_"))
                    || kind.as_deref() == Some("invalid_request_error")
            }
        }
    }

    /// The provider already holds a charge under this idempotency key; the
    /// upload that "failed" actually happened on an earlier attempt.
    pub fn is_idempotent_replay(&self) -> bool {
        matches!(
            self,
            ProviderError::Api { code: Some(code), .. } if code == "idempotency_key_in_use"
        )
    }
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub secret_key: String,
    pub client_id: String,
    pub webhook_secret: String,
    pub api_base: String,
    pub connect_base: String,
}

impl ProviderConfig {
    pub fn from_env() -> RecoveryResult<Self> {
        let secret_key = std::env::var("PP_SECRET_KEY")
            .map_err(|_| RecoveryError::Config("PP_SECRET_KEY is not set".into()))?;
        let client_id = std::env::var("PP_CLIENT_ID").unwrap_or_default();
        let webhook_secret = std::env::var("PP_WEBHOOK_SECRET").unwrap_or_default();
        let api_base = std::env::var("PP_API_BASE")
            .unwrap_or_else(|_| "https://api.payprovider.com".to_string());
        let connect_base = std::env::var("PP_CONNECT_BASE")
            .unwrap_or_else(|_| "https://connect.payprovider.com".to_string());

        Ok(Self {
            secret_key,
            client_id,
            webhook_secret,
            api_base,
            connect_base,
        })
    }
}

/// Invoice as returned by `GET /v1/invoices/{id}`.
#[derive(Debug, Clone, Deserialize)]
pub struct Invoice {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub customer_email: Option<String>,
    #[serde(default)]
    pub customer_name: Option<String>,
    #[serde(default)]
    pub hosted_invoice_url: Option<String>,
    #[serde(default)]
    pub amount_due: i64,
    #[serde(default = "default_currency")]
    pub currency: String,
}

fn default_currency() -> String {
    "usd".to_string()
}

impl Invoice {
    /// Paid or voided invoices need no further recovery work.
    pub fn is_settled(&self) -> bool {
        self.status == "paid" || self.status == "void"
    }

    pub fn is_open(&self) -> bool {
        self.status == "open"
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub status: String,
}

#[derive(Debug, Deserialize)]
struct SubscriptionList {
    #[serde(default)]
    data: Vec<Subscription>,
}

/// Result of exchanging an OAuth authorization code.
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthGrant {
    pub account_id: String,
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    error: ApiErrorDetail,
}

#[derive(Debug, Default, Deserialize)]
struct ApiErrorDetail {
    #[serde(rename = "type")]
    kind: Option<String>,
    code: Option<String>,
    message: Option<String>,
}

#[derive(Clone)]
pub struct ProviderClient {
    http: reqwest::Client,
    config: Arc<ProviderConfig>,
    /// Connected-account id for tenant-scoped calls; None on the platform client.
    account: Option<String>,
}

impl ProviderClient {
    pub fn new(config: ProviderConfig) -> RecoveryResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| RecoveryError::Config(format!("http client: {e}")))?;

        Ok(Self {
            http,
            config: Arc::new(config),
            account: None,
        })
    }

    pub fn from_env() -> RecoveryResult<Self> {
        Self::new(ProviderConfig::from_env()?)
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    /// Tenant-scoped clone of this client.
    pub fn for_account(&self, account_id: &str) -> Self {
        Self {
            http: self.http.clone(),
            config: self.config.clone(),
            account: Some(account_id.to_string()),
        }
    }

    fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        let mut builder = self
            .http
            .request(method, url)
            .bearer_auth(&self.config.secret_key);
        if let Some(account) = &self.account {
            builder = builder.header(ACCOUNT_HEADER, account);
        }
        builder
    }

    async fn read_error(status: u16, response: reqwest::Response) -> ProviderError {
        let detail = response
            .json::<ApiErrorBody>()
            .await
            .map(|b| b.error)
            .unwrap_or_default();
        ProviderError::Api {
            status,
            code: detail.code,
            kind: detail.kind,
            message: detail
                .message
                .unwrap_or_else(|| "no error detail".to_string()),
        }
    }

    pub async fn fetch_invoice(&self, invoice_id: &str) -> Result<Invoice, ProviderError> {
        let url = format!("{}/v1/invoices/{}", self.config.api_base, invoice_id);
        let response = self.request(reqwest::Method::GET, url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Self::read_error(status.as_u16(), response).await);
        }
        Ok(response.json::<Invoice>().await?)
    }

    /// Upload one meter event against the platform subscription.
    ///
    /// The idempotency key is derived from the usage-log primary key, so the
    /// same log uploaded twice produces no additional charge.
    pub async fn post_meter_event(
        &self,
        customer_id: &str,
        event_name: &str,
        value: i64,
        idempotency_key: &str,
    ) -> Result<(), ProviderError> {
        let url = format!("{}/v1/billing/meter_events", self.config.api_base);
        let value = value.to_string();
        let params = [
            ("event_name", event_name),
            ("identifier", idempotency_key),
            ("payload[customer_id]", customer_id),
            ("payload[value]", value.as_str()),
        ];

        let response = self
            .request(reqwest::Method::POST, url)
            .header("Idempotency-Key", idempotency_key)
            .form(&params)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Self::read_error(status.as_u16(), response).await);
        }
        Ok(())
    }

    pub async fn list_active_subscriptions(&self) -> Result<Vec<Subscription>, ProviderError> {
        let url = format!(
            "{}/v1/subscriptions?status=active&limit=100",
            self.config.api_base
        );
        let response = self.request(reqwest::Method::GET, url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Self::read_error(status.as_u16(), response).await);
        }
        Ok(response.json::<SubscriptionList>().await?.data)
    }

    pub async fn cancel_subscription(&self, subscription_id: &str) -> Result<(), ProviderError> {
        let url = format!(
            "{}/v1/subscriptions/{}",
            self.config.api_base, subscription_id
        );
        let response = self.request(reqwest::Method::DELETE, url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Self::read_error(status.as_u16(), response).await);
        }
        Ok(())
    }

    /// Provider-hosted OAuth consent page for connecting a tenant account.
    pub fn oauth_authorize_url(&self, state: &str) -> String {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.config.client_id)
            .append_pair("scope", "read_write")
            .append_pair("state", state)
            .finish();
        format!("{}/oauth/authorize?{}", self.config.connect_base, query)
    }

    pub async fn exchange_oauth_code(&self, code: &str) -> Result<OAuthGrant, ProviderError> {
        let url = format!("{}/oauth/token", self.config.connect_base);
        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("client_id", self.config.client_id.as_str()),
        ];

        let response = self
            .request(reqwest::Method::POST, url)
            .form(&params)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Self::read_error(status.as_u16(), response).await);
        }
        Ok(response.json::<OAuthGrant>().await?)
    }

    pub async fn deauthorize(&self, account_id: &str) -> Result<(), ProviderError> {
        let url = format!("{}/oauth/deauthorize", self.config.connect_base);
        let params = [
            ("client_id", self.config.client_id.as_str()),
            ("account_id", account_id),
        ];

        let response = self
            .request(reqwest::Method::POST, url)
            .form(&params)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Self::read_error(status.as_u16(), response).await);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(status: u16, code: Option<&str>, kind: Option<&str>) -> ProviderError {
        ProviderError::Api {
            status,
            code: code.map(String::from),
            kind: kind.map(String::from),
            message: "test".to_string(),
        }
    }

    #[test]
    fn four_hundreds_are_permanent() {
        assert!(api_error(400, None, None).is_permanent());
        assert!(api_error(404, Some("resource_missing"), None).is_permanent());
        assert!(api_error(402, None, Some("invalid_request_error")).is_permanent());
    }

    #[test]
    fn rate_limit_and_five_hundreds_are_transient() {
        assert!(!api_error(429, Some("rate_limit"), None).is_permanent());
        assert!(!api_error(500, None, None).is_permanent());
        assert!(!api_error(503, None, Some("api_error")).is_permanent());
        assert!(!ProviderError::Network("connection reset".into()).is_permanent());
    }

    #[test]
    fn idempotent_replay_detection() {
        assert!(api_error(400, Some("idempotency_key_in_use"), None).is_idempotent_replay());
        assert!(!api_error(400, Some("resource_missing"), None).is_idempotent_replay());
        assert!(!ProviderError::Network("timeout".into()).is_idempotent_replay());
    }

    #[test]
    fn settled_invoice_detection() {
        let mut invoice = Invoice {
            id: "in_1".into(),
            status: "paid".into(),
            customer: None,
            customer_email: None,
            customer_name: None,
            hosted_invoice_url: None,
            amount_due: 0,
            currency: "usd".into(),
        };
        assert!(invoice.is_settled());
        invoice.status = "void".into();
        assert!(invoice.is_settled());
        invoice.status = "open".into();
        assert!(!invoice.is_settled());
        assert!(invoice.is_open());
    }

    #[test]
    fn authorize_url_carries_state_and_client_id() {
        let client = ProviderClient::new(ProviderConfig {
            secret_key: "sk_test_1".into(),
            client_id: "ca_123".into(),
            webhook_secret: String::new(),
            api_base: "https://api.payprovider.com".into(),
            connect_base: "https://connect.payprovider.com".into(),
        })
        .unwrap();

        let url = client.oauth_authorize_url("statetoken");
        assert!(url.starts_with("https://connect.payprovider.com/oauth/authorize?"));
        assert!(url.contains("client_id=ca_123"));
        assert!(url.contains("state=statetoken"));
        assert!(url.contains("response_type=code"));
    }
}
