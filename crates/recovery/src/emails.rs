//! Outbound email
//!
//! JSON gateway client (Resend-style) plus the builders for the three email
//! kinds the engine sends: dunning attempts, SCA/action-required notices, and
//! weekly digests. Every send carries `X-Entity-Ref-ID: <merchant_id>` so
//! gateway-side logs can be joined back to a tenant. Dunning bodies embed an
//! open pixel and HMAC-signed click-through links keyed by the usage-log id.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::{RecoveryError, RecoveryResult};
use crate::merchants::Merchant;
use crate::provider::Invoice;
use crate::templates::EmailTemplate;
use crate::usage::WeeklySummary;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub api_key: String,
    pub api_url: String,
    pub from: String,
    /// Public base URL of this deployment; tracking links point here.
    pub app_base_url: String,
    /// HMAC key for tracking-link signatures.
    pub session_secret: String,
}

impl EmailConfig {
    pub fn from_env() -> Self {
        Self {
            api_key: std::env::var("EMAIL_API_KEY").unwrap_or_default(),
            api_url: std::env::var("EMAIL_API_URL")
                .unwrap_or_else(|_| "https://api.resend.com/emails".to_string()),
            from: std::env::var("EMAIL_FROM")
                .unwrap_or_else(|_| "Rebill <recovery@rebill.dev>".to_string()),
            app_base_url: std::env::var("APP_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:8080".to_string()),
            session_secret: std::env::var("SESSION_SECRET").unwrap_or_default(),
        }
    }
}

#[derive(Debug, Serialize)]
struct GatewayPayload<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    html: &'a str,
    text: &'a str,
    headers: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct GatewayResponse {
    id: String,
}

#[derive(Clone)]
pub struct EmailService {
    http: reqwest::Client,
    config: EmailConfig,
}

impl EmailService {
    pub fn new(config: EmailConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    pub fn from_env() -> Self {
        Self::new(EmailConfig::from_env())
    }

    pub fn is_enabled(&self) -> bool {
        !self.config.api_key.is_empty()
    }

    pub fn config(&self) -> &EmailConfig {
        &self.config
    }

    /// Low-level send. Returns the gateway's message id.
    pub async fn send(
        &self,
        to: &str,
        subject: &str,
        html: &str,
        text: &str,
        ref_id: &str,
    ) -> RecoveryResult<String> {
        if !self.is_enabled() {
            return Err(RecoveryError::EmailDisabled);
        }

        let payload = GatewayPayload {
            from: &self.config.from,
            to: [to],
            subject,
            html,
            text,
            headers: serde_json::json!({ "X-Entity-Ref-ID": ref_id }),
        };

        let response = self
            .http
            .post(&self.config.api_url)
            .bearer_auth(&self.config.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| RecoveryError::Email(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RecoveryError::Email(format!("{status}: {body}")));
        }

        let accepted: GatewayResponse = response
            .json()
            .await
            .map_err(|e| RecoveryError::Email(e.to_string()))?;

        tracing::info!(message_id = %accepted.id, ref_id = %ref_id, "Email accepted by gateway");
        Ok(accepted.id)
    }

    pub async fn send_dunning(
        &self,
        merchant: &Merchant,
        invoice: &Invoice,
        attempt: i64,
        template: Option<&EmailTemplate>,
        log_id: i64,
    ) -> RecoveryResult<String> {
        let to = invoice
            .customer_email
            .as_deref()
            .ok_or_else(|| RecoveryError::Email("invoice has no customer email".into()))?;

        let rendered = build_dunning_email(&self.config, merchant, invoice, attempt, template, log_id);
        self.send(to, &rendered.subject, &rendered.html, &rendered.text, &merchant.id)
            .await
    }

    pub async fn send_action_required(
        &self,
        merchant: &Merchant,
        invoice: &Invoice,
        hosted_url: Option<&str>,
    ) -> RecoveryResult<String> {
        let to = invoice
            .customer_email
            .as_deref()
            .ok_or_else(|| RecoveryError::Email("invoice has no customer email".into()))?;

        let rendered = build_action_required_email(merchant, invoice, hosted_url);
        self.send(to, &rendered.subject, &rendered.html, &rendered.text, &merchant.id)
            .await
    }

    pub async fn send_weekly_digest(
        &self,
        merchant: &Merchant,
        summary: &WeeklySummary,
    ) -> RecoveryResult<String> {
        let to = merchant
            .email
            .as_deref()
            .ok_or_else(|| RecoveryError::Email("merchant has no email address".into()))?;

        let rendered = build_digest_email(summary);
        self.send(to, &rendered.subject, &rendered.html, &rendered.text, &merchant.id)
            .await
    }
}

// =============================================================================
// Tracking links
// =============================================================================

/// Signature binding a click-through target to the usage log that sent it:
/// `HMAC-SHA256(secret, url + ":" + log_id)`, hex-encoded.
pub fn click_signature(secret: &str, url: &str, log_id: i64) -> String {
    // HMAC accepts keys of any length; the error arm is unreachable in practice.
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return String::new();
    };
    mac.update(url.as_bytes());
    mac.update(b":");
    mac.update(log_id.to_string().as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

pub fn verify_click_signature(secret: &str, url: &str, log_id: i64, signature: &str) -> bool {
    let Ok(expected) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(url.as_bytes());
    mac.update(b":");
    mac.update(log_id.to_string().as_bytes());
    mac.verify_slice(&expected).is_ok()
}

pub fn tracking_pixel_url(base: &str, log_id: i64) -> String {
    format!("{}/track/open/{}", base.trim_end_matches('/'), log_id)
}

pub fn tracked_click_url(base: &str, secret: &str, target: &str, log_id: i64) -> String {
    let sig = click_signature(secret, target, log_id);
    let query = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("url", target)
        .append_pair("logId", &log_id.to_string())
        .append_pair("sig", &sig)
        .finish();
    format!("{}/track/click?{}", base.trim_end_matches('/'), query)
}

// =============================================================================
// Builders
// =============================================================================

#[derive(Debug, Clone)]
pub struct RenderedEmail {
    pub subject: String,
    pub html: String,
    pub text: String,
}

pub fn format_amount(cents: i64, currency: &str) -> String {
    let major = cents as f64 / 100.0;
    match currency.to_ascii_lowercase().as_str() {
        "usd" => format!("${major:.2}"),
        "eur" => format!("€{major:.2}"),
        "gbp" => format!("£{major:.2}"),
        other => format!("{major:.2} {}", other.to_ascii_uppercase()),
    }
}

fn apply_tokens(input: &str, customer_name: &str, amount: &str, update_url: &str) -> String {
    input
        .replace("{{customer_name}}", customer_name)
        .replace("{{amount}}", amount)
        .replace("{{update_url}}", update_url)
}

fn default_dunning_template(attempt: i64) -> (&'static str, &'static str) {
    match attempt {
        1 => (
            "Your payment didn't go through",
            "<p>Hi {{customer_name}},</p>\
             <p>We couldn't collect your latest payment of {{amount}}. This is usually a \
             card expiry or a temporary hold.</p>\
             <p><a href=\"{{update_url}}\">Update your payment method</a> and we'll retry \
             automatically.</p>",
        ),
        2 => (
            "Reminder: your payment is still outstanding",
            "<p>Hi {{customer_name}},</p>\
             <p>Your payment of {{amount}} is still outstanding and your subscription is at \
             risk of interruption.</p>\
             <p><a href=\"{{update_url}}\">Update your payment method</a> to keep your \
             account active.</p>",
        ),
        _ => (
            "Final notice before your subscription is cancelled",
            "<p>Hi {{customer_name}},</p>\
             <p>This is the final reminder about your outstanding payment of {{amount}}. If \
             it cannot be collected, your subscription will be cancelled.</p>\
             <p><a href=\"{{update_url}}\">Update your payment method now</a>.</p>",
        ),
    }
}

fn html_to_text(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => {
                if in_tag {
                    in_tag = false;
                } else {
                    out.push(c);
                }
            }
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.replace("&lt;", "<").replace("&amp;", "&")
}

pub fn build_dunning_email(
    config: &EmailConfig,
    merchant: &Merchant,
    invoice: &Invoice,
    attempt: i64,
    template: Option<&EmailTemplate>,
    log_id: i64,
) -> RenderedEmail {
    let customer_name = invoice.customer_name.as_deref().unwrap_or("there");
    let amount = format_amount(invoice.amount_due, &invoice.currency);

    let target = invoice
        .hosted_invoice_url
        .clone()
        .unwrap_or_else(|| config.app_base_url.clone());
    let update_url = tracked_click_url(
        &config.app_base_url,
        &config.session_secret,
        &target,
        log_id,
    );

    let (subject_raw, body_raw) = match template {
        Some(t) => (t.subject.as_str(), t.body.as_str()),
        None => default_dunning_template(attempt),
    };

    let subject = apply_tokens(subject_raw, customer_name, &amount, &update_url);
    let mut html = apply_tokens(body_raw, customer_name, &amount, &update_url);

    if let Some(from_name) = &merchant.from_name {
        html.push_str(&format!("<p>— {from_name}</p>"));
    }
    html.push_str(&format!(
        "<img src=\"{}\" width=\"1\" height=\"1\" alt=\"\">",
        tracking_pixel_url(&config.app_base_url, log_id)
    ));

    let text = html_to_text(&apply_tokens(body_raw, customer_name, &amount, &target));

    RenderedEmail { subject, html, text }
}

pub fn build_action_required_email(
    merchant: &Merchant,
    invoice: &Invoice,
    hosted_url: Option<&str>,
) -> RenderedEmail {
    let customer_name = invoice.customer_name.as_deref().unwrap_or("there");
    let amount = format_amount(invoice.amount_due, &invoice.currency);
    let url = hosted_url
        .or(invoice.hosted_invoice_url.as_deref())
        .unwrap_or("");

    let subject = format!("Action required to complete your {amount} payment");
    let html = format!(
        "<p>Hi {customer_name},</p>\
         <p>Your bank needs an extra confirmation step before your payment of {amount} can \
         complete.</p>\
         <p><a href=\"{url}\">Confirm your payment</a></p>{signature}",
        signature = merchant
            .from_name
            .as_deref()
            .map(|n| format!("<p>— {n}</p>"))
            .unwrap_or_default()
    );
    let text = html_to_text(&html);

    RenderedEmail { subject, html, text }
}

pub fn build_digest_email(summary: &WeeklySummary) -> RenderedEmail {
    let recovered = format_amount(summary.recovered_cents, "usd");
    let subject = format!("Your weekly recovery digest: {recovered} recovered");
    let html = format!(
        "<h2>Last 7 days</h2>\
         <ul>\
         <li>Recovered revenue: <strong>{recovered}</strong></li>\
         <li>Recovery emails sent: {}</li>\
         <li>Opens: {}</li>\
         <li>Clicks: {}</li>\
         </ul>",
        summary.emails_sent, summary.total_opens, summary.total_clicks
    );
    let text = html_to_text(&html);

    RenderedEmail { subject, html, text }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::OffsetDateTime;

    fn merchant() -> Merchant {
        Merchant {
            id: "m_1".into(),
            auth_user_id: None,
            email: Some("owner@example.com".into()),
            pp_account_id: Some("acct_A".into()),
            pp_customer_id: None,
            access_token: None,
            refresh_token: None,
            oauth_state: None,
            tier: "free".into(),
            plan_id: "price_free".into(),
            billing_country: None,
            billing_address: None,
            from_name: Some("Acme Billing".into()),
            support_email: None,
            brand_color: None,
            logo_url: None,
            created_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    fn invoice() -> Invoice {
        Invoice {
            id: "in_1".into(),
            status: "open".into(),
            customer: Some("cus_1".into()),
            customer_email: Some("buyer@example.com".into()),
            customer_name: Some("Dana".into()),
            hosted_invoice_url: Some("https://pay.example/in_1".into()),
            amount_due: 4_200,
            currency: "usd".into(),
        }
    }

    fn config() -> EmailConfig {
        EmailConfig {
            api_key: "re_test".into(),
            api_url: "https://api.resend.com/emails".into(),
            from: "Rebill <recovery@rebill.dev>".into(),
            app_base_url: "https://app.rebill.dev".into(),
            session_secret: "sess_secret".into(),
        }
    }

    #[test]
    fn click_signature_round_trips() {
        let sig = click_signature("secret", "https://pay.example/in_1", 17);
        assert!(verify_click_signature("secret", "https://pay.example/in_1", 17, &sig));
    }

    #[test]
    fn click_signature_binds_url_and_log_id() {
        let sig = click_signature("secret", "https://pay.example/in_1", 17);
        assert!(!verify_click_signature("secret", "https://evil.example", 17, &sig));
        assert!(!verify_click_signature("secret", "https://pay.example/in_1", 18, &sig));
        assert!(!verify_click_signature("other", "https://pay.example/in_1", 17, &sig));
        assert!(!verify_click_signature("secret", "https://pay.example/in_1", 17, "zz"));
    }

    #[test]
    fn amount_formatting() {
        assert_eq!(format_amount(4_200, "usd"), "$42.00");
        assert_eq!(format_amount(999, "eur"), "€9.99");
        assert_eq!(format_amount(1_000, "sek"), "10.00 SEK");
    }

    #[test]
    fn dunning_email_substitutes_tokens_and_tracks() {
        let rendered = build_dunning_email(&config(), &merchant(), &invoice(), 1, None, 17);

        assert!(rendered.html.contains("Dana"));
        assert!(rendered.html.contains("$42.00"));
        assert!(rendered.html.contains("https://app.rebill.dev/track/click?"));
        assert!(rendered.html.contains("https://app.rebill.dev/track/open/17"));
        assert!(rendered.html.contains("Acme Billing"));
        assert!(!rendered.html.contains("{{"), "no unexpanded tokens");
        assert!(!rendered.text.contains('<'), "text part has no markup");
    }

    #[test]
    fn dunning_email_prefers_merchant_template() {
        let template = EmailTemplate {
            merchant_id: "m_1".into(),
            retry_attempt: 2,
            subject: "Pssst {{customer_name}}".into(),
            body: "<p>{{amount}} due. <a href=\"{{update_url}}\">Fix it</a></p>".into(),
        };
        let rendered =
            build_dunning_email(&config(), &merchant(), &invoice(), 2, Some(&template), 5);
        assert_eq!(rendered.subject, "Pssst Dana");
        assert!(rendered.html.contains("$42.00 due."));
    }

    #[test]
    fn escalating_default_subjects() {
        let first = build_dunning_email(&config(), &merchant(), &invoice(), 1, None, 1);
        let last = build_dunning_email(&config(), &merchant(), &invoice(), 3, None, 1);
        assert_ne!(first.subject, last.subject);
        assert!(last.subject.to_lowercase().contains("final"));
    }

    #[test]
    fn digest_email_totals() {
        let rendered = build_digest_email(&WeeklySummary {
            recovered_cents: 12_345,
            emails_sent: 9,
            total_opens: 4,
            total_clicks: 2,
        });
        assert!(rendered.subject.contains("$123.45"));
        assert!(rendered.html.contains("Recovery emails sent: 9"));
    }
}
