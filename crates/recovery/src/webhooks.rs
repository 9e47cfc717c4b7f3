//! Webhook ingress
//!
//! Verifies the provider's signature header, takes the idempotency lock, and
//! routes by event type. Routing is a pure decision (`route_event`) so the
//! table can be tested without a database; `handle_event` executes the chosen
//! action. Callers must verify the signature before handing the event over;
//! a duplicate returns `Ignored` with no side effects.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use time::OffsetDateTime;

use crate::error::{RecoveryError, RecoveryResult};
use crate::events::EventLedger;
use crate::merchants::MerchantStore;
use crate::tasks::{retry_delay, TaskQueue, TaskType};
use crate::usage::{metric, UsageLedger};

type HmacSha256 = Hmac<Sha256>;

/// Signed-payload tolerance; anything older is rejected as a replay.
const SIGNATURE_TOLERANCE_SECONDS: i64 = 300;

/// Plan id a merchant falls back to when their platform subscription lapses.
pub const FALLBACK_PLAN_ID: &str = "price_free";

// =============================================================================
// Signature verification
// =============================================================================

/// Verify a `t=<unix>,v1=<hex>` signature header against the raw body.
pub fn verify_signature(secret: &str, payload: &str, header: &str) -> RecoveryResult<()> {
    verify_signature_at(secret, payload, header, OffsetDateTime::now_utc().unix_timestamp())
}

fn verify_signature_at(
    secret: &str,
    payload: &str,
    header: &str,
    now_unix: i64,
) -> RecoveryResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut v1_signature: Option<&str> = None;

    for part in header.split(',') {
        let kv: Vec<&str> = part.trim().splitn(2, '=').collect();
        if kv.len() == 2 {
            match kv[0] {
                "t" => timestamp = kv[1].parse().ok(),
                "v1" => v1_signature = Some(kv[1]),
                _ => {}
            }
        }
    }

    let timestamp = timestamp.ok_or(RecoveryError::WebhookSignatureInvalid)?;
    let v1_signature = v1_signature.ok_or(RecoveryError::WebhookSignatureInvalid)?;

    if (now_unix - timestamp).abs() > SIGNATURE_TOLERANCE_SECONDS {
        return Err(RecoveryError::WebhookSignatureInvalid);
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| RecoveryError::WebhookSignatureInvalid)?;
    mac.update(format!("{timestamp}.").as_bytes());
    mac.update(payload.as_bytes());

    let expected = hex::decode(v1_signature).map_err(|_| RecoveryError::WebhookSignatureInvalid)?;
    mac.verify_slice(&expected)
        .map_err(|_| RecoveryError::WebhookSignatureInvalid)
}

// =============================================================================
// Event model
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    /// Connected-account id; present when the event originated on a tenant
    /// account rather than the platform account.
    #[serde(default)]
    pub account: Option<String>,
    pub data: EventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventData {
    pub object: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct InvoiceObject {
    id: String,
    #[serde(default)]
    billing_reason: Option<String>,
    #[serde(default)]
    attempt_count: Option<i64>,
    #[serde(default)]
    hosted_invoice_url: Option<String>,
    #[serde(default)]
    amount_paid: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionObject {
    #[serde(default)]
    status: String,
    #[serde(default)]
    customer: Option<String>,
    #[serde(default)]
    plan: Option<PlanRef>,
}

#[derive(Debug, Deserialize)]
struct PlanRef {
    id: String,
}

// =============================================================================
// Routing
// =============================================================================

/// What the ingress decided to do with an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum EventAction {
    /// Enqueue a dunning retry with the schedule delay for `attempt_count`.
    ScheduleDunning {
        account: String,
        invoice_id: String,
        attempt_count: i64,
    },
    /// Enqueue an immediate SCA/3DS notification.
    NotifyActionRequired {
        account: String,
        invoice_id: String,
        hosted_invoice_url: Option<String>,
    },
    /// Record end-customer churn on a tenant account.
    RecordChurn {
        account: Option<String>,
        customer: Option<String>,
    },
    /// Mirror the merchant's platform subscription onto their plan id.
    SyncPlan {
        customer: String,
        plan_id: String,
    },
    /// Sentinel recovery-success handler.
    RecordRecovery {
        account: String,
        invoice_id: String,
        amount_paid: i64,
    },
    Ignore(&'static str),
}

fn parse_object<T: serde::de::DeserializeOwned>(
    kind: &'static str,
    event: &ProviderEvent,
) -> RecoveryResult<T> {
    serde_json::from_value(event.data.object.clone()).map_err(|e| RecoveryError::Payload {
        kind,
        message: e.to_string(),
    })
}

/// Pure routing table from event types to actions.
pub(crate) fn route_event(event: &ProviderEvent) -> RecoveryResult<EventAction> {
    match event.event_type.as_str() {
        "invoice.payment_failed" => {
            let invoice: InvoiceObject = parse_object("invoice", event)?;
            let Some(account) = event.account.clone() else {
                return Ok(EventAction::Ignore("payment_failed without account"));
            };
            // Only renewals are in scope for recovery; first charges, plan
            // changes, and manual invoices stay with the provider's own flow.
            if invoice.billing_reason.as_deref() != Some("subscription_cycle") {
                return Ok(EventAction::Ignore("billing reason out of scope"));
            }
            Ok(EventAction::ScheduleDunning {
                account,
                invoice_id: invoice.id,
                attempt_count: invoice.attempt_count.unwrap_or(1),
            })
        }
        "invoice.payment_action_required" => {
            let invoice: InvoiceObject = parse_object("invoice", event)?;
            let Some(account) = event.account.clone() else {
                return Ok(EventAction::Ignore("action_required without account"));
            };
            Ok(EventAction::NotifyActionRequired {
                account,
                invoice_id: invoice.id,
                hosted_invoice_url: invoice.hosted_invoice_url,
            })
        }
        "invoice.payment_succeeded" => {
            let invoice: InvoiceObject = parse_object("invoice", event)?;
            let Some(account) = event.account.clone() else {
                return Ok(EventAction::Ignore("payment_succeeded without account"));
            };
            Ok(EventAction::RecordRecovery {
                account,
                invoice_id: invoice.id,
                amount_paid: invoice.amount_paid.unwrap_or(0),
            })
        }
        "customer.subscription.deleted" => {
            let sub: SubscriptionObject = parse_object("subscription", event)?;
            Ok(EventAction::RecordChurn {
                account: event.account.clone(),
                customer: sub.customer,
            })
        }
        "customer.subscription.created" | "customer.subscription.updated" => {
            // Trust boundary: subscription events carrying a tenant account id
            // must never mutate platform billing state.
            if event.account.is_some() {
                return Ok(EventAction::Ignore("tenant-side subscription event"));
            }
            let sub: SubscriptionObject = parse_object("subscription", event)?;
            let Some(customer) = sub.customer else {
                return Ok(EventAction::Ignore("subscription without customer"));
            };
            let plan_id = match sub.status.as_str() {
                "active" | "trialing" => sub
                    .plan
                    .map(|p| p.id)
                    .unwrap_or_else(|| FALLBACK_PLAN_ID.to_string()),
                _ => FALLBACK_PLAN_ID.to_string(),
            };
            Ok(EventAction::SyncPlan { customer, plan_id })
        }
        _ => Ok(EventAction::Ignore("unhandled event type")),
    }
}

// =============================================================================
// Handler
// =============================================================================

/// Terminal outcome reported back to the HTTP layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    Processed,
    Ignored,
    Duplicate,
}

#[derive(Clone)]
pub struct WebhookHandler {
    merchants: MerchantStore,
    tasks: TaskQueue,
    usage: UsageLedger,
    events: EventLedger,
}

impl WebhookHandler {
    pub fn new(
        merchants: MerchantStore,
        tasks: TaskQueue,
        usage: UsageLedger,
        events: EventLedger,
    ) -> Self {
        Self {
            merchants,
            tasks,
            usage,
            events,
        }
    }

    pub fn parse_event(payload: &str) -> RecoveryResult<ProviderEvent> {
        serde_json::from_str(payload).map_err(|e| RecoveryError::Payload {
            kind: "webhook event",
            message: e.to_string(),
        })
    }

    /// Process one verified event. The idempotency lock is taken first; a
    /// loser performs no side effects at all.
    pub async fn handle_event(&self, event: ProviderEvent) -> RecoveryResult<WebhookOutcome> {
        if !self.events.attempt_lock(&event.id).await? {
            tracing::info!(event_id = %event.id, "Duplicate webhook event ignored");
            return Ok(WebhookOutcome::Duplicate);
        }

        let action = route_event(&event)?;
        tracing::debug!(
            event_id = %event.id,
            event_type = %event.event_type,
            action = ?action,
            "Webhook event routed"
        );

        match action {
            EventAction::ScheduleDunning {
                account,
                invoice_id,
                attempt_count,
            } => {
                let Some(merchant) = self.merchants.find_by_account(&account).await? else {
                    // Account ids are redacted from logs; the event id is
                    // enough to find the delivery in the provider dashboard.
                    tracing::warn!(event_id = %event.id, "Webhook for unknown connected account");
                    return Ok(WebhookOutcome::Ignored);
                };

                let run_at = OffsetDateTime::now_utc() + retry_delay(attempt_count);
                let payload = serde_json::json!({
                    "invoiceId": invoice_id,
                    "attemptCount": attempt_count,
                });
                let task = self
                    .tasks
                    .enqueue(&merchant.id, TaskType::DunningRetry, payload, run_at)
                    .await?;
                self.usage
                    .create_usage_log(&merchant.id, metric::TASK_SCHEDULED, 1)
                    .await?;

                tracing::info!(
                    event_id = %event.id,
                    merchant_id = %merchant.id,
                    task_id = task.id,
                    attempt_count,
                    "Dunning retry scheduled"
                );
                Ok(WebhookOutcome::Processed)
            }

            EventAction::NotifyActionRequired {
                account,
                invoice_id,
                hosted_invoice_url,
            } => {
                let Some(merchant) = self.merchants.find_by_account(&account).await? else {
                    tracing::warn!(event_id = %event.id, "Webhook for unknown connected account");
                    return Ok(WebhookOutcome::Ignored);
                };

                let mut payload = serde_json::json!({ "invoiceId": invoice_id });
                if let Some(url) = hosted_invoice_url {
                    payload["hostedInvoiceUrl"] = serde_json::Value::String(url);
                }
                self.tasks
                    .enqueue(
                        &merchant.id,
                        TaskType::NotifyActionRequired,
                        payload,
                        OffsetDateTime::now_utc(),
                    )
                    .await?;
                self.usage
                    .create_usage_log(&merchant.id, metric::ACTION_REQUIRED_NOTIFICATION, 1)
                    .await?;
                Ok(WebhookOutcome::Processed)
            }

            EventAction::RecordChurn { account, customer } => {
                let merchant = match (&account, &customer) {
                    (Some(account), _) => self.merchants.find_by_account(account).await?,
                    (None, Some(customer)) => self.merchants.find_by_customer(customer).await?,
                    (None, None) => None,
                };
                let Some(merchant) = merchant else {
                    return Ok(WebhookOutcome::Ignored);
                };
                self.usage
                    .create_usage_log(&merchant.id, metric::SUBSCRIPTION_CHURNED, 1)
                    .await?;
                Ok(WebhookOutcome::Processed)
            }

            EventAction::SyncPlan { customer, plan_id } => {
                let Some(merchant) = self.merchants.find_by_customer(&customer).await? else {
                    tracing::warn!(customer = %customer, "Subscription event for unknown customer");
                    return Ok(WebhookOutcome::Ignored);
                };
                self.merchants.set_plan(&merchant.id, &plan_id).await?;
                tracing::info!(merchant_id = %merchant.id, plan_id = %plan_id, "Plan synced");
                Ok(WebhookOutcome::Processed)
            }

            EventAction::RecordRecovery {
                account,
                invoice_id,
                amount_paid,
            } => {
                let Some(merchant) = self.merchants.find_by_account(&account).await? else {
                    return Ok(WebhookOutcome::Ignored);
                };
                self.usage
                    .create_usage_log(&merchant.id, metric::RECOVERY_SUCCESS, 1)
                    .await?;
                // TODO: credit amount_paid into the daily rollup via
                // add_recovered_cents once recovered-revenue accounting is
                // signed off; until then nothing is written.
                let _ = amount_paid;

                tracing::info!(
                    merchant_id = %merchant.id,
                    invoice_id = %invoice_id,
                    "Recovery success recorded"
                );
                Ok(WebhookOutcome::Processed)
            }

            EventAction::Ignore(reason) => {
                tracing::debug!(event_id = %event.id, reason, "Webhook event ignored");
                Ok(WebhookOutcome::Ignored)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, payload: &str, timestamp: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("{timestamp}.").as_bytes());
        mac.update(payload.as_bytes());
        format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn accepts_valid_signature() {
        let header = sign("whsec_test", "{}", 1_700_000_000);
        assert!(verify_signature_at("whsec_test", "{}", &header, 1_700_000_000).is_ok());
    }

    #[test]
    fn rejects_wrong_secret_and_tampered_body() {
        let header = sign("whsec_test", "{}", 1_700_000_000);
        assert!(verify_signature_at("whsec_other", "{}", &header, 1_700_000_000).is_err());
        assert!(verify_signature_at("whsec_test", "{\"a\":1}", &header, 1_700_000_000).is_err());
    }

    #[test]
    fn rejects_stale_timestamp() {
        let header = sign("whsec_test", "{}", 1_700_000_000);
        assert!(verify_signature_at("whsec_test", "{}", &header, 1_700_000_000 + 301).is_err());
        assert!(verify_signature_at("whsec_test", "{}", &header, 1_700_000_000 + 299).is_ok());
    }

    #[test]
    fn rejects_malformed_header() {
        assert!(verify_signature_at("whsec_test", "{}", "", 0).is_err());
        assert!(verify_signature_at("whsec_test", "{}", "t=abc,v1=00", 0).is_err());
        assert!(verify_signature_at("whsec_test", "{}", "v1=00", 0).is_err());
    }

    fn event(event_type: &str, account: Option<&str>, object: serde_json::Value) -> ProviderEvent {
        ProviderEvent {
            id: "evt_1".into(),
            event_type: event_type.into(),
            account: account.map(String::from),
            data: EventData { object },
        }
    }

    #[test]
    fn renewal_failure_schedules_dunning() {
        let e = event(
            "invoice.payment_failed",
            Some("acct_A"),
            serde_json::json!({
                "id": "in_1",
                "billing_reason": "subscription_cycle",
                "attempt_count": 1
            }),
        );
        assert_eq!(
            route_event(&e).unwrap(),
            EventAction::ScheduleDunning {
                account: "acct_A".into(),
                invoice_id: "in_1".into(),
                attempt_count: 1,
            }
        );
    }

    #[test]
    fn first_charge_failure_is_ignored() {
        let e = event(
            "invoice.payment_failed",
            Some("acct_A"),
            serde_json::json!({
                "id": "in_1",
                "billing_reason": "subscription_create",
                "attempt_count": 1
            }),
        );
        assert!(matches!(
            route_event(&e).unwrap(),
            EventAction::Ignore("billing reason out of scope")
        ));
    }

    #[test]
    fn missing_attempt_count_defaults_to_one() {
        let e = event(
            "invoice.payment_failed",
            Some("acct_A"),
            serde_json::json!({ "id": "in_1", "billing_reason": "subscription_cycle" }),
        );
        match route_event(&e).unwrap() {
            EventAction::ScheduleDunning { attempt_count, .. } => assert_eq!(attempt_count, 1),
            other => panic!("unexpected action: {other:?}"),
        }
    }

    #[test]
    fn tenant_subscription_events_never_touch_plans() {
        let e = event(
            "customer.subscription.updated",
            Some("acct_A"),
            serde_json::json!({
                "status": "active",
                "customer": "cus_1",
                "plan": { "id": "price_scale" }
            }),
        );
        assert!(matches!(
            route_event(&e).unwrap(),
            EventAction::Ignore("tenant-side subscription event")
        ));
    }

    #[test]
    fn platform_subscription_updates_plan() {
        let e = event(
            "customer.subscription.updated",
            None,
            serde_json::json!({
                "status": "active",
                "customer": "cus_1",
                "plan": { "id": "price_growth" }
            }),
        );
        assert_eq!(
            route_event(&e).unwrap(),
            EventAction::SyncPlan {
                customer: "cus_1".into(),
                plan_id: "price_growth".into(),
            }
        );
    }

    #[test]
    fn lapsed_subscription_falls_back_to_free() {
        for status in ["canceled", "past_due", "unpaid", "incomplete"] {
            let e = event(
                "customer.subscription.updated",
                None,
                serde_json::json!({
                    "status": status,
                    "customer": "cus_1",
                    "plan": { "id": "price_growth" }
                }),
            );
            assert_eq!(
                route_event(&e).unwrap(),
                EventAction::SyncPlan {
                    customer: "cus_1".into(),
                    plan_id: FALLBACK_PLAN_ID.into(),
                },
                "status {status} should fall back"
            );
        }
    }

    #[test]
    fn unknown_event_types_are_ignored() {
        let e = event("charge.refunded", None, serde_json::json!({}));
        assert!(matches!(
            route_event(&e).unwrap(),
            EventAction::Ignore("unhandled event type")
        ));
    }

    #[test]
    fn action_required_routes_immediately() {
        let e = event(
            "invoice.payment_action_required",
            Some("acct_A"),
            serde_json::json!({
                "id": "in_9",
                "hosted_invoice_url": "https://pay.example/in_9"
            }),
        );
        assert_eq!(
            route_event(&e).unwrap(),
            EventAction::NotifyActionRequired {
                account: "acct_A".into(),
                invoice_id: "in_9".into(),
                hosted_invoice_url: Some("https://pay.example/in_9".into()),
            }
        );
    }
}
