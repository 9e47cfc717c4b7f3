//! Weekly operator digest
//!
//! Per-merchant self-scheduling task: aggregate the last seven days of daily
//! rollups and mail them to the merchant. Merchants without an email address
//! still keep their chain alive; the send is simply skipped.

use time::Duration;

use crate::emails::EmailService;
use crate::error::RecoveryResult;
use crate::merchants::MerchantStore;
use crate::usage::UsageLedger;

/// Gap between digest runs for one merchant.
pub const DIGEST_INTERVAL: Duration = Duration::days(7);

#[derive(Clone)]
pub struct DigestService {
    merchants: MerchantStore,
    usage: UsageLedger,
    emails: EmailService,
}

impl DigestService {
    pub fn new(merchants: MerchantStore, usage: UsageLedger, emails: EmailService) -> Self {
        Self {
            merchants,
            usage,
            emails,
        }
    }

    pub async fn run_for(&self, merchant_id: &str) -> RecoveryResult<()> {
        let merchant = self.merchants.get(merchant_id).await?;
        let summary = self.usage.weekly_summary(merchant_id).await?;

        if merchant.email.is_none() {
            tracing::debug!(merchant_id = %merchant_id, "Merchant has no email; digest skipped");
            return Ok(());
        }

        self.emails.send_weekly_digest(&merchant, &summary).await?;
        tracing::info!(
            merchant_id = %merchant_id,
            emails_sent = summary.emails_sent,
            recovered_cents = summary.recovered_cents,
            "Weekly digest sent"
        );
        Ok(())
    }
}
