//! Usage reporting to the provider's metered-billing facility
//!
//! Drains unreported usage logs in id order and uploads one meter event per
//! log through the platform client, keyed by `usage_log_<id>` so replays are
//! free. Permanent provider errors settle the row anyway (poison-pill
//! isolation); transient errors leave it for the next cycle. The worker
//! enqueues the next cycle unconditionally, even when this one failed.

use time::Duration;

use crate::error::RecoveryResult;
use crate::merchants::MerchantStore;
use crate::provider::ProviderClient;
use crate::usage::{metric, UsageLedger, UsageLog};

/// Oldest-first batch size per cycle.
const REPORT_BATCH: i64 = 100;

/// Gap between reporter cycles.
pub const REPORT_INTERVAL: Duration = Duration::minutes(5);

/// Outcome counters for one reporting cycle.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReportCycle {
    /// Meter events accepted by the provider.
    pub uploaded: usize,
    /// Rows the provider had already charged under the same idempotency key.
    pub replayed: usize,
    /// Over-quota rows settled without an upload.
    pub skipped_quota: usize,
    /// Rows settled because the provider rejected them permanently.
    pub poisoned: usize,
    /// Rows left unreported for the next cycle (transient failures).
    pub deferred: usize,
    /// Rows settled because the merchant cannot be billed at all.
    pub unbillable: usize,
}

#[derive(Clone)]
pub struct MeterReporter {
    provider: ProviderClient,
    merchants: MerchantStore,
    usage: UsageLedger,
}

impl MeterReporter {
    pub fn new(provider: ProviderClient, merchants: MerchantStore, usage: UsageLedger) -> Self {
        Self {
            provider,
            merchants,
            usage,
        }
    }

    pub async fn run_cycle(&self) -> RecoveryResult<ReportCycle> {
        let logs = self.usage.fetch_unreported(REPORT_BATCH).await?;
        if logs.is_empty() {
            return Ok(ReportCycle::default());
        }

        // Group by merchant so the quota and customer lookups run once per
        // tenant rather than once per row.
        let mut by_merchant: std::collections::BTreeMap<String, Vec<UsageLog>> =
            std::collections::BTreeMap::new();
        for log in logs {
            by_merchant.entry(log.merchant_id.clone()).or_default().push(log);
        }

        let mut cycle = ReportCycle::default();
        let mut settled: Vec<i64> = Vec::new();

        for (merchant_id, logs) in by_merchant {
            self.report_merchant(&merchant_id, logs, &mut cycle, &mut settled)
                .await?;
        }

        self.usage.mark_reported(&settled).await?;

        tracing::info!(
            uploaded = cycle.uploaded,
            replayed = cycle.replayed,
            skipped_quota = cycle.skipped_quota,
            poisoned = cycle.poisoned,
            deferred = cycle.deferred,
            unbillable = cycle.unbillable,
            "Usage report cycle complete"
        );
        Ok(cycle)
    }

    async fn report_merchant(
        &self,
        merchant_id: &str,
        logs: Vec<UsageLog>,
        cycle: &mut ReportCycle,
        settled: &mut Vec<i64>,
    ) -> RecoveryResult<()> {
        let Some(merchant) = self.merchants.find(merchant_id).await? else {
            // Row orphaned mid-cycle by an erasure; nothing left to bill.
            settled.extend(logs.iter().map(|l| l.id));
            cycle.unbillable += logs.len();
            return Ok(());
        };

        let Some(customer_id) = merchant.pp_customer_id.clone() else {
            tracing::warn!(
                merchant_id = %merchant.id,
                count = logs.len(),
                "Merchant has no platform customer; settling usage without upload"
            );
            settled.extend(logs.iter().map(|l| l.id));
            cycle.unbillable += logs.len();
            return Ok(());
        };

        // Re-read the monthly count immediately before uploading; dunning
        // rows past the plan limit are settled without calling the provider
        // so the queue never wedges on an over-quota tenant.
        let monthly = self.usage.monthly_dunning_count(&merchant.id).await?;
        let limit = merchant.plan().monthly_limit;
        let over_quota = monthly > limit;

        for log in logs {
            if log.metric_type == metric::DUNNING_EMAIL_SENT && over_quota {
                settled.push(log.id);
                cycle.skipped_quota += 1;
                continue;
            }

            let idempotency_key = format!("usage_log_{}", log.id);
            match self
                .provider
                .post_meter_event(
                    &customer_id,
                    &log.metric_type,
                    i64::from(log.amount),
                    &idempotency_key,
                )
                .await
            {
                Ok(()) => {
                    settled.push(log.id);
                    cycle.uploaded += 1;
                }
                Err(e) if e.is_idempotent_replay() => {
                    // Safe, but worth surfacing: a replay here can mask an
                    // earlier crash between upload and settle.
                    tracing::warn!(
                        usage_log_id = log.id,
                        merchant_id = %merchant.id,
                        "Meter event already uploaded under this idempotency key"
                    );
                    settled.push(log.id);
                    cycle.replayed += 1;
                }
                Err(e) if e.is_permanent() => {
                    tracing::error!(
                        usage_log_id = log.id,
                        merchant_id = %merchant.id,
                        error = %e,
                        "Provider rejected meter event permanently; isolating row"
                    );
                    settled.push(log.id);
                    cycle.poisoned += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        usage_log_id = log.id,
                        merchant_id = %merchant.id,
                        error = %e,
                        "Transient meter-event failure; will retry next cycle"
                    );
                    cycle.deferred += 1;
                }
            }
        }

        Ok(())
    }
}
