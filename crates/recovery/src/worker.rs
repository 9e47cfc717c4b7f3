//! Task worker
//!
//! Single cooperative loop per process replica: claim the earliest ready
//! task, dispatch on its type, record the outcome, repeat. Handler errors
//! never bubble into the loop; they become `failed` transitions. Replicas
//! coordinate purely through the skip-locked claim, so any number of workers
//! can run against the same queue.

use std::time::Duration as StdDuration;

use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use crate::digest::{DigestService, DIGEST_INTERVAL};
use crate::emails::EmailService;
use crate::error::{RecoveryError, RecoveryResult};
use crate::merchants::MerchantStore;
use crate::metered::{MeterReporter, REPORT_INTERVAL};
use crate::provider::ProviderClient;
use crate::tasks::{
    parse_payload, ActionRequiredPayload, DunningRetryPayload, Task, TaskQueue, TaskStatus,
    TaskType,
};
use crate::templates::TemplateStore;
use crate::usage::{metric, UsageLedger};

/// Pause after a processed task before looking for the next one.
const YIELD_AFTER_TASK: StdDuration = StdDuration::from_millis(100);
/// Idle sleep when the ready set is empty.
const POLL_INTERVAL: StdDuration = StdDuration::from_secs(1);
/// Backoff after an error in the claim itself.
const ERROR_BACKOFF: StdDuration = StdDuration::from_secs(5);

#[derive(Clone)]
pub struct TaskWorker {
    tasks: TaskQueue,
    merchants: MerchantStore,
    usage: UsageLedger,
    templates: TemplateStore,
    emails: EmailService,
    provider: ProviderClient,
    metered: MeterReporter,
    digest: DigestService,
}

impl TaskWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tasks: TaskQueue,
        merchants: MerchantStore,
        usage: UsageLedger,
        templates: TemplateStore,
        emails: EmailService,
        provider: ProviderClient,
        metered: MeterReporter,
        digest: DigestService,
    ) -> Self {
        Self {
            tasks,
            merchants,
            usage,
            templates,
            emails,
            provider,
            metered,
            digest,
        }
    }

    /// Poll loop; returns when `cancel` fires. An in-flight task always
    /// finishes before the loop exits.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!("Task worker starting");

        loop {
            if cancel.is_cancelled() {
                break;
            }

            match self.tasks.claim_next().await {
                Ok(Some(task)) => {
                    self.execute(task).await;
                    tokio::select! {
                        _ = tokio::time::sleep(YIELD_AFTER_TASK) => {}
                        _ = cancel.cancelled() => break,
                    }
                }
                Ok(None) => {
                    tokio::select! {
                        _ = tokio::time::sleep(POLL_INTERVAL) => {}
                        _ = cancel.cancelled() => break,
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Task claim failed; backing off");
                    tokio::select! {
                        _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                        _ = cancel.cancelled() => break,
                    }
                }
            }
        }

        tracing::info!("Task worker stopped");
    }

    /// Process one claimed task and record its terminal status.
    pub async fn execute(&self, task: Task) {
        let task_id = task.id;
        match self.process(&task).await {
            Ok(()) => {
                tracing::debug!(task_id, task_type = %task.task_type, "Task completed");
                if let Err(e) = self.tasks.update_status(task_id, TaskStatus::Completed).await {
                    tracing::error!(task_id, error = %e, "Failed to mark task completed");
                }
            }
            Err(e) => {
                tracing::warn!(
                    task_id,
                    task_type = %task.task_type,
                    merchant_id = %task.merchant_id,
                    error = %e,
                    "Task failed"
                );
                if let Err(e) = self.tasks.update_status(task_id, TaskStatus::Failed).await {
                    tracing::error!(task_id, error = %e, "Failed to mark task failed");
                }
            }
        }
    }

    async fn process(&self, task: &Task) -> RecoveryResult<()> {
        match task.task_type() {
            Some(TaskType::DunningRetry) => self.handle_dunning_retry(task).await,
            Some(TaskType::NotifyActionRequired) => self.handle_action_required(task).await,
            Some(TaskType::ReportUsage) => self.handle_report_usage().await,
            Some(TaskType::SendWeeklyDigest) => self.handle_weekly_digest(task).await,
            None => Err(RecoveryError::Payload {
                kind: "task",
                message: format!("unknown task type '{}'", task.task_type),
            }),
        }
    }

    async fn handle_dunning_retry(&self, task: &Task) -> RecoveryResult<()> {
        let payload: DunningRetryPayload = parse_payload("dunning_retry", &task.payload)?;
        let merchant = self.merchants.get(&task.merchant_id).await?;

        // Webhook-enqueued tasks bypass the ingress-time gate; backpressure
        // happens here, at processing time.
        let used = self.usage.monthly_dunning_count(&merchant.id).await?;
        let limit = merchant.plan().monthly_limit;
        if used >= limit {
            self.usage
                .create_usage_log(&merchant.id, metric::QUOTA_EXCEEDED, 1)
                .await?;
            return Err(RecoveryError::QuotaExceeded { used, limit });
        }

        let account = merchant
            .pp_account_id
            .as_deref()
            .ok_or_else(|| RecoveryError::NotConnected(merchant.id.clone()))?;
        let invoice = self
            .provider
            .for_account(account)
            .fetch_invoice(&payload.invoice_id)
            .await?;

        if invoice.is_settled() {
            tracing::info!(
                task_id = task.id,
                invoice_id = %invoice.id,
                status = %invoice.status,
                "Invoice already settled; no dunning needed"
            );
            return Ok(());
        }

        if !invoice.is_open() || invoice.customer_email.is_none() {
            tracing::debug!(
                task_id = task.id,
                invoice_id = %invoice.id,
                status = %invoice.status,
                "Invoice not actionable"
            );
            return Ok(());
        }

        let attempt = payload.attempt_count.unwrap_or(1);

        // The attempt is logged before the send: at-most-once delivery is
        // unachievable, so a failed send still counts against quota and the
        // idempotent meter upload absorbs the duplicate charge risk.
        let log = self
            .usage
            .create_usage_log(&merchant.id, metric::DUNNING_EMAIL_SENT, 1)
            .await?;

        let template = self
            .templates
            .get(&merchant.id, attempt.clamp(1, 3) as i32)
            .await?;
        self.emails
            .send_dunning(&merchant, &invoice, attempt, template.as_ref(), log.id)
            .await?;

        tracing::info!(
            task_id = task.id,
            merchant_id = %merchant.id,
            invoice_id = %invoice.id,
            attempt,
            usage_log_id = log.id,
            "Dunning email sent"
        );
        Ok(())
    }

    async fn handle_action_required(&self, task: &Task) -> RecoveryResult<()> {
        let payload: ActionRequiredPayload = parse_payload("notify_action_required", &task.payload)?;
        let merchant = self.merchants.get(&task.merchant_id).await?;

        let account = merchant
            .pp_account_id
            .as_deref()
            .ok_or_else(|| RecoveryError::NotConnected(merchant.id.clone()))?;
        let invoice = self
            .provider
            .for_account(account)
            .fetch_invoice(&payload.invoice_id)
            .await?;

        if invoice.customer_email.is_none() {
            tracing::debug!(
                task_id = task.id,
                invoice_id = %invoice.id,
                "No customer email on invoice; notification skipped"
            );
            return Ok(());
        }

        self.emails
            .send_action_required(&merchant, &invoice, payload.hosted_invoice_url.as_deref())
            .await?;
        self.usage
            .create_usage_log(&merchant.id, metric::DUNNING_EMAIL_SENT, 1)
            .await?;
        Ok(())
    }

    async fn handle_report_usage(&self) -> RecoveryResult<()> {
        let cycle = self.metered.run_cycle().await;

        // The chain must survive a failed cycle: enqueue the successor before
        // propagating, and let the watchdog backstop a failed enqueue.
        let successor = self
            .tasks
            .enqueue_system(
                TaskType::ReportUsage,
                OffsetDateTime::now_utc() + REPORT_INTERVAL,
            )
            .await;

        cycle?;
        successor?;
        Ok(())
    }

    async fn handle_weekly_digest(&self, task: &Task) -> RecoveryResult<()> {
        let result = self.digest.run_for(&task.merchant_id).await;

        let successor = self
            .tasks
            .enqueue(
                &task.merchant_id,
                TaskType::SendWeeklyDigest,
                serde_json::json!({}),
                OffsetDateTime::now_utc() + DIGEST_INTERVAL,
            )
            .await;

        result?;
        successor?;
        Ok(())
    }
}
