//! Watchdog bootstrap
//!
//! Self-scheduling tasks form a durable chain: every run enqueues its own
//! successor. The watchdog resurrects the chain at process start if any link
//! was lost: exactly one live `report_usage` under the system merchant, and
//! one live `send_weekly_digest` per real merchant.

use time::OffsetDateTime;

use crate::error::RecoveryResult;
use crate::merchants::{MerchantStore, SYSTEM_MERCHANT_ID};
use crate::tasks::{TaskQueue, TaskType};

pub struct Watchdog {
    merchants: MerchantStore,
    tasks: TaskQueue,
}

impl Watchdog {
    pub fn new(merchants: MerchantStore, tasks: TaskQueue) -> Self {
        Self { merchants, tasks }
    }

    pub async fn bootstrap(&self) -> RecoveryResult<()> {
        self.merchants.ensure_system_row().await?;

        let live = self
            .tasks
            .live_count(SYSTEM_MERCHANT_ID, TaskType::ReportUsage)
            .await?;
        if live == 0 {
            let task = self
                .tasks
                .enqueue_system(TaskType::ReportUsage, OffsetDateTime::now_utc())
                .await?;
            tracing::warn!(task_id = task.id, "Usage reporter chain was lost; recreated");
        }

        let mut recreated = 0u32;
        for merchant_id in self.merchants.all_non_system_ids().await? {
            let live = self
                .tasks
                .live_count(&merchant_id, TaskType::SendWeeklyDigest)
                .await?;
            if live == 0 {
                self.tasks
                    .enqueue(
                        &merchant_id,
                        TaskType::SendWeeklyDigest,
                        serde_json::json!({}),
                        OffsetDateTime::now_utc(),
                    )
                    .await?;
                recreated += 1;
            }
        }

        if recreated > 0 {
            tracing::warn!(recreated, "Weekly digest chains were lost; recreated");
        }

        tracing::info!("Watchdog bootstrap complete");
        Ok(())
    }
}
