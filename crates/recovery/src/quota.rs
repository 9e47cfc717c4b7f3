//! Quota gates
//!
//! Two limits per plan: dunning emails per calendar month and pending tasks
//! in the queue. The API gate rejects user-initiated task creation up front;
//! the worker re-checks the monthly limit at `dunning_retry` entry because
//! webhook-enqueued tasks must be back-pressured at processing time, not at
//! enqueue time; the meter reporter re-checks once more before each upload.

use crate::error::RecoveryResult;
use crate::plans::Plan;
use crate::tasks::TaskQueue;
use crate::usage::UsageLedger;

#[derive(Debug, Clone, Copy)]
pub struct QuotaCheck {
    pub used: i64,
    pub limit: i64,
}

impl QuotaCheck {
    pub fn exceeded(&self) -> bool {
        self.used >= self.limit
    }
}

#[derive(Clone)]
pub struct QuotaService {
    usage: UsageLedger,
    tasks: TaskQueue,
}

impl QuotaService {
    pub fn new(usage: UsageLedger, tasks: TaskQueue) -> Self {
        Self { usage, tasks }
    }

    /// Dunning emails sent this month against the plan's monthly limit.
    pub async fn monthly(&self, merchant_id: &str, plan: &Plan) -> RecoveryResult<QuotaCheck> {
        let used = self.usage.monthly_dunning_count(merchant_id).await?;
        Ok(QuotaCheck {
            used,
            limit: plan.monthly_limit,
        })
    }

    /// Pending tasks against the plan's queue limit.
    pub async fn queue(&self, merchant_id: &str, plan: &Plan) -> RecoveryResult<QuotaCheck> {
        let used = self.tasks.pending_count(merchant_id).await?;
        Ok(QuotaCheck {
            used,
            limit: plan.queue_limit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exceeded_at_and_past_limit() {
        assert!(!QuotaCheck { used: 19, limit: 20 }.exceeded());
        assert!(QuotaCheck { used: 20, limit: 20 }.exceeded());
        assert!(QuotaCheck { used: 21, limit: 20 }.exceeded());
    }
}
