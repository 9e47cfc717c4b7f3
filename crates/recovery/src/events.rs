//! Idempotency ledger
//!
//! First-writer-wins lock on external event ids. The provider retries
//! webhook deliveries and multiple replicas may see the same event
//! concurrently; exactly one `attempt_lock` call per id returns true, and the
//! insert itself is the commit point; there is no separate "mark processed"
//! step. Losers must not perform side effects.

use sqlx::PgPool;

use crate::error::RecoveryResult;

/// Rows older than this are pruned; must exceed the provider's webhook
/// retry horizon.
pub const EVENT_RETENTION_DAYS: i32 = 7;

#[derive(Clone)]
pub struct EventLedger {
    pool: PgPool,
}

impl EventLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Try to take the processing lock for an event id.
    ///
    /// Returns true iff this caller is the first writer. A conflicting
    /// insert is not an error; it resolves as "lock not acquired".
    pub async fn attempt_lock(&self, event_id: &str) -> RecoveryResult<bool> {
        let result = sqlx::query(
            "INSERT INTO processed_events (event_id) VALUES ($1) \
             ON CONFLICT (event_id) DO NOTHING",
        )
        .bind(event_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Delete ledger rows past the retention window.
    pub async fn prune(&self, max_age_days: i32) -> RecoveryResult<u64> {
        let result = sqlx::query(
            "DELETE FROM processed_events \
             WHERE processed_at < NOW() - make_interval(days => $1)",
        )
        .bind(max_age_days)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
