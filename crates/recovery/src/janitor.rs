//! Self-healing janitor
//!
//! Two sweeps, in order: rescue zombie tasks (stuck in `running` because a
//! worker died mid-claim) back to `pending`, then prune idempotency-ledger
//! rows past the provider's retry horizon. Runs once at startup and every
//! ten minutes after that.

use std::time::Duration as StdDuration;

use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use crate::error::RecoveryResult;
use crate::events::{EventLedger, EVENT_RETENTION_DAYS};

/// A `running` task older than this is presumed orphaned.
const ZOMBIE_TIMEOUT_MINUTES: i32 = 10;

/// Gap between sweeps.
const SWEEP_INTERVAL: StdDuration = StdDuration::from_secs(600);

#[derive(Debug, Default, Clone, Copy)]
pub struct SweepStats {
    pub rescued: u64,
    pub pruned: u64,
}

#[derive(Clone)]
pub struct Janitor {
    pool: PgPool,
    events: EventLedger,
}

impl Janitor {
    pub fn new(pool: PgPool, events: EventLedger) -> Self {
        Self { pool, events }
    }

    /// Reset orphaned `running` tasks to `pending`, eligible immediately.
    /// The running-status lease is implicit in the age of the claim.
    async fn rescue_zombies(&self) -> RecoveryResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'pending', run_at = NOW()
            WHERE status = 'running'
              AND created_at < NOW() - make_interval(mins => $1)
            "#,
        )
        .bind(ZOMBIE_TIMEOUT_MINUTES)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn sweep(&self) -> RecoveryResult<SweepStats> {
        let rescued = self.rescue_zombies().await?;
        let pruned = self.events.prune(EVENT_RETENTION_DAYS).await?;

        if rescued > 0 || pruned > 0 {
            tracing::info!(rescued, pruned, "Janitor sweep complete");
        } else {
            tracing::debug!("Janitor sweep complete; nothing to do");
        }
        Ok(SweepStats { rescued, pruned })
    }

    /// Sweep immediately, then on every interval tick until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!("Janitor starting");

        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.sweep().await {
                        tracing::error!(error = %e, "Janitor sweep failed");
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }

        tracing::info!("Janitor stopped");
    }
}
