//! Usage ledger and daily rollups
//!
//! Every metered occurrence lands in `usage_logs`; the matching
//! `daily_metrics` row is upserted in the same transaction, so observers see
//! the log and its rollup together or not at all. `reported_at` moves from
//! NULL to a timestamp exactly once, when the meter reporter settles the row.

use sqlx::PgPool;
use time::OffsetDateTime;

use crate::error::RecoveryResult;

/// Known metric types. The column is an open string; these are the values
/// the engine itself writes.
pub mod metric {
    pub const DUNNING_EMAIL_SENT: &str = "dunning_email_sent";
    pub const RECOVERY_SUCCESS: &str = "recovery_success";
    pub const RECOVERY_FAILED: &str = "recovery_failed";
    pub const TASK_RETRY: &str = "task_retry";
    pub const TASK_SCHEDULED: &str = "task_scheduled";
    pub const MERCHANT_CONNECTED: &str = "merchant_connected";
    pub const MERCHANT_DISCONNECTED: &str = "merchant_disconnected";
    pub const QUOTA_EXCEEDED: &str = "quota_exceeded";
    pub const ACTION_REQUIRED_NOTIFICATION: &str = "action_required_notification";
    pub const SUBSCRIPTION_CHURNED: &str = "subscription_churned";
}

#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct UsageLog {
    pub id: i64,
    pub merchant_id: String,
    pub metric_type: String,
    pub amount: i32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub opened_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub clicked_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub reported_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Seven-day aggregate used by the weekly digest.
#[derive(Debug, Clone, Copy, Default, sqlx::FromRow, serde::Serialize)]
pub struct WeeklySummary {
    pub recovered_cents: i64,
    pub emails_sent: i64,
    pub total_opens: i64,
    pub total_clicks: i64,
}

/// Current-month aggregate for the dashboard.
#[derive(Debug, Clone, Copy, Default, sqlx::FromRow, serde::Serialize)]
pub struct MonthlyStats {
    pub recovered_cents: i64,
    pub emails_sent: i64,
    pub total_opens: i64,
    pub total_clicks: i64,
}

const LOG_COLUMNS: &str =
    "id, merchant_id, metric_type, amount, opened_at, clicked_at, reported_at, created_at";

#[derive(Clone)]
pub struct UsageLedger {
    pool: PgPool,
}

impl UsageLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a usage log and roll it into today's `daily_metrics` row
    /// atomically. On a `(merchant_id, metric_date)` collision the counters
    /// ADD; nothing is ever overwritten.
    pub async fn create_usage_log(
        &self,
        merchant_id: &str,
        metric_type: &str,
        amount: i32,
    ) -> RecoveryResult<UsageLog> {
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            "INSERT INTO usage_logs (merchant_id, metric_type, amount) \
             VALUES ($1, $2, $3) \
             RETURNING {LOG_COLUMNS}"
        );
        let log: UsageLog = sqlx::query_as(&sql)
            .bind(merchant_id)
            .bind(metric_type)
            .bind(amount)
            .fetch_one(&mut *tx)
            .await?;

        let emails_sent = if metric_type == metric::DUNNING_EMAIL_SENT {
            amount
        } else {
            0
        };
        sqlx::query(
            r#"
            INSERT INTO daily_metrics (merchant_id, metric_date, emails_sent)
            VALUES ($1, (NOW() AT TIME ZONE 'utc')::date, $2)
            ON CONFLICT (merchant_id, metric_date)
            DO UPDATE SET emails_sent = daily_metrics.emails_sent + EXCLUDED.emails_sent
            "#,
        )
        .bind(merchant_id)
        .bind(emails_sent)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(log)
    }

    /// Credit recovered revenue into today's rollup.
    pub async fn add_recovered_cents(&self, merchant_id: &str, cents: i64) -> RecoveryResult<()> {
        sqlx::query(
            r#"
            INSERT INTO daily_metrics (merchant_id, metric_date, recovered_cents)
            VALUES ($1, (NOW() AT TIME ZONE 'utc')::date, $2)
            ON CONFLICT (merchant_id, metric_date)
            DO UPDATE SET recovered_cents = daily_metrics.recovered_cents + EXCLUDED.recovered_cents
            "#,
        )
        .bind(merchant_id)
        .bind(cents)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Dunning emails counted against this month's quota, by the store's
    /// clock. Non-decreasing within a calendar month. The month boundary is
    /// anchored to UTC like every other aggregate here, so the quota gate
    /// and the rollups agree regardless of the session timezone.
    pub async fn monthly_dunning_count(&self, merchant_id: &str) -> RecoveryResult<i64> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COALESCE(SUM(amount), 0)::BIGINT
            FROM usage_logs
            WHERE merchant_id = $1
              AND metric_type = $2
              AND created_at >= date_trunc('month', NOW() AT TIME ZONE 'utc') AT TIME ZONE 'utc'
            "#,
        )
        .bind(merchant_id)
        .bind(metric::DUNNING_EMAIL_SENT)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Oldest rows the meter reporter has not yet settled.
    pub async fn fetch_unreported(&self, limit: i64) -> RecoveryResult<Vec<UsageLog>> {
        let sql = format!(
            "SELECT {LOG_COLUMNS} FROM usage_logs \
             WHERE reported_at IS NULL \
             ORDER BY id ASC LIMIT $1"
        );
        Ok(sqlx::query_as(&sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?)
    }

    /// Settle a batch of logs. The `reported_at IS NULL` guard keeps the
    /// null -> timestamp transition one-way.
    pub async fn mark_reported(&self, ids: &[i64]) -> RecoveryResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            "UPDATE usage_logs SET reported_at = NOW() \
             WHERE id = ANY($1) AND reported_at IS NULL",
        )
        .bind(ids)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Record an open-pixel hit. Returns false for unknown log ids.
    pub async fn record_open(&self, log_id: i64) -> RecoveryResult<bool> {
        let mut tx = self.pool.begin().await?;

        let merchant: Option<(String,)> = sqlx::query_as(
            "UPDATE usage_logs SET opened_at = COALESCE(opened_at, NOW()) \
             WHERE id = $1 RETURNING merchant_id",
        )
        .bind(log_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((merchant_id,)) = merchant else {
            tx.commit().await?;
            return Ok(false);
        };

        sqlx::query(
            r#"
            INSERT INTO daily_metrics (merchant_id, metric_date, total_opens)
            VALUES ($1, (NOW() AT TIME ZONE 'utc')::date, 1)
            ON CONFLICT (merchant_id, metric_date)
            DO UPDATE SET total_opens = daily_metrics.total_opens + 1
            "#,
        )
        .bind(&merchant_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Record a verified click-through. Returns false for unknown log ids.
    pub async fn record_click(&self, log_id: i64) -> RecoveryResult<bool> {
        let mut tx = self.pool.begin().await?;

        let merchant: Option<(String,)> = sqlx::query_as(
            "UPDATE usage_logs SET clicked_at = COALESCE(clicked_at, NOW()) \
             WHERE id = $1 RETURNING merchant_id",
        )
        .bind(log_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((merchant_id,)) = merchant else {
            tx.commit().await?;
            return Ok(false);
        };

        sqlx::query(
            r#"
            INSERT INTO daily_metrics (merchant_id, metric_date, total_clicks)
            VALUES ($1, (NOW() AT TIME ZONE 'utc')::date, 1)
            ON CONFLICT (merchant_id, metric_date)
            DO UPDATE SET total_clicks = daily_metrics.total_clicks + 1
            "#,
        )
        .bind(&merchant_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    pub async fn recent(&self, merchant_id: &str, limit: i64) -> RecoveryResult<Vec<UsageLog>> {
        let sql = format!(
            "SELECT {LOG_COLUMNS} FROM usage_logs \
             WHERE merchant_id = $1 \
             ORDER BY created_at DESC, id DESC LIMIT $2"
        );
        Ok(sqlx::query_as(&sql)
            .bind(merchant_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?)
    }

    pub async fn weekly_summary(&self, merchant_id: &str) -> RecoveryResult<WeeklySummary> {
        let summary: WeeklySummary = sqlx::query_as(
            r#"
            SELECT
                COALESCE(SUM(recovered_cents), 0)::BIGINT AS recovered_cents,
                COALESCE(SUM(emails_sent), 0)::BIGINT     AS emails_sent,
                COALESCE(SUM(total_opens), 0)::BIGINT     AS total_opens,
                COALESCE(SUM(total_clicks), 0)::BIGINT    AS total_clicks
            FROM daily_metrics
            WHERE merchant_id = $1
              AND metric_date >= (NOW() AT TIME ZONE 'utc')::date - 6
            "#,
        )
        .bind(merchant_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(summary)
    }

    pub async fn monthly_stats(&self, merchant_id: &str) -> RecoveryResult<MonthlyStats> {
        let stats: MonthlyStats = sqlx::query_as(
            r#"
            SELECT
                COALESCE(SUM(recovered_cents), 0)::BIGINT AS recovered_cents,
                COALESCE(SUM(emails_sent), 0)::BIGINT     AS emails_sent,
                COALESCE(SUM(total_opens), 0)::BIGINT     AS total_opens,
                COALESCE(SUM(total_clicks), 0)::BIGINT    AS total_clicks
            FROM daily_metrics
            WHERE merchant_id = $1
              AND metric_date >= date_trunc('month', NOW() AT TIME ZONE 'utc')::date
            "#,
        )
        .bind(merchant_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(stats)
    }

    pub async fn delete_logs_for(&self, merchant_id: &str) -> RecoveryResult<u64> {
        let result = sqlx::query("DELETE FROM usage_logs WHERE merchant_id = $1")
            .bind(merchant_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn delete_daily_metrics_for(&self, merchant_id: &str) -> RecoveryResult<u64> {
        let result = sqlx::query("DELETE FROM daily_metrics WHERE merchant_id = $1")
            .bind(merchant_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
