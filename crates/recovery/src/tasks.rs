//! Durable task queue
//!
//! Database-backed work queue with exactly-once claim semantics. The claim
//! takes the earliest ready `pending` row under `FOR UPDATE SKIP LOCKED` and
//! flips it to `running` in the same transaction, so concurrent workers never
//! block each other and never double-claim. Status transitions form the DAG
//! pending -> running -> {completed, failed}; the janitor may reset a stale
//! `running` row back to `pending`.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};

use crate::error::{RecoveryError, RecoveryResult};
use crate::merchants::SYSTEM_MERCHANT_ID;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskType {
    DunningRetry,
    NotifyActionRequired,
    ReportUsage,
    SendWeeklyDigest,
}

impl TaskType {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::DunningRetry => "dunning_retry",
            TaskType::NotifyActionRequired => "notify_action_required",
            TaskType::ReportUsage => "report_usage",
            TaskType::SendWeeklyDigest => "send_weekly_digest",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "dunning_retry" => Some(TaskType::DunningRetry),
            "notify_action_required" => Some(TaskType::NotifyActionRequired),
            "report_usage" => Some(TaskType::ReportUsage),
            "send_weekly_digest" => Some(TaskType::SendWeeklyDigest),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "running" => Some(TaskStatus::Running),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct Task {
    pub id: i64,
    pub merchant_id: String,
    pub task_type: String,
    pub payload: serde_json::Value,
    pub status: String,
    #[serde(with = "time::serde::rfc3339")]
    pub run_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Task {
    pub fn task_type(&self) -> Option<TaskType> {
        TaskType::parse(&self.task_type)
    }
}

/// Payload of a `dunning_retry` task. Unknown fields are rejected so a
/// mis-shaped enqueue fails loudly at handler entry instead of half-working.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct DunningRetryPayload {
    pub invoice_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt_count: Option<i64>,
}

/// Payload of a `notify_action_required` task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ActionRequiredPayload {
    pub invoice_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hosted_invoice_url: Option<String>,
}

pub fn parse_payload<T: serde::de::DeserializeOwned>(
    kind: &'static str,
    payload: &serde_json::Value,
) -> RecoveryResult<T> {
    serde_json::from_value(payload.clone()).map_err(|e| RecoveryError::Payload {
        kind,
        message: e.to_string(),
    })
}

/// Delay before the next dunning attempt, keyed by how many times the
/// provider has already tried the charge.
pub fn retry_delay(attempt_count: i64) -> Duration {
    match attempt_count {
        1 => Duration::days(3),
        2 => Duration::days(5),
        _ => Duration::days(7),
    }
}

const TASK_COLUMNS: &str = "id, merchant_id, task_type, payload, status, run_at, created_at";

#[derive(Clone)]
pub struct TaskQueue {
    pool: PgPool,
}

impl TaskQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn enqueue(
        &self,
        merchant_id: &str,
        task_type: TaskType,
        payload: serde_json::Value,
        run_at: OffsetDateTime,
    ) -> RecoveryResult<Task> {
        let sql = format!(
            "INSERT INTO tasks (merchant_id, task_type, payload, status, run_at) \
             VALUES ($1, $2, $3, 'pending', $4) \
             RETURNING {TASK_COLUMNS}"
        );
        let task: Task = sqlx::query_as(&sql)
            .bind(merchant_id)
            .bind(task_type.as_str())
            .bind(payload)
            .bind(run_at)
            .fetch_one(&self.pool)
            .await?;

        tracing::debug!(
            task_id = task.id,
            merchant_id = %task.merchant_id,
            task_type = %task.task_type,
            "Task enqueued"
        );
        Ok(task)
    }

    /// Claim the earliest ready task, if any.
    ///
    /// At most one claimant ever sees a given task: the row is selected
    /// `FOR UPDATE SKIP LOCKED` and moved to `running` before the
    /// transaction commits. Contended rows are skipped, not waited on.
    pub async fn claim_next(&self) -> RecoveryResult<Option<Task>> {
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            r#"
            SELECT {TASK_COLUMNS}
            FROM tasks
            WHERE status = 'pending' AND run_at <= NOW()
            ORDER BY run_at ASC, id ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#
        );
        let row: Option<Task> = sqlx::query_as(&sql).fetch_optional(&mut *tx).await?;

        let Some(mut task) = row else {
            tx.commit().await?;
            return Ok(None);
        };

        sqlx::query("UPDATE tasks SET status = 'running' WHERE id = $1")
            .bind(task.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        task.status = TaskStatus::Running.as_str().to_string();
        Ok(Some(task))
    }

    /// Unconditional status write; callers enforce transition legality.
    pub async fn update_status(&self, id: i64, status: TaskStatus) -> RecoveryResult<()> {
        sqlx::query("UPDATE tasks SET status = $2 WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Put a terminal task back in the ready set. `run_at` is left alone; the
    /// system never moves it backward.
    pub async fn reset_to_pending(&self, id: i64) -> RecoveryResult<()> {
        self.update_status(id, TaskStatus::Pending).await
    }

    /// Unscoped fetch; worker-admin endpoints operate on arbitrary tasks.
    pub async fn get(&self, id: i64) -> RecoveryResult<Option<Task>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1");
        Ok(sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn get_owned(&self, id: i64, merchant_id: &str) -> RecoveryResult<Option<Task>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1 AND merchant_id = $2");
        Ok(sqlx::query_as(&sql)
            .bind(id)
            .bind(merchant_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn list_for_merchant(
        &self,
        merchant_id: &str,
        status: Option<TaskStatus>,
        limit: i64,
    ) -> RecoveryResult<Vec<Task>> {
        let tasks = match status {
            Some(status) => {
                let sql = format!(
                    "SELECT {TASK_COLUMNS} FROM tasks \
                     WHERE merchant_id = $1 AND status = $2 \
                     ORDER BY created_at DESC LIMIT $3"
                );
                sqlx::query_as(&sql)
                    .bind(merchant_id)
                    .bind(status.as_str())
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let sql = format!(
                    "SELECT {TASK_COLUMNS} FROM tasks \
                     WHERE merchant_id = $1 \
                     ORDER BY created_at DESC LIMIT $2"
                );
                sqlx::query_as(&sql)
                    .bind(merchant_id)
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(tasks)
    }

    pub async fn pending_count(&self, merchant_id: &str) -> RecoveryResult<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM tasks WHERE merchant_id = $1 AND status = 'pending'",
        )
        .bind(merchant_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Count of live (pending or running) tasks of one type for a merchant;
    /// the watchdog uses this to keep self-scheduling chains alive.
    pub async fn live_count(
        &self,
        merchant_id: &str,
        task_type: TaskType,
    ) -> RecoveryResult<i64> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM tasks
            WHERE merchant_id = $1
              AND task_type = $2
              AND status IN ('pending', 'running')
            "#,
        )
        .bind(merchant_id)
        .bind(task_type.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn delete_owned(&self, id: i64, merchant_id: &str) -> RecoveryResult<bool> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = $1 AND merchant_id = $2")
            .bind(id)
            .bind(merchant_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_completed(&self, merchant_id: &str) -> RecoveryResult<u64> {
        let result =
            sqlx::query("DELETE FROM tasks WHERE merchant_id = $1 AND status = 'completed'")
                .bind(merchant_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    /// Drop unfinished work for a merchant (used on disconnect).
    pub async fn delete_live_for(&self, merchant_id: &str) -> RecoveryResult<u64> {
        let result = sqlx::query(
            "DELETE FROM tasks WHERE merchant_id = $1 AND status IN ('pending', 'running')",
        )
        .bind(merchant_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn delete_all_for(&self, merchant_id: &str) -> RecoveryResult<u64> {
        let result = sqlx::query("DELETE FROM tasks WHERE merchant_id = $1")
            .bind(merchant_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Enqueue the successor of a self-scheduling system task.
    pub async fn enqueue_system(
        &self,
        task_type: TaskType,
        run_at: OffsetDateTime,
    ) -> RecoveryResult<Task> {
        self.enqueue(SYSTEM_MERCHANT_ID, task_type, serde_json::json!({}), run_at)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_type_round_trips() {
        for t in [
            TaskType::DunningRetry,
            TaskType::NotifyActionRequired,
            TaskType::ReportUsage,
            TaskType::SendWeeklyDigest,
        ] {
            assert_eq!(TaskType::parse(t.as_str()), Some(t));
        }
        assert_eq!(TaskType::parse("compact_segments"), None);
    }

    #[test]
    fn status_round_trips() {
        for s in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Completed,
            TaskStatus::Failed,
        ] {
            assert_eq!(TaskStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(TaskStatus::parse("paused"), None);
    }

    #[test]
    fn retry_schedule_by_attempt() {
        assert_eq!(retry_delay(1), Duration::days(3));
        assert_eq!(retry_delay(2), Duration::days(5));
        assert_eq!(retry_delay(3), Duration::days(7));
        assert_eq!(retry_delay(4), Duration::days(7));
        assert_eq!(retry_delay(0), Duration::days(7));
    }

    #[test]
    fn dunning_payload_parses_camel_case() {
        let value = serde_json::json!({ "invoiceId": "in_42", "attemptCount": 2 });
        let payload: DunningRetryPayload = parse_payload("dunning_retry", &value).unwrap();
        assert_eq!(payload.invoice_id, "in_42");
        assert_eq!(payload.attempt_count, Some(2));
    }

    #[test]
    fn dunning_payload_attempt_is_optional() {
        let value = serde_json::json!({ "invoiceId": "in_42" });
        let payload: DunningRetryPayload = parse_payload("dunning_retry", &value).unwrap();
        assert_eq!(payload.attempt_count, None);
    }

    #[test]
    fn unknown_payload_fields_rejected() {
        let value = serde_json::json!({ "invoiceId": "in_42", "surprise": true });
        let result: RecoveryResult<DunningRetryPayload> = parse_payload("dunning_retry", &value);
        assert!(matches!(
            result,
            Err(RecoveryError::Payload { kind: "dunning_retry", .. })
        ));
    }

    #[test]
    fn action_required_payload_parses() {
        let value = serde_json::json!({
            "invoiceId": "in_7",
            "hostedInvoiceUrl": "https://pay.example/in_7"
        });
        let payload: ActionRequiredPayload = parse_payload("notify_action_required", &value).unwrap();
        assert_eq!(
            payload.hosted_invoice_url.as_deref(),
            Some("https://pay.example/in_7")
        );
    }
}
