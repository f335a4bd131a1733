//! Job model: one unit of deferred work, tenant-scoped.
//!
//! The engine owns every status transition. Claims go through
//! `FOR UPDATE SKIP LOCKED`; everything after a claim is a check-and-set on
//! `(status, claimed_by)`, so a worker that lost its lease writes nothing.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::common::sql::Record;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Claimed,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Terminal states are final except via operator retry.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

#[derive(FromRow, Debug, Clone, Serialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Job {
    #[builder(default = Uuid::now_v7())]
    pub id: Uuid,
    pub tenant_id: Uuid,
    #[builder(default, setter(strip_option))]
    pub store_id: Option<Uuid>,
    pub job_type: String,
    #[builder(default = serde_json::json!({}))]
    pub payload: serde_json::Value,
    #[builder(default)]
    pub status: JobStatus,
    /// Smaller is more urgent. Valid range 0..=100.
    #[builder(default = 5)]
    pub priority: i16,
    #[builder(default = 0)]
    pub attempts: i32,
    #[builder(default = 3)]
    pub max_attempts: i32,
    #[builder(default = Utc::now())]
    pub scheduled_at: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    pub claimed_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub claimed_by: Option<String>,
    #[builder(default, setter(strip_option))]
    pub started_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub completed_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub last_error: Option<String>,
    #[builder(default, setter(strip_option))]
    pub result: Option<serde_json::Value>,
    /// Unique per tenant; duplicate enqueues return the existing job.
    pub idempotency_key: String,
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

const JOB_COLUMNS: &str = "id, tenant_id, store_id, job_type, payload, status, priority, \
                           attempts, max_attempts, scheduled_at, claimed_at, claimed_by, \
                           started_at, completed_at, last_error, result, idempotency_key, \
                           created_at, updated_at";

/// One cross-tenant snapshot of queue pressure, for the health surface.
///
/// `stale_leases` counts claims whose worker has gone quiet past the lease;
/// a non-zero count with a growing `due_pending` means workers are down or
/// starved even when the database itself is fine.
#[derive(FromRow, Debug, Clone, Serialize)]
pub struct QueueDepth {
    pub due_pending: i64,
    pub running: i64,
    pub stale_leases: i64,
    pub oldest_due_seconds: Option<i64>,
}

impl Job {
    pub async fn find_by_idempotency_key(
        tenant_id: Uuid,
        key: &str,
        db: &PgPool,
    ) -> Result<Option<Self>> {
        let job = sqlx::query_as::<_, Self>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE tenant_id = $1 AND idempotency_key = $2",
        ))
        .bind(tenant_id)
        .bind(key)
        .fetch_optional(db)
        .await?;

        Ok(job)
    }

    /// Measure queue pressure across all tenants: due backlog, in-flight
    /// work, stale leases, and the age of the oldest runnable job.
    pub async fn queue_depth(lease: Duration, db: &PgPool) -> Result<QueueDepth> {
        let depth = sqlx::query_as::<_, QueueDepth>(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending' AND scheduled_at <= NOW()) AS due_pending,
                COUNT(*) FILTER (WHERE status = 'running') AS running,
                COUNT(*) FILTER (WHERE status IN ('claimed', 'running')
                                 AND claimed_at < NOW() - ($1 || ' milliseconds')::INTERVAL) AS stale_leases,
                EXTRACT(EPOCH FROM (
                    NOW() - MIN(scheduled_at) FILTER (WHERE status = 'pending' AND scheduled_at <= NOW())
                ))::BIGINT AS oldest_due_seconds
            FROM jobs
            "#,
        )
        .bind(lease.num_milliseconds().to_string())
        .fetch_one(db)
        .await?;

        Ok(depth)
    }

    /// Atomically claim up to `limit` due jobs for one tenant.
    ///
    /// Eligible rows are pending-and-due, plus claimed/running rows whose
    /// lease (`claimed_at`) is older than `lease`; those are stale workers'
    /// jobs being reclaimed. `FOR UPDATE SKIP LOCKED` keeps concurrent
    /// claimers from blocking or double-claiming.
    pub async fn claim_due(
        tenant_id: Uuid,
        worker_id: &str,
        limit: i64,
        lease: Duration,
        db: &PgPool,
    ) -> Result<Vec<Self>> {
        let jobs = sqlx::query_as::<_, Self>(&format!(
            r#"
            WITH due AS (
                SELECT id
                FROM jobs
                WHERE tenant_id = $1
                  AND (
                    (status = 'pending' AND scheduled_at <= NOW())
                    OR (status IN ('claimed', 'running')
                        AND claimed_at < NOW() - ($4 || ' milliseconds')::INTERVAL)
                  )
                ORDER BY priority ASC, scheduled_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET status = 'claimed',
                claimed_by = $3,
                claimed_at = NOW(),
                started_at = NULL,
                updated_at = NOW()
            WHERE id IN (SELECT id FROM due)
            RETURNING {JOB_COLUMNS}
            "#,
        ))
        .bind(tenant_id)
        .bind(limit)
        .bind(worker_id)
        .bind(lease.num_milliseconds().to_string())
        .fetch_all(db)
        .await?;

        Ok(jobs)
    }

    /// claimed -> running. Consumes an attempt. Returns false when another
    /// worker superseded this claim.
    pub async fn start(id: Uuid, worker_id: &str, db: &PgPool) -> Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'running', started_at = NOW(), attempts = attempts + 1,
                updated_at = NOW()
            WHERE id = $1 AND status = 'claimed' AND claimed_by = $2
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .execute(db)
        .await?
        .rows_affected();

        Ok(updated == 1)
    }

    /// running -> completed.
    pub async fn complete(
        id: Uuid,
        worker_id: &str,
        result: Option<&serde_json::Value>,
        db: &PgPool,
    ) -> Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed', result = $3, completed_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status = 'running' AND claimed_by = $2
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .bind(result)
        .execute(db)
        .await?
        .rows_affected();

        Ok(updated == 1)
    }

    /// running -> pending with a backoff delay. Clears the lease columns.
    pub async fn retry_after(
        id: Uuid,
        worker_id: &str,
        error: &str,
        delay: Duration,
        db: &PgPool,
    ) -> Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending',
                scheduled_at = NOW() + ($3 || ' milliseconds')::INTERVAL,
                last_error = $4,
                claimed_by = NULL, claimed_at = NULL, started_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'running' AND claimed_by = $2
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .bind(delay.num_milliseconds().to_string())
        .bind(error)
        .execute(db)
        .await?
        .rows_affected();

        Ok(updated == 1)
    }

    /// running -> pending after a rate limit. The consumed attempt is
    /// refunded: waiting out a bucket is not a failure.
    pub async fn reschedule_rate_limited(
        id: Uuid,
        worker_id: &str,
        retry_after_seconds: u64,
        db: &PgPool,
    ) -> Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending',
                scheduled_at = NOW() + ($3 || ' seconds')::INTERVAL,
                attempts = GREATEST(attempts - 1, 0),
                claimed_by = NULL, claimed_at = NULL, started_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'running' AND claimed_by = $2
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .bind((retry_after_seconds as i64).to_string())
        .execute(db)
        .await?
        .rows_affected();

        Ok(updated == 1)
    }

    /// running -> failed (terminal).
    pub async fn fail(id: Uuid, worker_id: &str, error: &str, db: &PgPool) -> Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed', last_error = $3, completed_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status = 'running' AND claimed_by = $2
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .bind(error)
        .execute(db)
        .await?
        .rows_affected();

        Ok(updated == 1)
    }

    /// A claimed job whose attempts were already exhausted when it came back
    /// (its last worker died mid-final-attempt). Terminal without a run.
    pub async fn fail_exhausted(
        id: Uuid,
        worker_id: &str,
        error: &str,
        db: &PgPool,
    ) -> Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed', last_error = $3, completed_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status = 'claimed' AND claimed_by = $2
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .bind(error)
        .execute(db)
        .await?
        .rows_affected();

        Ok(updated == 1)
    }

    /// pending|claimed -> cancelled. Running jobs cancel cooperatively via
    /// their token, not here.
    pub async fn cancel(id: Uuid, db: &PgPool) -> Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'cancelled', completed_at = NOW(),
                claimed_by = NULL, claimed_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status IN ('pending', 'claimed')
            "#,
        )
        .bind(id)
        .execute(db)
        .await?
        .rows_affected();

        Ok(updated == 1)
    }

    /// Operator retry of a failed (or cancelled) job: full reset. Completed
    /// jobs are not retryable; `None` tells the caller to reject.
    pub async fn operator_retry(id: Uuid, db: &PgPool) -> Result<Option<Self>> {
        let job = sqlx::query_as::<_, Self>(&format!(
            r#"
            UPDATE jobs
            SET status = 'pending', attempts = 0, last_error = NULL,
                scheduled_at = NOW(), completed_at = NULL,
                claimed_by = NULL, claimed_at = NULL, started_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status IN ('failed', 'cancelled')
            RETURNING {JOB_COLUMNS}
            "#,
        ))
        .bind(id)
        .fetch_optional(db)
        .await?;

        Ok(job)
    }
}

#[async_trait::async_trait]
impl Record for Job {
    const TABLE: &'static str = "jobs";
    type Id = Uuid;

    async fn find_by_id(id: Uuid, db: &PgPool) -> Result<Self> {
        let job = sqlx::query_as::<_, Self>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1",
        ))
        .bind(id)
        .fetch_one(db)
        .await?;

        Ok(job)
    }

    /// Insert, deduplicating on the tenant-scoped idempotency key. Returns
    /// the existing row on conflict, so a duplicate enqueue is a no-op that
    /// hands back the prior job.
    async fn insert(&self, db: &PgPool) -> Result<Self> {
        let inserted = sqlx::query_as::<_, Self>(&format!(
            r#"
            INSERT INTO jobs (
                id, tenant_id, store_id, job_type, payload, status, priority,
                attempts, max_attempts, scheduled_at, claimed_at, claimed_by,
                started_at, completed_at, last_error, result, idempotency_key,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                    $15, $16, $17, $18, $19)
            ON CONFLICT (tenant_id, idempotency_key) DO NOTHING
            RETURNING {JOB_COLUMNS}
            "#,
        ))
        .bind(self.id)
        .bind(self.tenant_id)
        .bind(self.store_id)
        .bind(&self.job_type)
        .bind(&self.payload)
        .bind(self.status)
        .bind(self.priority)
        .bind(self.attempts)
        .bind(self.max_attempts)
        .bind(self.scheduled_at)
        .bind(self.claimed_at)
        .bind(&self.claimed_by)
        .bind(self.started_at)
        .bind(self.completed_at)
        .bind(&self.last_error)
        .bind(&self.result)
        .bind(&self.idempotency_key)
        .bind(self.created_at)
        .bind(self.updated_at)
        .fetch_optional(db)
        .await?;

        match inserted {
            Some(job) => Ok(job),
            None => {
                let existing =
                    Self::find_by_idempotency_key(self.tenant_id, &self.idempotency_key, db)
                        .await?;
                existing.ok_or_else(|| {
                    anyhow::anyhow!("idempotency conflict with no existing row")
                })
            }
        }
    }

    // General updates are reserved for the transition methods above; this
    // only refreshes mutable metadata.
    async fn update(&self, db: &PgPool) -> Result<Self> {
        let job = sqlx::query_as::<_, Self>(&format!(
            r#"
            UPDATE jobs
            SET priority = $1, max_attempts = $2, scheduled_at = $3, updated_at = NOW()
            WHERE id = $4
            RETURNING {JOB_COLUMNS}
            "#,
        ))
        .bind(self.priority)
        .bind(self.max_attempts)
        .bind(self.scheduled_at)
        .bind(self.id)
        .fetch_one(db)
        .await?;

        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job() -> Job {
        Job::builder()
            .tenant_id(Uuid::new_v4())
            .job_type("product_sync")
            .idempotency_key("product_sync_x")
            .build()
    }

    #[test]
    fn new_job_defaults() {
        let job = sample_job();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.priority, 5);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.max_attempts, 3);
        assert!(job.claimed_by.is_none());
    }

    #[test]
    fn terminal_states() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Claimed.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }
}
