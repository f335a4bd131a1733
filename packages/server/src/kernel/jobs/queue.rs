//! PostgreSQL-backed job queue.
//!
//! Enqueue validates the request, deduplicates on the tenant-scoped
//! idempotency key, and persists the job; claiming and transitions live on
//! the `Job` model.

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::Deserialize;
use sqlx::PgPool;
use tracing::debug;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use super::job::Job;
use crate::common::sql::Record;
use crate::kernel::error::OrchestratorError;

/// Enqueue requests may arrive slightly late from upstream producers; older
/// schedules than this are rejected as malformed.
const MAX_SCHEDULE_SKEW: i64 = 60;

/// Retry backoff: 1s base doubling per attempt, capped at 5 minutes.
const BACKOFF_BASE_SECS: f64 = 1.0;
const BACKOFF_CAP_SECS: f64 = 300.0;
const BACKOFF_JITTER_SHARE: f64 = 0.3;

/// Result of an enqueue that handles idempotency.
#[derive(Debug, Clone)]
pub enum EnqueueResult {
    /// A new job was created.
    Created(Uuid),
    /// The idempotency key matched an existing job.
    Duplicate(Uuid),
}

impl EnqueueResult {
    pub fn job_id(&self) -> Uuid {
        match self {
            EnqueueResult::Created(id) | EnqueueResult::Duplicate(id) => *id,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, EnqueueResult::Created(_))
    }
}

/// A validated enqueue request.
#[derive(Debug, Clone, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct NewJob {
    pub tenant_id: Uuid,
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub store_id: Option<Uuid>,
    pub job_type: String,
    #[builder(default = serde_json::json!({}))]
    #[serde(default = "empty_payload")]
    pub payload: serde_json::Value,
    #[builder(default = 5)]
    #[serde(default = "default_priority")]
    pub priority: i16,
    #[builder(default = 3)]
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i32,
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    pub idempotency_key: String,
}

fn empty_payload() -> serde_json::Value {
    serde_json::json!({})
}

fn default_priority() -> i16 {
    5
}

fn default_max_attempts() -> i32 {
    3
}

/// Seam for enqueuing deferred work. Handlers and the webhook ingestor hold
/// this instead of a concrete queue so tests can capture enqueues.
#[async_trait::async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, new_job: NewJob) -> Result<EnqueueResult, OrchestratorError>;
}

pub struct PostgresJobQueue {
    db: PgPool,
}

impl PostgresJobQueue {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait::async_trait]
impl JobQueue for PostgresJobQueue {
    async fn enqueue(&self, new_job: NewJob) -> Result<EnqueueResult, OrchestratorError> {
        validate(&new_job)?;

        let scheduled_at = new_job.scheduled_at.unwrap_or_else(Utc::now);
        let mut job = Job::builder()
            .tenant_id(new_job.tenant_id)
            .job_type(new_job.job_type.clone())
            .payload(new_job.payload)
            .priority(new_job.priority)
            .max_attempts(new_job.max_attempts)
            .scheduled_at(scheduled_at)
            .idempotency_key(new_job.idempotency_key.clone())
            .build();
        job.store_id = new_job.store_id;

        let inserted = job
            .insert(&self.db)
            .await
            .map_err(|e| OrchestratorError::Transient(e.to_string()))?;

        let result = if inserted.id == job.id {
            EnqueueResult::Created(inserted.id)
        } else {
            debug!(
                tenant_id = %new_job.tenant_id,
                idempotency_key = %new_job.idempotency_key,
                existing_job = %inserted.id,
                "duplicate enqueue deduplicated"
            );
            EnqueueResult::Duplicate(inserted.id)
        };

        Ok(result)
    }
}

fn validate(new_job: &NewJob) -> Result<(), OrchestratorError> {
    if new_job.max_attempts < 1 {
        return Err(OrchestratorError::Invalid(
            "max_attempts must be at least 1".to_string(),
        ));
    }
    if !(0..=100).contains(&new_job.priority) {
        return Err(OrchestratorError::Invalid(format!(
            "priority {} outside 0..=100",
            new_job.priority
        )));
    }
    if new_job.job_type.is_empty() {
        return Err(OrchestratorError::Invalid("job_type is required".to_string()));
    }
    if new_job.idempotency_key.is_empty() {
        return Err(OrchestratorError::Invalid(
            "idempotency_key is required".to_string(),
        ));
    }
    if let Some(at) = new_job.scheduled_at {
        if at < Utc::now() - Duration::seconds(MAX_SCHEDULE_SKEW) {
            return Err(OrchestratorError::Invalid(
                "scheduled_at is more than 60s in the past".to_string(),
            ));
        }
    }
    Ok(())
}

/// Backoff for the given attempt number (1-based):
/// `min(base * 2^(attempts - 1), cap) + jitter`, jitter uniform in
/// `[0, 0.3 * delay)`.
pub fn retry_backoff(attempts: i32) -> Duration {
    let exponent = attempts.saturating_sub(1).min(16) as u32;
    let delay = (BACKOFF_BASE_SECS * f64::from(2u32.pow(exponent))).min(BACKOFF_CAP_SECS);
    let jitter = rand::thread_rng().gen_range(0.0..BACKOFF_JITTER_SHARE) * delay;
    Duration::milliseconds(((delay + jitter) * 1000.0) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_job() -> NewJob {
        NewJob::builder()
            .tenant_id(Uuid::new_v4())
            .job_type("listing_publish")
            .idempotency_key("L1")
            .build()
    }

    #[test]
    fn enqueue_result_helpers() {
        let id = Uuid::new_v4();
        assert!(EnqueueResult::Created(id).is_created());
        assert!(!EnqueueResult::Duplicate(id).is_created());
        assert_eq!(EnqueueResult::Duplicate(id).job_id(), id);
    }

    #[test]
    fn validation_accepts_defaults() {
        assert!(validate(&valid_job()).is_ok());
    }

    #[test]
    fn validation_rejects_zero_max_attempts() {
        let mut job = valid_job();
        job.max_attempts = 0;
        assert!(matches!(
            validate(&job),
            Err(OrchestratorError::Invalid(_))
        ));
    }

    #[test]
    fn validation_rejects_out_of_range_priority() {
        let mut job = valid_job();
        job.priority = 101;
        assert!(validate(&job).is_err());

        job.priority = -1;
        assert!(validate(&job).is_err());
    }

    #[test]
    fn validation_rejects_stale_schedules_but_allows_slight_skew() {
        let mut job = valid_job();
        job.scheduled_at = Some(Utc::now() - Duration::seconds(30));
        assert!(validate(&job).is_ok());

        job.scheduled_at = Some(Utc::now() - Duration::seconds(120));
        assert!(validate(&job).is_err());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        for _ in 0..20 {
            let first = retry_backoff(1).num_milliseconds();
            assert!((1000..1300).contains(&first), "attempt 1: {first}ms");

            let second = retry_backoff(2).num_milliseconds();
            assert!((2000..2600).contains(&second), "attempt 2: {second}ms");

            let capped = retry_backoff(30).num_milliseconds();
            assert!((300_000..390_000).contains(&capped), "capped: {capped}ms");
        }
    }
}
