//! Job runner: claims and executes due jobs across tenants.
//!
//! # Architecture
//!
//! ```text
//! JobRunner (one per process; any number of processes)
//!     │
//!     ├─► For each active tenant: claim batch (SKIP LOCKED, lease)
//!     ├─► claimed → running (CAS; consumes an attempt)
//!     ├─► Execute via JobRegistry under timeout + cancellation token
//!     └─► Terminal transition (CAS on claimed_by) + audit + stream event
//! ```
//!
//! A worker that loses its lease simply loses every subsequent CAS; the
//! reclaiming worker owns the row from then on.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Result;
use chrono::{Duration, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::job::Job;
use super::queue::{retry_backoff, JobQueue, NewJob};
use super::registry::{JobContext, JobOutcome, SharedJobRegistry};
use crate::common::sql::Record;
use crate::domains::stores::Store;
use crate::domains::tenants::Tenant;
use crate::kernel::approvals::Approval;
use crate::kernel::audit::{self, AuditEntry, AuditTag};
use crate::kernel::error::OrchestratorError;
use crate::kernel::stream_hub::ChangeEvent;
use crate::kernel::ServerDeps;

/// Configuration for the job runner.
#[derive(Debug, Clone)]
pub struct JobRunnerConfig {
    /// Jobs claimed per tenant per tick.
    pub batch_size: i64,
    /// Sleep when no jobs were claimed anywhere.
    pub poll_interval: StdDuration,
    /// Visibility timeout; stale claims older than this are reclaimed.
    pub lease: StdDuration,
    /// Hard ceiling on one handler invocation.
    pub job_timeout: StdDuration,
    /// Worker ID for this instance.
    pub worker_id: String,
}

impl Default for JobRunnerConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            poll_interval: StdDuration::from_secs(5),
            lease: StdDuration::from_secs(300),
            job_timeout: StdDuration::from_secs(270),
            worker_id: format!("worker-{}", Uuid::new_v4()),
        }
    }
}

impl JobRunnerConfig {
    pub fn with_worker_id(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }
}

/// Background service that processes jobs from the queue.
pub struct JobRunner {
    deps: Arc<ServerDeps>,
    registry: SharedJobRegistry,
    config: JobRunnerConfig,
    shutdown: CancellationToken,
}

impl JobRunner {
    pub fn new(deps: Arc<ServerDeps>, registry: SharedJobRegistry) -> Self {
        Self {
            deps,
            registry,
            config: JobRunnerConfig::default(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_config(
        deps: Arc<ServerDeps>,
        registry: SharedJobRegistry,
        config: JobRunnerConfig,
    ) -> Self {
        Self {
            deps,
            registry,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops the runner and cancels in-flight handlers.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run until the shutdown token fires. In-flight jobs finish (or hit
    /// their timeout) before the loop exits.
    pub async fn run(self) -> Result<()> {
        info!(
            worker_id = %self.config.worker_id,
            batch_size = self.config.batch_size,
            lease_secs = self.config.lease.as_secs(),
            "job runner starting"
        );

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let tenants = match Tenant::find_active(&self.deps.db_pool).await {
                Ok(tenants) => tenants,
                Err(e) => {
                    error!(error = %e, "failed to list tenants");
                    tokio::time::sleep(StdDuration::from_secs(1)).await;
                    continue;
                }
            };

            let mut claimed_total = 0usize;
            for tenant in &tenants {
                if self.shutdown.is_cancelled() {
                    break;
                }

                let jobs = match self.claim_with_retry(tenant.id).await {
                    Ok(jobs) => jobs,
                    Err(e) => {
                        error!(tenant_id = %tenant.id, error = %e, "failed to claim jobs");
                        continue;
                    }
                };

                if jobs.is_empty() {
                    continue;
                }

                claimed_total += jobs.len();
                debug!(tenant_id = %tenant.id, count = jobs.len(), "claimed jobs");

                // Execution is concurrent within the batch; ordering was
                // decided at claim time.
                let work = jobs.into_iter().map(|job| self.process_job(job));
                futures::future::join_all(work).await;
            }

            if claimed_total == 0 {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }

        info!(worker_id = %self.config.worker_id, "job runner stopped");
        Ok(())
    }

    /// Run until a Ctrl+C signal is received.
    pub async fn run_until_shutdown(self) -> Result<()> {
        let shutdown = self.shutdown_token();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("received shutdown signal");
            shutdown.cancel();
        });

        self.run().await
    }

    /// Claim transactions can hit retryable conflicts; try twice before
    /// surfacing.
    async fn claim_with_retry(&self, tenant_id: Uuid) -> Result<Vec<Job>> {
        let lease = Duration::milliseconds(self.config.lease.as_millis() as i64);
        match Job::claim_due(
            tenant_id,
            &self.config.worker_id,
            self.config.batch_size,
            lease,
            &self.deps.db_pool,
        )
        .await
        {
            Ok(jobs) => Ok(jobs),
            Err(first) => {
                warn!(tenant_id = %tenant_id, error = %first, "claim conflicted, retrying");
                Job::claim_due(
                    tenant_id,
                    &self.config.worker_id,
                    self.config.batch_size,
                    lease,
                    &self.deps.db_pool,
                )
                .await
            }
        }
    }

    async fn process_job(&self, job: Job) {
        let db = &self.deps.db_pool;
        let worker_id = &self.config.worker_id;

        // A reclaimed job whose previous worker died on the final attempt
        // has nothing left to run.
        if job.attempts >= job.max_attempts {
            let message = "lease expired after final attempt";
            match Job::fail_exhausted(job.id, worker_id, message, db).await {
                Ok(true) => self.on_failed(&job, job.attempts, message).await,
                Ok(false) => {}
                Err(e) => error!(job_id = %job.id, error = %e, "failed to fail exhausted job"),
            }
            return;
        }

        match Job::start(job.id, worker_id, db).await {
            Ok(true) => {}
            // Superseded between claim and start; another worker owns it.
            Ok(false) => return,
            Err(e) => {
                error!(job_id = %job.id, error = %e, "failed to start job");
                return;
            }
        }
        let attempts = job.attempts + 1;

        debug!(job_id = %job.id, job_type = %job.job_type, attempts, "executing job");

        let cancel = self.shutdown.child_token();
        let ctx = JobContext {
            deps: self.deps.clone(),
            cancel: cancel.clone(),
            job_id: job.id,
            tenant_id: job.tenant_id,
            store_id: job.store_id,
        };

        // Handlers run in their own task: a panic surfaces as a JoinError
        // and becomes a Transient failure instead of taking the worker down.
        let registry = self.registry.clone();
        let handler_job = job.clone();
        let handler = tokio::spawn(async move { registry.execute(&handler_job, ctx).await });

        let outcome = tokio::select! {
            joined = handler => match joined {
                Ok(outcome) => outcome,
                Err(e) => Err(OrchestratorError::Transient(format!("handler panicked: {e}"))),
            },
            _ = tokio::time::sleep(self.config.job_timeout) => {
                cancel.cancel();
                Err(OrchestratorError::Transient(format!(
                    "handler exceeded {}s timeout",
                    self.config.job_timeout.as_secs()
                )))
            }
        };

        match outcome {
            Ok(JobOutcome::Success {
                result,
                reconciliation_needed,
            }) => {
                self.on_success(&job, result, reconciliation_needed).await;
            }
            Ok(JobOutcome::Retry { error, reason }) => {
                let reason = reason.unwrap_or_else(|| "handler requested retry".to_string());
                self.on_retryable(&job, attempts, &error, &reason).await;
            }
            Ok(JobOutcome::Permanent { error }) => {
                self.fail_permanently(&job, attempts, &error).await;
            }
            Err(OrchestratorError::Transient(message)) => {
                self.on_retryable(&job, attempts, &message, "transient failure")
                    .await;
            }
            Err(OrchestratorError::RateLimited {
                retry_after_seconds,
            }) => {
                self.on_rate_limited(&job, retry_after_seconds).await;
            }
            Err(OrchestratorError::Conflict) => {
                // Another worker already did the transition.
            }
            Err(permanent) => {
                self.apply_error_side_effects(&job, &permanent).await;
                self.fail_permanently(&job, attempts, &permanent.to_string())
                    .await;
            }
        }
    }

    async fn on_success(
        &self,
        job: &Job,
        result: Option<serde_json::Value>,
        reconciliation_needed: bool,
    ) {
        let db = &self.deps.db_pool;
        match Job::complete(job.id, &self.config.worker_id, result.as_ref(), db).await {
            Ok(true) => {}
            Ok(false) => return, // lease lost; the reclaiming worker reports
            Err(e) => {
                error!(job_id = %job.id, error = %e, "failed to mark job completed");
                return;
            }
        }

        info!(job_id = %job.id, job_type = %job.job_type, "job completed");

        audit::record(
            db,
            AuditEntry::builder()
                .tenant_id(job.tenant_id)
                .action("job_completed")
                .resource_type("job")
                .resource_id(job.id.to_string())
                .metadata(serde_json::json!({ "job_type": job.job_type }))
                .tags(vec![AuditTag::Automation.as_str().to_string()])
                .build(),
        )
        .await;

        self.deps
            .stream_hub
            .publish(job.tenant_id, ChangeEvent::new("job_completed", "job", job.id))
            .await;

        if reconciliation_needed {
            if let Some(store_id) = job.store_id {
                self.enqueue_reconciliation(job.tenant_id, store_id).await;
            }
        }
    }

    /// Schedule a reconciliation pass for the store, 60s out, priority 5.
    /// The minute-bucketed idempotency key coalesces bursts of requests.
    async fn enqueue_reconciliation(&self, tenant_id: Uuid, store_id: Uuid) {
        let scheduled_at = Utc::now() + Duration::seconds(60);
        let new_job = NewJob::builder()
            .tenant_id(tenant_id)
            .store_id(store_id)
            .job_type("reconciliation")
            .payload(serde_json::json!({ "store_id": store_id }))
            .priority(5i16)
            .scheduled_at(scheduled_at)
            .idempotency_key(format!(
                "reconciliation_{}_{}",
                store_id,
                scheduled_at.timestamp() / 60
            ))
            .build();

        if let Err(e) = self.deps.job_queue.enqueue(new_job).await {
            error!(store_id = %store_id, error = %e, "failed to enqueue reconciliation");
        }
    }

    async fn on_retryable(&self, job: &Job, attempts: i32, error: &str, reason: &str) {
        if attempts >= job.max_attempts {
            self.fail_permanently(
                job,
                attempts,
                &format!("retry attempts exhausted: {error}"),
            )
            .await;
            return;
        }

        let delay = retry_backoff(attempts);
        let db = &self.deps.db_pool;
        match Job::retry_after(job.id, &self.config.worker_id, error, delay, db).await {
            Ok(true) => {
                warn!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    attempts,
                    delay_ms = delay.num_milliseconds(),
                    reason,
                    "job scheduled for retry"
                );
            }
            Ok(false) => {}
            Err(e) => error!(job_id = %job.id, error = %e, "failed to schedule retry"),
        }
    }

    async fn on_rate_limited(&self, job: &Job, retry_after_seconds: u64) {
        let db = &self.deps.db_pool;
        match Job::reschedule_rate_limited(
            job.id,
            &self.config.worker_id,
            retry_after_seconds,
            db,
        )
        .await
        {
            Ok(true) => {
                warn!(
                    job_id = %job.id,
                    retry_after_seconds,
                    "job rescheduled after rate limit"
                );
                audit::record(
                    db,
                    AuditEntry::builder()
                        .tenant_id(job.tenant_id)
                        .action("job_rate_limited")
                        .resource_type("job")
                        .resource_id(job.id.to_string())
                        .metadata(serde_json::json!({
                            "job_type": job.job_type,
                            "retry_after_seconds": retry_after_seconds,
                        }))
                        .tags(vec![AuditTag::RateLimiting.as_str().to_string()])
                        .build(),
                )
                .await;
            }
            Ok(false) => {}
            Err(e) => error!(job_id = %job.id, error = %e, "failed to reschedule job"),
        }
    }

    async fn fail_permanently(&self, job: &Job, attempts: i32, error: &str) {
        let db = &self.deps.db_pool;
        match Job::fail(job.id, &self.config.worker_id, error, db).await {
            Ok(true) => self.on_failed(job, attempts, error).await,
            Ok(false) => {}
            Err(e) => error!(job_id = %job.id, error = %e, "failed to mark job failed"),
        }
    }

    /// Audit, notify, and escalate a terminal failure.
    async fn on_failed(&self, job: &Job, attempts: i32, error: &str) {
        let db = &self.deps.db_pool;

        warn!(job_id = %job.id, job_type = %job.job_type, error, "job failed");

        audit::record(
            db,
            AuditEntry::builder()
                .tenant_id(job.tenant_id)
                .action("job_failed")
                .resource_type("job")
                .resource_id(job.id.to_string())
                .metadata(serde_json::json!({
                    "job_type": job.job_type,
                    "attempts": attempts,
                    "error": error,
                }))
                .tags(vec![AuditTag::Automation.as_str().to_string()])
                .build(),
        )
        .await;

        self.deps
            .stream_hub
            .publish(job.tenant_id, ChangeEvent::new("job_failed", "job", job.id))
            .await;

        // Exhausted jobs get an operator gate instead of silent dropping.
        if attempts >= job.max_attempts {
            let approval = Approval::job_retry(job.tenant_id, job.id, error);
            if let Err(e) = approval.insert(db).await {
                error!(job_id = %job.id, error = %e, "failed to create retry approval");
            } else {
                self.deps
                    .stream_hub
                    .publish(
                        job.tenant_id,
                        ChangeEvent::new("approval_requested", "approval", approval.id),
                    )
                    .await;
            }
        }
    }

    /// Extra consequences some failures carry beyond the job transition.
    async fn apply_error_side_effects(&self, job: &Job, error: &OrchestratorError) {
        let db = &self.deps.db_pool;
        match error {
            OrchestratorError::Unauthorized {
                credential_related: true,
                reason,
            } => {
                let Some(store_id) = job.store_id else { return };
                if let Err(e) = Store::deactivate(store_id, db).await {
                    error!(store_id = %store_id, error = %e, "failed to deactivate store");
                    return;
                }
                warn!(store_id = %store_id, "store deactivated after credential rejection");

                audit::record(
                    db,
                    AuditEntry::builder()
                        .tenant_id(job.tenant_id)
                        .action("store_deactivated")
                        .resource_type("store")
                        .resource_id(store_id.to_string())
                        .metadata(serde_json::json!({ "reason": reason }))
                        .tags(vec![
                            AuditTag::Security.as_str().to_string(),
                            AuditTag::Authentication.as_str().to_string(),
                        ])
                        .build(),
                )
                .await;

                let approval = Approval::new(
                    job.tenant_id,
                    "store",
                    &store_id.to_string(),
                    "reconnect_store",
                    serde_json::json!({ "reason": reason }),
                    "system",
                    Duration::days(7),
                );
                if let Err(e) = approval.insert(db).await {
                    error!(store_id = %store_id, error = %e, "failed to create reconnect approval");
                }
            }
            OrchestratorError::BudgetFrozen {
                budget_id,
                budget_type,
            } => {
                let approval = Approval::budget_override(
                    job.tenant_id,
                    *budget_id,
                    serde_json::json!({
                        "budget_type": budget_type,
                        "blocked_job_id": job.id,
                    }),
                );
                if let Err(e) = approval.insert(db).await {
                    error!(budget_id = %budget_id, error = %e, "failed to create budget approval");
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_match_lease_and_timeout_contract() {
        let config = JobRunnerConfig::default();
        assert_eq!(config.batch_size, 5);
        assert_eq!(config.lease.as_secs(), 300);
        // Handler timeout is lease minus the 30s completion margin.
        assert_eq!(config.job_timeout.as_secs(), 270);
        assert!(config.worker_id.starts_with("worker-"));
    }

    #[test]
    fn config_with_worker_id() {
        let config = JobRunnerConfig::with_worker_id("worker-7");
        assert_eq!(config.worker_id, "worker-7");
    }
}
