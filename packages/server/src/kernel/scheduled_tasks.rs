//! Scheduled background tasks using tokio-cron-scheduler.
//!
//! This module provides the periodic work the plane depends on:
//! - Reconciliation scheduling per active store
//! - Approval expiry sweep
//! - Budget checks and period resets
//! - Audit retention pruning
//!
//! # Architecture
//!
//! Scheduled tasks enqueue jobs or run bounded sweeps; heavy work always
//! goes through the job engine so it inherits leasing, retry, and audit.
//!
//! ```text
//! Scheduler (every 15 min)
//!     │
//!     └─► For each active store → enqueue reconciliation job
//!             └─► JobRunner → reconcile::run_store
//! ```

use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, Utc};
use tokio_cron_scheduler::{Job, JobScheduler};

use crate::domains::stores::Store;
use crate::domains::tenants::Tenant;
use crate::kernel::approvals::Approval;
use crate::kernel::audit::{self, AuditEntry, AuditTag};
use crate::kernel::budgets::Budget;
use crate::kernel::jobs::NewJob;
use crate::kernel::stream_hub::ChangeEvent;
use crate::kernel::ServerDeps;

/// Start all scheduled tasks
pub async fn start_scheduler(deps: Arc<ServerDeps>) -> Result<JobScheduler> {
    let scheduler = JobScheduler::new().await?;

    // Reconciliation scheduling - every 15 minutes
    let reconcile_deps = deps.clone();
    let reconcile_job = Job::new_async("0 */15 * * * *", move |_uuid, _lock| {
        let deps = reconcile_deps.clone();
        Box::pin(async move {
            if let Err(e) = schedule_due_reconciliations(&deps).await {
                tracing::error!("Reconciliation scheduling task failed: {}", e);
            }
        })
    })?;
    scheduler.add(reconcile_job).await?;

    // Approval expiry sweep - every minute
    let sweep_deps = deps.clone();
    let sweep_job = Job::new_async("0 * * * * *", move |_uuid, _lock| {
        let deps = sweep_deps.clone();
        Box::pin(async move {
            if let Err(e) = sweep_expired_approvals(&deps).await {
                tracing::error!("Approval sweep task failed: {}", e);
            }
        })
    })?;
    scheduler.add(sweep_job).await?;

    // Budget checks and period resets - every 5 minutes
    let budget_deps = deps.clone();
    let budget_job = Job::new_async("0 */5 * * * *", move |_uuid, _lock| {
        let deps = budget_deps.clone();
        Box::pin(async move {
            if let Err(e) = run_budget_tick(&deps).await {
                tracing::error!("Budget tick failed: {}", e);
            }
        })
    })?;
    scheduler.add(budget_job).await?;

    // Audit retention pruning - daily at 03:10
    let prune_deps = deps.clone();
    let prune_job = Job::new_async("0 10 3 * * *", move |_uuid, _lock| {
        let deps = prune_deps.clone();
        Box::pin(async move {
            if let Err(e) = prune_audit_entries(&deps).await {
                tracing::error!("Audit retention pruning failed: {}", e);
            }
        })
    })?;
    scheduler.add(prune_job).await?;

    scheduler.start().await?;

    tracing::info!(
        "Scheduled tasks started (reconciliation every 15m, approval sweep every 1m, budgets every 5m, audit pruning daily)"
    );
    Ok(scheduler)
}

/// Enqueue a reconciliation job for every active store. The quarter-hour
/// idempotency bucket makes the task safe to run from multiple processes.
async fn schedule_due_reconciliations(deps: &Arc<ServerDeps>) -> Result<()> {
    let tenants = Tenant::find_active(&deps.db_pool).await?;
    let bucket = Utc::now().timestamp() / 900;

    let mut scheduled = 0usize;
    for tenant in tenants {
        let stores = Store::find_active(tenant.id, &deps.db_pool).await?;
        for store in stores {
            let new_job = NewJob::builder()
                .tenant_id(tenant.id)
                .store_id(store.id)
                .job_type("reconciliation")
                .payload(serde_json::json!({ "store_id": store.id }))
                .priority(5i16)
                .idempotency_key(format!("reconciliation_{}_{bucket}", store.id))
                .build();

            match deps.job_queue.enqueue(new_job).await {
                Ok(result) if result.is_created() => scheduled += 1,
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(store_id = %store.id, error = %e, "failed to schedule reconciliation");
                }
            }
        }
    }

    if scheduled > 0 {
        tracing::info!(scheduled, "queued periodic reconciliation jobs");
    }
    Ok(())
}

/// Expire overdue approvals and record each expiry.
async fn sweep_expired_approvals(deps: &Arc<ServerDeps>) -> Result<()> {
    let expired = Approval::sweep_expired(&deps.db_pool).await?;
    if expired.is_empty() {
        return Ok(());
    }

    tracing::info!(count = expired.len(), "expired overdue approvals");

    for approval in expired {
        audit::record(
            &deps.db_pool,
            AuditEntry::builder()
                .tenant_id(approval.tenant_id)
                .action("approval_expired")
                .resource_type("approval")
                .resource_id(approval.id.to_string())
                .metadata(serde_json::json!({ "action": approval.action }))
                .tags(vec![AuditTag::AccessControl.as_str().to_string()])
                .build(),
        )
        .await;

        deps.stream_hub
            .publish(
                approval.tenant_id,
                ChangeEvent::new("approval_expired", "approval", approval.id),
            )
            .await;
    }

    Ok(())
}

/// Reset budgets whose period ended, then enqueue a budget check per tenant.
async fn run_budget_tick(deps: &Arc<ServerDeps>) -> Result<()> {
    let reset = Budget::reset_due(&deps.db_pool).await?;
    if reset > 0 {
        tracing::info!(reset, "reset budgets at period boundary");
    }

    let tenants = Tenant::find_active(&deps.db_pool).await?;
    let bucket = Utc::now().timestamp() / 300;
    for tenant in tenants {
        let new_job = NewJob::builder()
            .tenant_id(tenant.id)
            .job_type("budget_check")
            .payload(serde_json::json!({}))
            .priority(5i16)
            .idempotency_key(format!("budget_check_{}_{bucket}", tenant.id))
            .build();

        if let Err(e) = deps.job_queue.enqueue(new_job).await {
            tracing::error!(tenant_id = %tenant.id, error = %e, "failed to enqueue budget check");
        }
    }

    Ok(())
}

/// Delete audit entries past each tenant's retention window (90-day floor).
async fn prune_audit_entries(deps: &Arc<ServerDeps>) -> Result<()> {
    let tenants = Tenant::find_active(&deps.db_pool).await?;
    for tenant in tenants {
        let cutoff = Utc::now() - Duration::days(tenant.retention_days());
        match AuditEntry::prune_before(tenant.id, cutoff, &deps.db_pool).await {
            Ok(0) => {}
            Ok(deleted) => {
                tracing::info!(tenant_id = %tenant.id, deleted, "pruned expired audit entries");
            }
            Err(e) => {
                tracing::error!(tenant_id = %tenant.id, error = %e, "audit pruning failed");
            }
        }
    }

    Ok(())
}
