//! Periodic budget circuit-breaker check for one tenant.
//!
//! Freezes every breached budget and raises a `budget_override` approval
//! for each. The freeze CAS guarantees one approval per breach epoch even
//! with concurrent checks.

use serde::Deserialize;

use crate::common::sql::Record;
use crate::kernel::approvals::Approval;
use crate::kernel::audit::{self, AuditEntry, AuditTag};
use crate::kernel::budgets::Budget;
use crate::kernel::error::OrchestratorError;
use crate::kernel::jobs::registry::{JobContext, JobOutcome};
use crate::kernel::stream_hub::ChangeEvent;

#[derive(Debug, Deserialize)]
pub struct BudgetCheckPayload {}

pub async fn handle(
    _payload: BudgetCheckPayload,
    ctx: JobContext,
) -> Result<JobOutcome, OrchestratorError> {
    let db = &ctx.deps.db_pool;

    let frozen = Budget::freeze_breached(ctx.tenant_id, db)
        .await
        .map_err(|e| OrchestratorError::Transient(e.to_string()))?;

    for budget in &frozen {
        tracing::warn!(
            budget_id = %budget.id,
            budget_type = %budget.budget_type,
            current = %budget.current,
            limit = %budget.limit,
            "budget breached, frozen"
        );

        let approval = Approval::budget_override(
            ctx.tenant_id,
            budget.id,
            serde_json::json!({
                "budget_name": budget.budget_type,
                "current": budget.current,
                "limit": budget.limit,
            }),
        );
        approval
            .insert(db)
            .await
            .map_err(|e| OrchestratorError::Transient(e.to_string()))?;

        audit::record(
            db,
            AuditEntry::builder()
                .tenant_id(ctx.tenant_id)
                .action("budget_frozen")
                .resource_type("budget")
                .resource_id(budget.id.to_string())
                .metadata(serde_json::json!({
                    "budget_type": budget.budget_type,
                    "current": budget.current,
                    "limit": budget.limit,
                    "approval_id": approval.id,
                }))
                .tags(vec![
                    AuditTag::Automation.as_str().to_string(),
                    AuditTag::DataIntegrity.as_str().to_string(),
                ])
                .build(),
        )
        .await;

        ctx.deps
            .stream_hub
            .publish(
                ctx.tenant_id,
                ChangeEvent::new("budget_frozen", "budget", budget.id),
            )
            .await;
    }

    Ok(JobOutcome::success_with(serde_json::json!({
        "frozen": frozen.len(),
    })))
}
