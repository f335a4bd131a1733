//! Approval decisions and listings.

use axum::extract::{Extension, Path, Query};
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use crate::kernel::approvals::{Approval, ApprovalStatus, Decision};
use crate::kernel::audit::{self, AuditEntry, AuditTag};
use crate::kernel::budgets::Budget;
use crate::kernel::stream_hub::ChangeEvent;
use crate::kernel::OrchestratorError;
use crate::server::app::AppState;
use crate::server::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct DecideRequest {
    pub decision: Decision,
    #[serde(default)]
    pub reason: Option<String>,
    /// Operator identity as the UI reports it.
    #[serde(default)]
    pub decided_by: Option<String>,
}

/// POST /approvals/{id}/decide
///
/// Applies the decision via CAS; an approval that is no longer pending
/// answers 409. Approving a `budget_override` also lifts the freeze.
pub async fn decide_handler(
    Extension(state): Extension<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<DecideRequest>,
) -> Result<Json<Approval>, ApiError> {
    let db = &state.deps.db_pool;
    let decided_by = request.decided_by.as_deref().unwrap_or("operator");

    let approval = Approval::decide(id, request.decision, decided_by, request.reason.as_deref(), db)
        .await
        .map_err(|e| ApiError(OrchestratorError::Transient(e.to_string())))?
        .ok_or(ApiError(OrchestratorError::Conflict))?;

    // Decision consequences.
    if approval.status == ApprovalStatus::Approved && approval.action == "budget_override" {
        if let Ok(budget_id) = approval.resource_id.parse::<Uuid>() {
            match Budget::unfreeze(budget_id, db).await {
                Ok(true) => {
                    tracing::info!(budget_id = %budget_id, "budget unfrozen by approval");
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(budget_id = %budget_id, error = %e, "failed to unfreeze budget");
                }
            }
        }
    }

    audit::record(
        db,
        AuditEntry::builder()
            .tenant_id(approval.tenant_id)
            .actor_id(decided_by.to_string())
            .action("approval_decided")
            .resource_type("approval")
            .resource_id(approval.id.to_string())
            .new_value(serde_json::json!({
                "status": approval.status,
                "reason": approval.decision_reason,
            }))
            .tags(vec![AuditTag::AccessControl.as_str().to_string()])
            .build(),
    )
    .await;

    state
        .deps
        .stream_hub
        .publish(
            approval.tenant_id,
            ChangeEvent::new("approval_decided", "approval", approval.id),
        )
        .await;

    Ok(Json(approval))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub tenant_id: Uuid,
    #[serde(default)]
    pub status: Option<ApprovalStatus>,
}

/// GET /approvals?tenant_id=&status=
pub async fn list_handler(
    Extension(state): Extension<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Approval>>, ApiError> {
    let status = query.status.unwrap_or(ApprovalStatus::Pending);
    let approvals = Approval::find_by_status(query.tenant_id, status, &state.deps.db_pool)
        .await
        .map_err(|e| ApiError(OrchestratorError::Transient(e.to_string())))?;

    Ok(Json(approvals))
}
