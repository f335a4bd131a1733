//! Run a reconciliation pass for one store.
//!
//! Thin shim over the reconciliation engine; rate limits bubble out so the
//! runner reschedules the pass without consuming an attempt.

use serde::Deserialize;
use uuid::Uuid;

use crate::kernel::error::OrchestratorError;
use crate::kernel::jobs::registry::{JobContext, JobOutcome};
use crate::kernel::reconcile;

#[derive(Debug, Deserialize)]
pub struct ReconciliationPayload {
    pub store_id: Uuid,
}

pub async fn handle(
    payload: ReconciliationPayload,
    ctx: JobContext,
) -> Result<JobOutcome, OrchestratorError> {
    let summary = reconcile::run_store(&ctx.deps, ctx.tenant_id, payload.store_id).await?;

    let result = serde_json::to_value(&summary)
        .map_err(|e| OrchestratorError::Transient(e.to_string()))?;
    Ok(JobOutcome::success_with(result))
}
