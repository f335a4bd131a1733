//! Job control API: enqueue, retry, cancel, inspect.
//!
//! This is the minimal surface the UI depends on; everything else about a
//! job's lifecycle belongs to the engine.

use axum::extract::{Extension, Path};
use axum::Json;
use serde::Serialize;
use uuid::Uuid;

use crate::common::sql::Record;
use crate::kernel::audit::{self, AuditEntry, AuditTag};
use crate::kernel::jobs::{Job, NewJob};
use crate::kernel::stream_hub::ChangeEvent;
use crate::kernel::OrchestratorError;
use crate::server::app::AppState;
use crate::server::error::ApiError;

#[derive(Serialize)]
pub struct EnqueueResponse {
    pub job_id: Uuid,
    pub deduplicated: bool,
}

/// POST /jobs: enqueue a job.
pub async fn enqueue_handler(
    Extension(state): Extension<AppState>,
    Json(new_job): Json<NewJob>,
) -> Result<Json<EnqueueResponse>, ApiError> {
    let tenant_id = new_job.tenant_id;
    let result = state.deps.job_queue.enqueue(new_job).await?;

    if result.is_created() {
        audit::record(
            &state.deps.db_pool,
            AuditEntry::builder()
                .tenant_id(tenant_id)
                .action("job_enqueued")
                .resource_type("job")
                .resource_id(result.job_id().to_string())
                .tags(vec![AuditTag::Automation.as_str().to_string()])
                .build(),
        )
        .await;
    }

    Ok(Json(EnqueueResponse {
        job_id: result.job_id(),
        deduplicated: !result.is_created(),
    }))
}

/// GET /jobs/{id}: job status, including `last_error` for failed jobs.
pub async fn get_handler(
    Extension(state): Extension<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>, ApiError> {
    let job = Job::find_by_id(id, &state.deps.db_pool).await?;
    Ok(Json(job))
}

/// POST /jobs/{id}/retry: operator reset of a failed job.
pub async fn retry_handler(
    Extension(state): Extension<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>, ApiError> {
    let db = &state.deps.db_pool;

    // 404 for unknown ids, 409 for non-retryable states.
    let existing = Job::find_by_id(id, db).await?;
    let job = Job::operator_retry(id, db)
        .await
        .map_err(|e| ApiError(OrchestratorError::Transient(e.to_string())))?
        .ok_or(ApiError(OrchestratorError::Conflict))?;

    audit::record(
        db,
        AuditEntry::builder()
            .tenant_id(existing.tenant_id)
            .action("job_operator_retry")
            .resource_type("job")
            .resource_id(id.to_string())
            .old_value(serde_json::json!({ "status": existing.status }))
            .new_value(serde_json::json!({ "status": job.status }))
            .tags(vec![AuditTag::DataModification.as_str().to_string()])
            .build(),
    )
    .await;

    state
        .deps
        .stream_hub
        .publish(job.tenant_id, ChangeEvent::new("job_retried", "job", job.id))
        .await;

    Ok(Json(job))
}

/// POST /jobs/{id}/cancel: cancel a pending or claimed job.
pub async fn cancel_handler(
    Extension(state): Extension<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>, ApiError> {
    let db = &state.deps.db_pool;

    let existing = Job::find_by_id(id, db).await?;
    let cancelled = Job::cancel(id, db)
        .await
        .map_err(|e| ApiError(OrchestratorError::Transient(e.to_string())))?;
    if !cancelled {
        return Err(ApiError(OrchestratorError::Conflict));
    }

    audit::record(
        db,
        AuditEntry::builder()
            .tenant_id(existing.tenant_id)
            .action("job_cancelled")
            .resource_type("job")
            .resource_id(id.to_string())
            .tags(vec![AuditTag::DataModification.as_str().to_string()])
            .build(),
    )
    .await;

    state
        .deps
        .stream_hub
        .publish(
            existing.tenant_id,
            ChangeEvent::new("job_cancelled", "job", id),
        )
        .await;

    let job = Job::find_by_id(id, db).await?;
    Ok(Json(job))
}
