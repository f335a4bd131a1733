//! Audit log query surface: filtered, cursor-paginated, read-only.

use axum::extract::{Extension, Query};
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use crate::common::pagination::{Cursor, Page};
use crate::kernel::audit::AuditEntry;
use crate::kernel::OrchestratorError;
use crate::server::app::AppState;
use crate::server::error::ApiError;

const DEFAULT_LIMIT: i64 = 50;
const MAX_LIMIT: i64 = 200;

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    pub tenant_id: Uuid,
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
}

/// GET /audit?tenant_id=&cursor=&limit=
pub async fn list_handler(
    Extension(state): Extension<AppState>,
    Query(query): Query<AuditQuery>,
) -> Result<Json<Page<AuditEntry>>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);

    let before_id = query
        .cursor
        .as_deref()
        .map(Cursor::decode)
        .transpose()
        .map_err(|_| ApiError(OrchestratorError::Invalid("invalid cursor".to_string())))?
        .map(Cursor::into_uuid);

    let rows = AuditEntry::find_page(query.tenant_id, before_id, limit + 1, &state.deps.db_pool)
        .await
        .map_err(|e| ApiError(OrchestratorError::Transient(e.to_string())))?;

    Ok(Json(Page::from_rows(rows, limit as usize, |entry| entry.id)))
}
