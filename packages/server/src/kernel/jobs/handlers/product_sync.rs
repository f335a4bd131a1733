//! Push a listing's product data to its remote counterpart.

use serde::Deserialize;
use uuid::Uuid;

use crate::common::sql::Record;
use crate::domains::listings::Listing;
use crate::kernel::error::OrchestratorError;
use crate::kernel::gateway::PlatformRequest;
use crate::kernel::jobs::registry::{JobContext, JobOutcome};

#[derive(Debug, Deserialize)]
pub struct ProductSyncPayload {
    pub listing_id: Uuid,
}

pub async fn handle(
    payload: ProductSyncPayload,
    ctx: JobContext,
) -> Result<JobOutcome, OrchestratorError> {
    let db = &ctx.deps.db_pool;

    let listing = Listing::find_by_id(payload.listing_id, db)
        .await
        .map_err(|_| OrchestratorError::NotFound(format!("listing {}", payload.listing_id)))?;
    if listing.tenant_id != ctx.tenant_id {
        return Err(OrchestratorError::NotFound(format!(
            "listing {}",
            payload.listing_id
        )));
    }

    let Some(external_id) = listing.external_id.as_deref() else {
        // Nothing remote to sync against; publishing comes first.
        return Ok(JobOutcome::permanent(
            "listing has no remote counterpart; publish it first",
        ));
    };

    if ctx.cancel.is_cancelled() {
        return Err(OrchestratorError::Transient("cancelled before sync".to_string()));
    }

    let body = serde_json::json!({
        "product": {
            "title": listing.title,
            "price": listing.price,
            "quantity": listing.quantity,
        }
    });
    let response = ctx
        .deps
        .gateway
        .call(
            listing.store_id,
            PlatformRequest::put(&format!("/products/{external_id}.json"), body),
        )
        .await
        .map_err(OrchestratorError::from)?;

    Ok(JobOutcome::success_with(serde_json::json!({
        "listing_id": listing.id,
        "external_id": external_id,
        "cost": response.cost,
        "throttled": response.throttled,
    })))
}
