//! Push a listing's stock level to its platform.

use serde::Deserialize;
use uuid::Uuid;

use crate::common::sql::Record;
use crate::domains::listings::Listing;
use crate::kernel::error::OrchestratorError;
use crate::kernel::gateway::PlatformRequest;
use crate::kernel::jobs::registry::{JobContext, JobOutcome};

#[derive(Debug, Deserialize)]
pub struct InventorySyncPayload {
    pub listing_id: Uuid,
    /// New local truth, when the caller is also correcting local stock.
    #[serde(default)]
    pub quantity: Option<i32>,
}

pub async fn handle(
    payload: InventorySyncPayload,
    ctx: JobContext,
) -> Result<JobOutcome, OrchestratorError> {
    let db = &ctx.deps.db_pool;

    let mut listing = Listing::find_by_id(payload.listing_id, db)
        .await
        .map_err(|_| OrchestratorError::NotFound(format!("listing {}", payload.listing_id)))?;
    if listing.tenant_id != ctx.tenant_id {
        return Err(OrchestratorError::NotFound(format!(
            "listing {}",
            payload.listing_id
        )));
    }

    // Local state settles before anything goes over the wire, so a crash
    // between the two writes reconciles toward the newer quantity.
    if let Some(quantity) = payload.quantity {
        if quantity < 0 {
            return Err(OrchestratorError::Invalid(format!(
                "negative quantity {quantity}"
            )));
        }
        if quantity != listing.quantity {
            Listing::set_quantity(listing.id, quantity, db)
                .await
                .map_err(|e| OrchestratorError::Transient(e.to_string()))?;
            listing.quantity = quantity;
        }
    }

    let Some(external_id) = listing.external_id.as_deref() else {
        return Ok(JobOutcome::permanent(
            "listing has no remote counterpart; publish it first",
        ));
    };

    if ctx.cancel.is_cancelled() {
        return Err(OrchestratorError::Transient("cancelled before sync".to_string()));
    }

    let response = ctx
        .deps
        .gateway
        .call(
            listing.store_id,
            PlatformRequest::put(
                &format!("/products/{external_id}/inventory.json"),
                serde_json::json!({ "quantity": listing.quantity }),
            ),
        )
        .await
        .map_err(OrchestratorError::from)?;

    Ok(JobOutcome::success_with(serde_json::json!({
        "listing_id": listing.id,
        "quantity": listing.quantity,
        "cost": response.cost,
        "throttled": response.throttled,
    })))
}
