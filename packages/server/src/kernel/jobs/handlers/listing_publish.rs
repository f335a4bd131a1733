//! Publish a local listing to its store's platform.
//!
//! Moves the listing through draft → publishing → published, records the
//! remote identity, and asks the engine for a follow-up reconciliation pass
//! so drift introduced during the publish window is caught.

use serde::Deserialize;
use uuid::Uuid;

use crate::common::sql::Record;
use crate::domains::listings::{Listing, ListingStatus};
use crate::kernel::error::OrchestratorError;
use crate::kernel::gateway::PlatformRequest;
use crate::kernel::jobs::registry::{JobContext, JobOutcome};

#[derive(Debug, Deserialize)]
pub struct ListingPublishPayload {
    pub listing_id: Uuid,
}

pub async fn handle(
    payload: ListingPublishPayload,
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

    match listing.status {
        // Re-delivery of an already-finished publish.
        ListingStatus::Published => {
            return Ok(JobOutcome::success_with(serde_json::json!({
                "listing_id": listing.id,
                "external_id": listing.external_id,
                "already_published": true,
            })));
        }
        ListingStatus::Draft | ListingStatus::Errored => {
            let claimed =
                Listing::transition_status(listing.id, listing.status, ListingStatus::Publishing, db)
                    .await
                    .map_err(|e| OrchestratorError::Transient(e.to_string()))?;
            if !claimed {
                // Another publish run owns the listing.
                return Err(OrchestratorError::Conflict);
            }
        }
        // A previous attempt of this job already claimed it; resume.
        ListingStatus::Publishing => {}
    }

    if ctx.cancel.is_cancelled() {
        return Err(OrchestratorError::Transient("cancelled before publish".to_string()));
    }

    let body = serde_json::json!({
        "product": {
            "title": listing.title,
            "price": listing.price,
            "quantity": listing.quantity,
            "status": "active",
        }
    });
    let response = match ctx
        .deps
        .gateway
        .call(listing.store_id, PlatformRequest::post("/products.json", body))
        .await
    {
        Ok(response) => response,
        Err(e) => {
            let error: OrchestratorError = e.into();
            if error.is_permanent() {
                let _ = Listing::transition_status(
                    listing.id,
                    ListingStatus::Publishing,
                    ListingStatus::Errored,
                    db,
                )
                .await;
            }
            return Err(error);
        }
    };

    let external_id = response
        .body
        .pointer("/product/id")
        .or_else(|| response.body.get("id"))
        .map(json_id_to_string);
    let Some(external_id) = external_id else {
        let _ = Listing::transition_status(
            listing.id,
            ListingStatus::Publishing,
            ListingStatus::Errored,
            db,
        )
        .await;
        return Ok(JobOutcome::permanent(
            "platform response carried no product id",
        ));
    };

    Listing::set_external_id(listing.id, &external_id, db)
        .await
        .map_err(|e| OrchestratorError::Transient(e.to_string()))?;
    let _ = Listing::transition_status(
        listing.id,
        ListingStatus::Publishing,
        ListingStatus::Published,
        db,
    )
    .await
    .map_err(|e| OrchestratorError::Transient(e.to_string()))?;

    Ok(JobOutcome::success_needs_reconciliation(serde_json::json!({
        "listing_id": listing.id,
        "external_id": external_id,
        "cost": response.cost,
        "throttled": response.throttled,
    })))
}

fn json_id_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
