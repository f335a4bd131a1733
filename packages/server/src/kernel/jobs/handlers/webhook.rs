//! Downstream processing for normalized webhook events.
//!
//! The intake already verified, deduplicated, and normalized the callback;
//! this handler applies its catalog effects. Remote-originated change is
//! never trusted blindly for product data: it schedules a reconciliation
//! pass instead of overwriting local state. Inventory is the exception:
//! the platform is the source of truth for stock it decremented.

use chrono::{Duration, Utc};

use crate::domains::listings::Listing;
use crate::kernel::audit::{self, AuditEntry, AuditTag};
use crate::kernel::budgets::Budget;
use crate::kernel::error::OrchestratorError;
use crate::kernel::jobs::queue::NewJob;
use crate::kernel::jobs::registry::{JobContext, JobOutcome};
use crate::kernel::stream_hub::ChangeEvent;
use crate::kernel::webhooks::normalize::NormalizedEvent;

pub async fn handle(
    event: NormalizedEvent,
    ctx: JobContext,
) -> Result<JobOutcome, OrchestratorError> {
    let db = &ctx.deps.db_pool;
    let Some(store_id) = ctx.store_id else {
        return Ok(JobOutcome::permanent("webhook job carries no store id"));
    };

    match event.resource_type.as_str() {
        "product" => {
            // Remote product change: verify through reconciliation rather
            // than mirroring an unvetted payload.
            schedule_reconciliation(&ctx, store_id).await?;
        }
        "inventory" => {
            apply_inventory(&event, store_id, &ctx).await?;
        }
        "order" => {
            // Order intake counts against the orders budget; a frozen
            // budget fails the job and raises a budget_override approval.
            consume_order_budget(&ctx, store_id).await?;

            audit::record(
                db,
                AuditEntry::builder()
                    .tenant_id(ctx.tenant_id)
                    .action(format!("order_{}", event.action))
                    .resource_type("order")
                    .resource_id(event.resource_id.clone())
                    .metadata(serde_json::json!({ "event_type": event.event_type }))
                    .tags(vec![
                        AuditTag::Webhook.as_str().to_string(),
                        AuditTag::DataModification.as_str().to_string(),
                    ])
                    .build(),
            )
            .await;

            ctx.deps
                .stream_hub
                .publish(
                    ctx.tenant_id,
                    ChangeEvent::new("order_event", "order", &event.resource_id),
                )
                .await;
        }
        _ => {
            audit::record(
                db,
                AuditEntry::builder()
                    .tenant_id(ctx.tenant_id)
                    .action("webhook_ignored")
                    .resource_type("webhook_event")
                    .resource_id(event.resource_id.clone())
                    .metadata(serde_json::json!({ "event_type": event.event_type }))
                    .tags(vec![AuditTag::Webhook.as_str().to_string()])
                    .build(),
            )
            .await;
        }
    }

    Ok(JobOutcome::success_with(serde_json::json!({
        "resource_type": event.resource_type,
        "action": event.action,
    })))
}

/// Count one order against the applicable orders budget, when one exists.
async fn consume_order_budget(
    ctx: &JobContext,
    store_id: uuid::Uuid,
) -> Result<(), OrchestratorError> {
    let db = &ctx.deps.db_pool;
    let budget = Budget::find_applicable(ctx.tenant_id, Some(store_id), "orders", db)
        .await
        .map_err(|e| OrchestratorError::Transient(e.to_string()))?;

    if let Some(budget) = budget {
        Budget::consume(budget.id, rust_decimal::Decimal::ONE, db).await?;
    }
    Ok(())
}

/// Coalesced reconciliation follow-up (same minute-bucketed key the engine
/// uses for handler-requested passes).
async fn schedule_reconciliation(
    ctx: &JobContext,
    store_id: uuid::Uuid,
) -> Result<(), OrchestratorError> {
    let scheduled_at = Utc::now() + Duration::seconds(60);
    let new_job = NewJob::builder()
        .tenant_id(ctx.tenant_id)
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

    ctx.deps.job_queue.enqueue(new_job).await?;
    Ok(())
}

/// Adopt the platform's stock level for a known listing.
async fn apply_inventory(
    event: &NormalizedEvent,
    store_id: uuid::Uuid,
    ctx: &JobContext,
) -> Result<(), OrchestratorError> {
    let db = &ctx.deps.db_pool;

    let quantity = event
        .data
        .get("quantity")
        .or_else(|| event.data.get("available"))
        .and_then(|v| v.as_i64())
        .map(|v| v as i32);
    let Some(quantity) = quantity else {
        // Inventory event without a level; reconciliation will catch up.
        return schedule_reconciliation(ctx, store_id).await;
    };

    let listing = Listing::find_by_external_id(store_id, &event.resource_id, db)
        .await
        .map_err(|e| OrchestratorError::Transient(e.to_string()))?;
    let Some(listing) = listing else {
        return schedule_reconciliation(ctx, store_id).await;
    };

    if listing.quantity != quantity {
        Listing::set_quantity(listing.id, quantity, db)
            .await
            .map_err(|e| OrchestratorError::Transient(e.to_string()))?;

        audit::record(
            db,
            AuditEntry::builder()
                .tenant_id(ctx.tenant_id)
                .action("inventory_adopted")
                .resource_type("listing")
                .resource_id(listing.id.to_string())
                .old_value(serde_json::json!({ "quantity": listing.quantity }))
                .new_value(serde_json::json!({ "quantity": quantity }))
                .tags(vec![
                    AuditTag::Webhook.as_str().to_string(),
                    AuditTag::DataModification.as_str().to_string(),
                ])
                .build(),
        )
        .await;
    }

    Ok(())
}
