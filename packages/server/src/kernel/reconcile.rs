//! Reconciliation engine: scheduled drift detection between local listings
//! and remote platform state.
//!
//! A pass is side-effect-free on the primary data: it emits Discrepancy
//! rows and, for severe drift, a gated approval. It never auto-corrects.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use tracing::{info, warn};
use uuid::Uuid;

use crate::common::sql::Record;
use crate::domains::listings::{Listing, ListingStatus};
use crate::domains::stores::Store;
use crate::kernel::approvals::Approval;
use crate::kernel::audit::{self, AuditEntry, AuditTag};
use crate::kernel::error::OrchestratorError;
use crate::kernel::gateway::PlatformRequest;
use crate::kernel::stream_hub::ChangeEvent;
use crate::kernel::ServerDeps;

/// Inventory divergence below this is noise.
const QUANTITY_TOLERANCE: i32 = 5;
/// Inventory divergence above this is critical.
const QUANTITY_CRITICAL: i32 = 50;
/// Price divergence below a cent is rounding.
const PRICE_TOLERANCE: &str = "0.01";

/// Remote pages fetched per pass; a store larger than this reconciles
/// incrementally across passes.
const MAX_PAGES: usize = 20;
const PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "discrepancy_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DiscrepancyKind {
    MissingLocal,
    MissingRemote,
    InventoryDrift,
    PriceDrift,
    DataMismatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "discrepancy_severity", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DiscrepancySeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl DiscrepancySeverity {
    /// High and critical findings require operator sign-off.
    pub fn requires_approval(&self) -> bool {
        matches!(self, DiscrepancySeverity::High | DiscrepancySeverity::Critical)
    }
}

#[derive(FromRow, Debug, Clone, Serialize)]
pub struct Discrepancy {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub store_id: Uuid,
    pub kind: DiscrepancyKind,
    pub severity: DiscrepancySeverity,
    pub external_id: Option<String>,
    pub listing_id: Option<Uuid>,
    pub detail: serde_json::Value,
    pub run_id: Uuid,
    pub detected_at: DateTime<Utc>,
}

impl Discrepancy {
    fn new(
        tenant_id: Uuid,
        store_id: Uuid,
        run_id: Uuid,
        kind: DiscrepancyKind,
        severity: DiscrepancySeverity,
        external_id: Option<String>,
        listing_id: Option<Uuid>,
        detail: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            tenant_id,
            store_id,
            kind,
            severity,
            external_id,
            listing_id,
            detail,
            run_id,
            detected_at: Utc::now(),
        }
    }

    async fn insert(&self, db: &PgPool) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO discrepancies (
                id, tenant_id, store_id, kind, severity, external_id,
                listing_id, detail, run_id, detected_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(self.id)
        .bind(self.tenant_id)
        .bind(self.store_id)
        .bind(self.kind)
        .bind(self.severity)
        .bind(&self.external_id)
        .bind(self.listing_id)
        .bind(&self.detail)
        .bind(self.run_id)
        .bind(self.detected_at)
        .execute(db)
        .await?;

        Ok(())
    }
}

/// One remote resource as the platform reports it.
#[derive(Debug, Clone, Default)]
pub struct RemoteResource {
    pub external_id: String,
    pub quantity: Option<i32>,
    pub price: Option<Decimal>,
    pub status: Option<String>,
}

/// Counts reported by one reconciliation pass.
#[derive(Debug, Default, Serialize)]
pub struct ReconcileSummary {
    pub run_id: Option<Uuid>,
    pub remote_count: usize,
    pub local_count: usize,
    pub missing_local: usize,
    pub missing_remote: usize,
    pub inventory_drift: usize,
    pub price_drift: usize,
    pub data_mismatch: usize,
    pub approval_id: Option<Uuid>,
}

impl ReconcileSummary {
    pub fn total(&self) -> usize {
        self.missing_local
            + self.missing_remote
            + self.inventory_drift
            + self.price_drift
            + self.data_mismatch
    }
}

/// Run one reconciliation pass for a store.
///
/// Rate limits propagate out unhandled so the job engine reschedules the
/// pass at the bucket's horizon without consuming an attempt.
pub async fn run_store(
    deps: &Arc<ServerDeps>,
    tenant_id: Uuid,
    store_id: Uuid,
) -> Result<ReconcileSummary, OrchestratorError> {
    let db = &deps.db_pool;

    let store = Store::find_by_id(store_id, db)
        .await
        .map_err(|_| OrchestratorError::NotFound(format!("store {store_id}")))?;
    if store.tenant_id != tenant_id {
        return Err(OrchestratorError::NotFound(format!("store {store_id}")));
    }

    let local = Listing::find_by_store(store_id, db)
        .await
        .map_err(|e| OrchestratorError::Transient(e.to_string()))?;
    let remote = fetch_remote(deps, store_id).await?;

    let run_id = Uuid::now_v7();
    let findings = compare(&store, &local, &remote, run_id);

    let mut summary = ReconcileSummary {
        run_id: Some(run_id),
        remote_count: remote.len(),
        local_count: local.len(),
        ..Default::default()
    };

    let mut severe: Vec<&Discrepancy> = Vec::new();
    for finding in &findings {
        match finding.kind {
            DiscrepancyKind::MissingLocal => summary.missing_local += 1,
            DiscrepancyKind::MissingRemote => summary.missing_remote += 1,
            DiscrepancyKind::InventoryDrift => summary.inventory_drift += 1,
            DiscrepancyKind::PriceDrift => summary.price_drift += 1,
            DiscrepancyKind::DataMismatch => summary.data_mismatch += 1,
        }
        if finding.severity.requires_approval() {
            severe.push(finding);
        }
        finding
            .insert(db)
            .await
            .map_err(|e| OrchestratorError::Transient(e.to_string()))?;
    }

    if !severe.is_empty() {
        let payload = serde_json::json!({
            "run_id": run_id,
            "discrepancies": severe
                .iter()
                .map(|d| serde_json::json!({
                    "id": d.id,
                    "kind": d.kind,
                    "severity": d.severity,
                    "external_id": d.external_id,
                    "listing_id": d.listing_id,
                    "detail": d.detail,
                }))
                .collect::<Vec<_>>(),
        });
        let approval = Approval::resolve_discrepancies(tenant_id, store_id, payload);
        approval
            .insert(db)
            .await
            .map_err(|e| OrchestratorError::Transient(e.to_string()))?;
        summary.approval_id = Some(approval.id);

        warn!(
            store_id = %store_id,
            run_id = %run_id,
            severe = severe.len(),
            "reconciliation found severe drift, approval requested"
        );
    }

    Store::mark_synced(store_id, Utc::now(), db)
        .await
        .map_err(|e| OrchestratorError::Transient(e.to_string()))?;

    info!(
        store_id = %store_id,
        run_id = %run_id,
        total = summary.total(),
        remote = summary.remote_count,
        local = summary.local_count,
        "reconciliation run complete"
    );

    audit::record(
        db,
        AuditEntry::builder()
            .tenant_id(tenant_id)
            .action("reconciliation_run")
            .resource_type("store")
            .resource_id(store_id.to_string())
            .metadata(
                serde_json::to_value(&summary).unwrap_or_else(|_| serde_json::json!({})),
            )
            .tags(vec![AuditTag::Reconciliation.as_str().to_string()])
            .build(),
    )
    .await;

    deps.stream_hub
        .publish(
            tenant_id,
            ChangeEvent::new("reconciliation_run", "store", store_id),
        )
        .await;

    Ok(summary)
}

/// Fetch remote resources through the gateway, page by page.
async fn fetch_remote(
    deps: &Arc<ServerDeps>,
    store_id: Uuid,
) -> Result<Vec<RemoteResource>, OrchestratorError> {
    let mut resources = Vec::new();

    for page in 1..=MAX_PAGES {
        let request = PlatformRequest::get(&format!(
            "/products.json?page={page}&limit={PAGE_SIZE}"
        ));
        let response = deps
            .gateway
            .call(store_id, request)
            .await
            .map_err(OrchestratorError::from)?;

        let batch = parse_remote_page(&response.body);
        let batch_len = batch.len();
        resources.extend(batch);

        if batch_len < PAGE_SIZE {
            break;
        }
        // A throttled gateway means the bucket is nearly dry; stop paging
        // and let the next pass pick up the tail.
        if response.throttled {
            warn!(store_id = %store_id, page, "stopping remote fetch early, gateway throttled");
            break;
        }
    }

    Ok(resources)
}

/// Tolerant extraction of resources from a platform listing page.
fn parse_remote_page(body: &serde_json::Value) -> Vec<RemoteResource> {
    let items = body
        .get("products")
        .or_else(|| body.get("data"))
        .or_else(|| body.get("items"))
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();

    items
        .iter()
        .filter_map(|item| {
            let external_id = match item.get("id") {
                Some(serde_json::Value::String(s)) => s.clone(),
                Some(serde_json::Value::Number(n)) => n.to_string(),
                _ => return None,
            };
            Some(RemoteResource {
                external_id,
                quantity: item
                    .get("quantity")
                    .or_else(|| item.get("inventory_quantity"))
                    .or_else(|| item.get("totalInventory"))
                    .and_then(|v| v.as_i64())
                    .map(|v| v as i32),
                price: item
                    .get("price")
                    .and_then(decimal_from_json),
                status: item
                    .get("status")
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
            })
        })
        .collect()
}

fn decimal_from_json(value: &serde_json::Value) -> Option<Decimal> {
    match value {
        serde_json::Value::String(s) => Decimal::from_str(s).ok(),
        serde_json::Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        _ => None,
    }
}

/// Classify drift between the local and remote maps.
fn compare(
    store: &Store,
    local: &[Listing],
    remote: &[RemoteResource],
    run_id: Uuid,
) -> Vec<Discrepancy> {
    let price_tolerance = Decimal::from_str(PRICE_TOLERANCE).unwrap_or_default();

    let remote_by_id: HashMap<&str, &RemoteResource> = remote
        .iter()
        .map(|r| (r.external_id.as_str(), r))
        .collect();
    let local_by_external: HashMap<&str, &Listing> = local
        .iter()
        .filter_map(|l| l.external_id.as_deref().map(|ext| (ext, l)))
        .collect();

    let mut findings = Vec::new();

    for resource in remote {
        if !local_by_external.contains_key(resource.external_id.as_str()) {
            findings.push(Discrepancy::new(
                store.tenant_id,
                store.id,
                run_id,
                DiscrepancyKind::MissingLocal,
                DiscrepancySeverity::Medium,
                Some(resource.external_id.clone()),
                None,
                serde_json::json!({ "remote_status": resource.status }),
            ));
        }
    }

    for listing in local {
        let Some(external_id) = listing.external_id.as_deref() else {
            continue;
        };
        let Some(resource) = remote_by_id.get(external_id) else {
            findings.push(Discrepancy::new(
                store.tenant_id,
                store.id,
                run_id,
                DiscrepancyKind::MissingRemote,
                DiscrepancySeverity::High,
                Some(external_id.to_string()),
                Some(listing.id),
                serde_json::json!({ "local_status": listing.status.as_str() }),
            ));
            continue;
        };

        if let Some(remote_qty) = resource.quantity {
            let drift = (listing.quantity - remote_qty).abs();
            if drift > QUANTITY_TOLERANCE {
                let severity = if drift > QUANTITY_CRITICAL {
                    DiscrepancySeverity::Critical
                } else {
                    DiscrepancySeverity::Medium
                };
                findings.push(Discrepancy::new(
                    store.tenant_id,
                    store.id,
                    run_id,
                    DiscrepancyKind::InventoryDrift,
                    severity,
                    Some(external_id.to_string()),
                    Some(listing.id),
                    serde_json::json!({
                        "local_quantity": listing.quantity,
                        "remote_quantity": remote_qty,
                    }),
                ));
            }
        }

        if let Some(remote_price) = resource.price {
            if (listing.price - remote_price).abs() > price_tolerance {
                findings.push(Discrepancy::new(
                    store.tenant_id,
                    store.id,
                    run_id,
                    DiscrepancyKind::PriceDrift,
                    DiscrepancySeverity::Low,
                    Some(external_id.to_string()),
                    Some(listing.id),
                    serde_json::json!({
                        "local_price": listing.price,
                        "remote_price": remote_price,
                    }),
                ));
            }
        }

        if let Some(remote_status) = resource.status.as_deref() {
            if status_diverges(listing.status, remote_status) {
                findings.push(Discrepancy::new(
                    store.tenant_id,
                    store.id,
                    run_id,
                    DiscrepancyKind::DataMismatch,
                    DiscrepancySeverity::High,
                    Some(external_id.to_string()),
                    Some(listing.id),
                    serde_json::json!({
                        "local_status": listing.status.as_str(),
                        "remote_status": remote_status,
                    }),
                ));
            }
        }
    }

    findings
}

/// A local `published` listing should be live remotely, and nothing else
/// should be.
fn status_diverges(local: ListingStatus, remote: &str) -> bool {
    let remote_live = matches!(remote.to_lowercase().as_str(), "active" | "published" | "live");
    match local {
        ListingStatus::Published => !remote_live,
        ListingStatus::Draft | ListingStatus::Errored => remote_live,
        // A publish in flight may legitimately be either.
        ListingStatus::Publishing => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::stores::Platform;

    fn test_store() -> Store {
        Store::new(Uuid::new_v4(), Platform::Shopify, "main")
    }

    fn listing(store: &Store, external_id: Option<&str>, qty: i32, price: &str) -> Listing {
        Listing {
            id: Uuid::now_v7(),
            tenant_id: store.tenant_id,
            store_id: store.id,
            external_id: external_id.map(str::to_string),
            title: "Widget".to_string(),
            status: ListingStatus::Published,
            quantity: qty,
            price: Decimal::from_str(price).unwrap(),
            updated_at: Utc::now(),
        }
    }

    fn remote(id: &str, qty: i32, price: &str, status: &str) -> RemoteResource {
        RemoteResource {
            external_id: id.to_string(),
            quantity: Some(qty),
            price: Some(Decimal::from_str(price).unwrap()),
            status: Some(status.to_string()),
        }
    }

    #[test]
    fn in_sync_listings_produce_no_findings() {
        let store = test_store();
        let local = vec![listing(&store, Some("p1"), 10, "19.99")];
        let remote_rows = vec![remote("p1", 10, "19.99", "active")];
        assert!(compare(&store, &local, &remote_rows, Uuid::new_v4()).is_empty());
    }

    #[test]
    fn quantity_drift_thresholds() {
        let store = test_store();
        let local = vec![listing(&store, Some("p1"), 10, "19.99")];

        // Drift of 5 is tolerated.
        let findings = compare(&store, &local, &[remote("p1", 15, "19.99", "active")], Uuid::new_v4());
        assert!(findings.is_empty());

        // Drift of 6 is medium.
        let findings = compare(&store, &local, &[remote("p1", 16, "19.99", "active")], Uuid::new_v4());
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].kind, DiscrepancyKind::InventoryDrift);
        assert_eq!(findings[0].severity, DiscrepancySeverity::Medium);

        // Drift over 50 is critical.
        let findings = compare(&store, &local, &[remote("p1", 70, "19.99", "active")], Uuid::new_v4());
        assert_eq!(findings[0].severity, DiscrepancySeverity::Critical);
    }

    #[test]
    fn price_drift_is_low_severity() {
        let store = test_store();
        let local = vec![listing(&store, Some("p1"), 10, "19.99")];

        // A cent of drift is rounding.
        let findings = compare(&store, &local, &[remote("p1", 10, "20.00", "active")], Uuid::new_v4());
        assert!(findings.is_empty());

        let findings = compare(&store, &local, &[remote("p1", 10, "21.50", "active")], Uuid::new_v4());
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].kind, DiscrepancyKind::PriceDrift);
        assert_eq!(findings[0].severity, DiscrepancySeverity::Low);
    }

    #[test]
    fn missing_each_side_is_classified() {
        let store = test_store();
        let local = vec![
            listing(&store, Some("gone-remotely"), 1, "5.00"),
            listing(&store, None, 1, "5.00"), // never published; not drift
        ];
        let remote_rows = vec![remote("unknown-locally", 1, "5.00", "active")];

        let findings = compare(&store, &local, &remote_rows, Uuid::new_v4());
        let kinds: Vec<_> = findings.iter().map(|f| f.kind).collect();
        assert!(kinds.contains(&DiscrepancyKind::MissingLocal));
        assert!(kinds.contains(&DiscrepancyKind::MissingRemote));
        assert_eq!(findings.len(), 2);

        let missing_remote = findings
            .iter()
            .find(|f| f.kind == DiscrepancyKind::MissingRemote)
            .unwrap();
        assert!(missing_remote.severity.requires_approval());
    }

    #[test]
    fn status_divergence_is_high() {
        let store = test_store();
        let local = vec![listing(&store, Some("p1"), 10, "19.99")];
        let findings = compare(&store, &local, &[remote("p1", 10, "19.99", "archived")], Uuid::new_v4());
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].kind, DiscrepancyKind::DataMismatch);
        assert_eq!(findings[0].severity, DiscrepancySeverity::High);
    }

    #[test]
    fn remote_page_parsing_tolerates_shapes() {
        let body = serde_json::json!({
            "products": [
                {"id": 1, "inventory_quantity": 4, "price": "9.99", "status": "active"},
                {"id": "two", "quantity": 7, "price": 12.5},
                {"no_id": true},
            ]
        });
        let resources = parse_remote_page(&body);
        assert_eq!(resources.len(), 2);
        assert_eq!(resources[0].external_id, "1");
        assert_eq!(resources[0].quantity, Some(4));
        assert_eq!(resources[1].external_id, "two");
        assert_eq!(resources[1].price, Some(Decimal::from_str("12.5").unwrap()));
    }
}
