//! Append-only audit log.
//!
//! Every state transition in the plane writes at least one entry. The table
//! rejects updates at the database level; the only delete path is the
//! retention pruner, and only past the retention floor.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use typed_builder::TypedBuilder;
use uuid::Uuid;

/// Controlled tag vocabulary for compliance reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditTag {
    DataModification,
    AccessControl,
    Authentication,
    RateLimiting,
    Security,
    Webhook,
    Automation,
    Reconciliation,
    DataIntegrity,
}

impl AuditTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditTag::DataModification => "data_modification",
            AuditTag::AccessControl => "access_control",
            AuditTag::Authentication => "authentication",
            AuditTag::RateLimiting => "rate_limiting",
            AuditTag::Security => "security",
            AuditTag::Webhook => "webhook",
            AuditTag::Automation => "automation",
            AuditTag::Reconciliation => "reconciliation",
            AuditTag::DataIntegrity => "data_integrity",
        }
    }
}

#[derive(FromRow, Debug, Clone, Serialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct AuditEntry {
    #[builder(default = Uuid::now_v7())]
    pub id: Uuid,
    pub tenant_id: Uuid,
    #[builder(default, setter(strip_option))]
    pub actor_id: Option<String>,
    pub action: String,
    pub resource_type: String,
    #[builder(default, setter(strip_option))]
    pub resource_id: Option<String>,
    #[builder(default, setter(strip_option))]
    pub old_value: Option<serde_json::Value>,
    #[builder(default, setter(strip_option))]
    pub new_value: Option<serde_json::Value>,
    #[builder(default = serde_json::json!({}))]
    pub metadata: serde_json::Value,
    #[builder(default)]
    pub tags: Vec<String>,
    #[builder(default = Utc::now())]
    pub received_at: DateTime<Utc>,
}

impl AuditEntry {
    /// Append the entry. There is deliberately no update counterpart.
    pub async fn insert(&self, db: &PgPool) -> Result<Self> {
        let entry = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO audit_entries (
                id, tenant_id, actor_id, action, resource_type, resource_id,
                old_value, new_value, metadata, tags, received_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING id, tenant_id, actor_id, action, resource_type, resource_id,
                      old_value, new_value, metadata, tags, received_at
            "#,
        )
        .bind(self.id)
        .bind(self.tenant_id)
        .bind(&self.actor_id)
        .bind(&self.action)
        .bind(&self.resource_type)
        .bind(&self.resource_id)
        .bind(&self.old_value)
        .bind(&self.new_value)
        .bind(&self.metadata)
        .bind(&self.tags)
        .bind(self.received_at)
        .fetch_one(db)
        .await?;

        Ok(entry)
    }

    /// Query entries for a tenant, newest first, keyed by id (UUIDv7 ids are
    /// time-ordered) for cursor pagination. Fetches `limit` rows; pass
    /// `limit + 1` to probe for a next page.
    pub async fn find_page(
        tenant_id: Uuid,
        before_id: Option<Uuid>,
        limit: i64,
        db: &PgPool,
    ) -> Result<Vec<Self>> {
        let entries = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, tenant_id, actor_id, action, resource_type, resource_id,
                   old_value, new_value, metadata, tags, received_at
            FROM audit_entries
            WHERE tenant_id = $1
              AND ($2::uuid IS NULL OR id < $2)
            ORDER BY id DESC
            LIMIT $3
            "#,
        )
        .bind(tenant_id)
        .bind(before_id)
        .bind(limit)
        .fetch_all(db)
        .await?;

        Ok(entries)
    }

    /// Delete entries older than the tenant's retention window. The database
    /// trigger independently refuses deletes inside the 90-day floor.
    pub async fn prune_before(
        tenant_id: Uuid,
        cutoff: DateTime<Utc>,
        db: &PgPool,
    ) -> Result<u64> {
        let deleted = sqlx::query(
            "DELETE FROM audit_entries WHERE tenant_id = $1 AND received_at < $2",
        )
        .bind(tenant_id)
        .bind(cutoff)
        .execute(db)
        .await?
        .rows_affected();

        Ok(deleted)
    }
}

/// Convenience writer used by the subsystems; logs instead of failing the
/// caller when the audit insert itself errors.
pub async fn record(db: &PgPool, entry: AuditEntry) {
    if let Err(e) = entry.insert(db).await {
        tracing::error!(
            action = %entry.action,
            tenant_id = %entry.tenant_id,
            error = %e,
            "failed to write audit entry"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_serialize_to_controlled_vocabulary() {
        assert_eq!(AuditTag::RateLimiting.as_str(), "rate_limiting");
        assert_eq!(AuditTag::DataIntegrity.as_str(), "data_integrity");
        assert_eq!(
            serde_json::to_value(AuditTag::Webhook).unwrap(),
            serde_json::json!("webhook")
        );
    }

    #[test]
    fn builder_defaults_are_sane() {
        let entry = AuditEntry::builder()
            .tenant_id(Uuid::new_v4())
            .action("job_completed")
            .resource_type("job")
            .build();
        assert!(entry.actor_id.is_none());
        assert_eq!(entry.metadata, serde_json::json!({}));
        assert!(entry.tags.is_empty());
    }

    #[test]
    fn v7_ids_order_by_creation_time() {
        let first = AuditEntry::builder()
            .tenant_id(Uuid::new_v4())
            .action("a")
            .resource_type("job")
            .build();
        let second = AuditEntry::builder()
            .tenant_id(Uuid::new_v4())
            .action("b")
            .resource_type("job")
            .build();
        assert!(first.id < second.id);
    }
}
