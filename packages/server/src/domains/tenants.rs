//! Tenant (org) model. Every entity in the plane is scoped to one tenant.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::common::sql::Record;

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: Uuid,
    pub name: String,
    /// Audit retention window; the pruner enforces a 90-day floor.
    pub audit_retention_days: i32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl Tenant {
    pub fn new(name: &str) -> Self {
        Self {
            id: Uuid::now_v7(),
            name: name.to_string(),
            audit_retention_days: 90,
            is_active: true,
            created_at: Utc::now(),
        }
    }

    /// All active tenants, for the worker loop and periodic sweeps.
    pub async fn find_active(db: &PgPool) -> Result<Vec<Self>> {
        let tenants = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, name, audit_retention_days, is_active, created_at
            FROM tenants
            WHERE is_active = TRUE
            ORDER BY created_at
            "#,
        )
        .fetch_all(db)
        .await?;

        Ok(tenants)
    }

    /// Retention window with the 90-day floor applied.
    pub fn retention_days(&self) -> i64 {
        i64::from(self.audit_retention_days.max(90))
    }
}

#[async_trait::async_trait]
impl Record for Tenant {
    const TABLE: &'static str = "tenants";
    type Id = Uuid;

    async fn find_by_id(id: Uuid, db: &PgPool) -> Result<Self> {
        let tenant = sqlx::query_as::<_, Self>(
            "SELECT id, name, audit_retention_days, is_active, created_at FROM tenants WHERE id = $1",
        )
        .bind(id)
        .fetch_one(db)
        .await?;

        Ok(tenant)
    }

    async fn insert(&self, db: &PgPool) -> Result<Self> {
        let tenant = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO tenants (id, name, audit_retention_days, is_active, created_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, name, audit_retention_days, is_active, created_at
            "#,
        )
        .bind(self.id)
        .bind(&self.name)
        .bind(self.audit_retention_days)
        .bind(self.is_active)
        .bind(self.created_at)
        .fetch_one(db)
        .await?;

        Ok(tenant)
    }

    async fn update(&self, db: &PgPool) -> Result<Self> {
        let tenant = sqlx::query_as::<_, Self>(
            r#"
            UPDATE tenants
            SET name = $1, audit_retention_days = $2, is_active = $3
            WHERE id = $4
            RETURNING id, name, audit_retention_days, is_active, created_at
            "#,
        )
        .bind(&self.name)
        .bind(self.audit_retention_days)
        .bind(self.is_active)
        .bind(self.id)
        .fetch_one(db)
        .await?;

        Ok(tenant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retention_floor_is_90_days() {
        let mut tenant = Tenant::new("acme");
        tenant.audit_retention_days = 7;
        assert_eq!(tenant.retention_days(), 90);

        tenant.audit_retention_days = 365;
        assert_eq!(tenant.retention_days(), 365);
    }
}
