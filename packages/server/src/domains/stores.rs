//! Store model: one configured connection to one external platform.
//!
//! Credentials are a sealed blob; unsealing is delegated to the credential
//! vault and the plaintext never touches logs. `rate_limit_state` is written
//! exclusively by the platform gateway under optimistic concurrency.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::common::sql::Record;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "platform_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Shopify,
    Etsy,
    Printify,
    AmazonSpApi,
    Gumroad,
    AmazonKdp,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Shopify => "shopify",
            Platform::Etsy => "etsy",
            Platform::Printify => "printify",
            Platform::AmazonSpApi => "amazon_sp_api",
            Platform::Gumroad => "gumroad",
            Platform::AmazonKdp => "amazon_kdp",
        }
    }

    /// Parse the `{platform}` path segment of the webhook intake URL.
    pub fn from_path_segment(segment: &str) -> Option<Self> {
        match segment {
            "shopify" => Some(Platform::Shopify),
            "etsy" => Some(Platform::Etsy),
            "printify" => Some(Platform::Printify),
            "amazon_sp_api" => Some(Platform::AmazonSpApi),
            "gumroad" => Some(Platform::Gumroad),
            "amazon_kdp" => Some(Platform::AmazonKdp),
            _ => None,
        }
    }
}

/// Opaque sealed credential blob. Debug output is redacted; only the vault
/// sees the contents.
#[derive(Clone, Serialize, Deserialize, sqlx::Type)]
#[sqlx(transparent)]
pub struct SealedCredentials(serde_json::Value);

impl SealedCredentials {
    pub fn new(blob: serde_json::Value) -> Self {
        Self(blob)
    }

    /// The raw blob, for the vault only.
    pub fn expose(&self) -> &serde_json::Value {
        &self.0
    }
}

impl std::fmt::Debug for SealedCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SealedCredentials(<redacted>)")
    }
}

#[derive(FromRow, Debug, Clone, Serialize)]
pub struct Store {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub platform: Platform,
    pub name: String,
    pub credentials: Option<SealedCredentials>,
    pub rate_limit_state: serde_json::Value,
    pub rate_limit_version: i64,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const STORE_COLUMNS: &str = "id, tenant_id, platform, name, credentials, rate_limit_state, \
                             rate_limit_version, last_synced_at, is_active, created_at, updated_at";

impl Store {
    pub fn new(tenant_id: Uuid, platform: Platform, name: &str) -> Self {
        Self {
            id: Uuid::now_v7(),
            tenant_id,
            platform,
            name: name.to_string(),
            credentials: None,
            rate_limit_state: serde_json::json!({}),
            rate_limit_version: 0,
            last_synced_at: None,
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    pub async fn find_active(tenant_id: Uuid, db: &PgPool) -> Result<Vec<Self>> {
        let stores = sqlx::query_as::<_, Self>(&format!(
            "SELECT {STORE_COLUMNS} FROM stores WHERE tenant_id = $1 AND is_active = TRUE ORDER BY created_at",
        ))
        .bind(tenant_id)
        .fetch_all(db)
        .await?;

        Ok(stores)
    }

    /// Deactivate a store (rejected credentials path). Idempotent.
    pub async fn deactivate(id: Uuid, db: &PgPool) -> Result<()> {
        sqlx::query("UPDATE stores SET is_active = FALSE, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(db)
            .await?;

        Ok(())
    }

    pub async fn mark_synced(id: Uuid, at: DateTime<Utc>, db: &PgPool) -> Result<()> {
        sqlx::query("UPDATE stores SET last_synced_at = $1, updated_at = NOW() WHERE id = $2")
            .bind(at)
            .bind(id)
            .execute(db)
            .await?;

        Ok(())
    }

    /// Read the rate-limit blob with its optimistic version.
    pub async fn load_rate_limit_state(
        id: Uuid,
        db: &PgPool,
    ) -> Result<(serde_json::Value, i64)> {
        let row: (serde_json::Value, i64) = sqlx::query_as(
            "SELECT rate_limit_state, rate_limit_version FROM stores WHERE id = $1",
        )
        .bind(id)
        .fetch_one(db)
        .await?;

        Ok(row)
    }

    /// Conditionally write the rate-limit blob. Returns false when another
    /// writer bumped the version first; the caller re-reads and retries.
    pub async fn store_rate_limit_state(
        id: Uuid,
        state: &serde_json::Value,
        expected_version: i64,
        db: &PgPool,
    ) -> Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE stores
            SET rate_limit_state = $1,
                rate_limit_version = rate_limit_version + 1,
                updated_at = NOW()
            WHERE id = $2 AND rate_limit_version = $3
            "#,
        )
        .bind(state)
        .bind(id)
        .bind(expected_version)
        .execute(db)
        .await?
        .rows_affected();

        Ok(updated == 1)
    }
}

#[async_trait::async_trait]
impl Record for Store {
    const TABLE: &'static str = "stores";
    type Id = Uuid;

    async fn find_by_id(id: Uuid, db: &PgPool) -> Result<Self> {
        let store = sqlx::query_as::<_, Self>(&format!(
            "SELECT {STORE_COLUMNS} FROM stores WHERE id = $1",
        ))
        .bind(id)
        .fetch_one(db)
        .await?;

        Ok(store)
    }

    async fn insert(&self, db: &PgPool) -> Result<Self> {
        let store = sqlx::query_as::<_, Self>(&format!(
            r#"
            INSERT INTO stores (
                id, tenant_id, platform, name, credentials, rate_limit_state,
                rate_limit_version, last_synced_at, is_active, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING {STORE_COLUMNS}
            "#,
        ))
        .bind(self.id)
        .bind(self.tenant_id)
        .bind(self.platform)
        .bind(&self.name)
        .bind(&self.credentials)
        .bind(&self.rate_limit_state)
        .bind(self.rate_limit_version)
        .bind(self.last_synced_at)
        .bind(self.is_active)
        .bind(self.created_at)
        .bind(self.updated_at)
        .fetch_one(db)
        .await?;

        Ok(store)
    }

    async fn update(&self, db: &PgPool) -> Result<Self> {
        let store = sqlx::query_as::<_, Self>(&format!(
            r#"
            UPDATE stores
            SET name = $1, credentials = $2, last_synced_at = $3, is_active = $4,
                updated_at = NOW()
            WHERE id = $5
            RETURNING {STORE_COLUMNS}
            "#,
        ))
        .bind(&self.name)
        .bind(&self.credentials)
        .bind(self.last_synced_at)
        .bind(self.is_active)
        .bind(self.id)
        .fetch_one(db)
        .await?;

        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_path_segments_roundtrip() {
        for platform in [
            Platform::Shopify,
            Platform::Etsy,
            Platform::Printify,
            Platform::AmazonSpApi,
            Platform::Gumroad,
            Platform::AmazonKdp,
        ] {
            assert_eq!(
                Platform::from_path_segment(platform.as_str()),
                Some(platform)
            );
        }
        assert_eq!(Platform::from_path_segment("ebay"), None);
    }

    #[test]
    fn sealed_credentials_debug_is_redacted() {
        let sealed = SealedCredentials::new(serde_json::json!({
            "access_token": "shpat_secret",
            "webhook_secret": "whsec_secret",
        }));
        let debug = format!("{:?}", sealed);
        assert!(!debug.contains("secret"));
        assert!(debug.contains("redacted"));
    }
}
