//! Listing model: the local representation of a product as published to a
//! specific store. Reconciliation compares these against remote resources.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::common::sql::Record;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "listing_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ListingStatus {
    #[default]
    Draft,
    Publishing,
    Published,
    Errored,
}

impl ListingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListingStatus::Draft => "draft",
            ListingStatus::Publishing => "publishing",
            ListingStatus::Published => "published",
            ListingStatus::Errored => "errored",
        }
    }
}

#[derive(FromRow, Debug, Clone, Serialize)]
pub struct Listing {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub store_id: Uuid,
    pub external_id: Option<String>,
    pub title: String,
    pub status: ListingStatus,
    pub quantity: i32,
    pub price: Decimal,
    pub updated_at: DateTime<Utc>,
}

const LISTING_COLUMNS: &str =
    "id, tenant_id, store_id, external_id, title, status, quantity, price, updated_at";

impl Listing {
    pub async fn find_by_store(store_id: Uuid, db: &PgPool) -> Result<Vec<Self>> {
        let listings = sqlx::query_as::<_, Self>(&format!(
            "SELECT {LISTING_COLUMNS} FROM listings WHERE store_id = $1 ORDER BY updated_at DESC",
        ))
        .bind(store_id)
        .fetch_all(db)
        .await?;

        Ok(listings)
    }

    pub async fn find_by_external_id(
        store_id: Uuid,
        external_id: &str,
        db: &PgPool,
    ) -> Result<Option<Self>> {
        let listing = sqlx::query_as::<_, Self>(&format!(
            "SELECT {LISTING_COLUMNS} FROM listings WHERE store_id = $1 AND external_id = $2",
        ))
        .bind(store_id)
        .bind(external_id)
        .fetch_optional(db)
        .await?;

        Ok(listing)
    }

    /// Check-and-set the listing status; returns false when the listing is no
    /// longer in `from` (a concurrent writer got there first).
    pub async fn transition_status(
        id: Uuid,
        from: ListingStatus,
        to: ListingStatus,
        db: &PgPool,
    ) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE listings SET status = $1, updated_at = NOW() WHERE id = $2 AND status = $3",
        )
        .bind(to)
        .bind(id)
        .bind(from)
        .execute(db)
        .await?
        .rows_affected();

        Ok(updated == 1)
    }

    /// Record the remote identity after a successful publish.
    pub async fn set_external_id(id: Uuid, external_id: &str, db: &PgPool) -> Result<()> {
        sqlx::query(
            "UPDATE listings SET external_id = $1, updated_at = NOW() WHERE id = $2",
        )
        .bind(external_id)
        .bind(id)
        .execute(db)
        .await?;

        Ok(())
    }

    pub async fn set_quantity(id: Uuid, quantity: i32, db: &PgPool) -> Result<()> {
        sqlx::query("UPDATE listings SET quantity = $1, updated_at = NOW() WHERE id = $2")
            .bind(quantity)
            .bind(id)
            .execute(db)
            .await?;

        Ok(())
    }
}

#[async_trait::async_trait]
impl Record for Listing {
    const TABLE: &'static str = "listings";
    type Id = Uuid;

    async fn find_by_id(id: Uuid, db: &PgPool) -> Result<Self> {
        let listing = sqlx::query_as::<_, Self>(&format!(
            "SELECT {LISTING_COLUMNS} FROM listings WHERE id = $1",
        ))
        .bind(id)
        .fetch_one(db)
        .await?;

        Ok(listing)
    }

    async fn insert(&self, db: &PgPool) -> Result<Self> {
        let listing = sqlx::query_as::<_, Self>(&format!(
            r#"
            INSERT INTO listings (
                id, tenant_id, store_id, external_id, title, status, quantity, price, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {LISTING_COLUMNS}
            "#,
        ))
        .bind(self.id)
        .bind(self.tenant_id)
        .bind(self.store_id)
        .bind(&self.external_id)
        .bind(&self.title)
        .bind(self.status)
        .bind(self.quantity)
        .bind(self.price)
        .bind(self.updated_at)
        .fetch_one(db)
        .await?;

        Ok(listing)
    }

    async fn update(&self, db: &PgPool) -> Result<Self> {
        let listing = sqlx::query_as::<_, Self>(&format!(
            r#"
            UPDATE listings
            SET external_id = $1, title = $2, status = $3, quantity = $4, price = $5,
                updated_at = NOW()
            WHERE id = $6
            RETURNING {LISTING_COLUMNS}
            "#,
        ))
        .bind(&self.external_id)
        .bind(&self.title)
        .bind(self.status)
        .bind(self.quantity)
        .bind(self.price)
        .bind(self.id)
        .fetch_one(db)
        .await?;

        Ok(listing)
    }
}
