//! WebhookEvent model: immutable record of an inbound platform callback.
//!
//! `(store_id, external_id, event_type)` is the replay-dedup key; the unique
//! index makes dedup hold across any number of intake replicas.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "webhook_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WebhookStatus {
    #[default]
    Received,
    Processing,
    Processed,
    Failed,
}

#[derive(FromRow, Debug, Clone, Serialize)]
pub struct WebhookEvent {
    pub id: Uuid,
    pub store_id: Uuid,
    pub external_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub signature: Option<String>,
    pub status: WebhookStatus,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

const EVENT_COLUMNS: &str = "id, store_id, external_id, event_type, payload, signature, \
                             status, received_at, processed_at, error";

impl WebhookEvent {
    pub fn new(
        store_id: Uuid,
        external_id: &str,
        event_type: &str,
        payload: serde_json::Value,
        signature: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            store_id,
            external_id: external_id.to_string(),
            event_type: event_type.to_string(),
            payload,
            signature,
            status: WebhookStatus::Received,
            received_at: Utc::now(),
            processed_at: None,
            error: None,
        }
    }

    pub async fn find_existing(
        store_id: Uuid,
        external_id: &str,
        event_type: &str,
        db: &PgPool,
    ) -> Result<Option<Self>> {
        let event = sqlx::query_as::<_, Self>(&format!(
            r#"
            SELECT {EVENT_COLUMNS}
            FROM webhook_events
            WHERE store_id = $1 AND external_id = $2 AND event_type = $3
            "#,
        ))
        .bind(store_id)
        .bind(external_id)
        .bind(event_type)
        .fetch_optional(db)
        .await?;

        Ok(event)
    }

    /// Insert, or yield `None` when the replay key already exists (a
    /// concurrent replica won the race).
    pub async fn insert_if_new(&self, db: &PgPool) -> Result<Option<Self>> {
        let inserted = sqlx::query_as::<_, Self>(&format!(
            r#"
            INSERT INTO webhook_events (
                id, store_id, external_id, event_type, payload, signature,
                status, received_at, processed_at, error
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (store_id, external_id, event_type) DO NOTHING
            RETURNING {EVENT_COLUMNS}
            "#,
        ))
        .bind(self.id)
        .bind(self.store_id)
        .bind(&self.external_id)
        .bind(&self.event_type)
        .bind(&self.payload)
        .bind(&self.signature)
        .bind(self.status)
        .bind(self.received_at)
        .bind(self.processed_at)
        .bind(&self.error)
        .fetch_optional(db)
        .await?;

        Ok(inserted)
    }

    pub async fn mark_processing(id: Uuid, db: &PgPool) -> Result<()> {
        sqlx::query(
            "UPDATE webhook_events SET status = 'processing' WHERE id = $1 AND status = 'received'",
        )
        .bind(id)
        .execute(db)
        .await?;

        Ok(())
    }

    pub async fn mark_processed(id: Uuid, db: &PgPool) -> Result<()> {
        sqlx::query(
            "UPDATE webhook_events SET status = 'processed', processed_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .execute(db)
        .await?;

        Ok(())
    }

    pub async fn mark_failed(id: Uuid, error: &str, db: &PgPool) -> Result<()> {
        sqlx::query("UPDATE webhook_events SET status = 'failed', error = $2 WHERE id = $1")
            .bind(id)
            .bind(error)
            .execute(db)
            .await?;

        Ok(())
    }
}
