//! Webhook ingestion pipeline.
//!
//! Stateless intake: any number of replicas may accept callbacks; replay
//! dedup is enforced by the unique key on
//! `(store_id, external_id, event_type)` at the persistence layer.
//!
//! # Pipeline
//!
//! ```text
//! POST /webhooks/{platform}/{store_id}
//!     │
//!     ├─► Load store, resolve webhook secret (vault)
//!     ├─► Verify HMAC-SHA256 over the raw body (constant time)
//!     ├─► Extract (external_id, event_type); replay check
//!     ├─► Insert WebhookEvent (received → processing)
//!     ├─► Enqueue webhook_<platform> job with the normalized event
//!     └─► WebhookEvent → processed; 200 {status, webhook_id}
//! ```

pub mod event;
pub mod normalize;
pub mod signature;

use std::sync::Arc;

use axum::http::HeaderMap;
use bytes::Bytes;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::common::sql::Record;
use crate::domains::stores::{Platform, Store};
use crate::kernel::audit::{self, AuditEntry, AuditTag};
use crate::kernel::jobs::NewJob;
use crate::kernel::stream_hub::ChangeEvent;
use crate::kernel::ServerDeps;
use event::WebhookEvent;

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("unknown store")]
    UnknownStore,
    #[error("signature verification failed")]
    SignatureInvalid,
    #[error("processing failed: {0}")]
    Processing(String),
}

/// What the intake tells the platform.
#[derive(Debug)]
pub enum IngestOutcome {
    Accepted { webhook_id: Uuid, job_id: Uuid },
    /// The event was already recorded; acknowledged without side effects.
    Replay { webhook_id: Uuid },
}

impl IngestOutcome {
    pub fn webhook_id(&self) -> Uuid {
        match self {
            IngestOutcome::Accepted { webhook_id, .. }
            | IngestOutcome::Replay { webhook_id } => *webhook_id,
        }
    }
}

/// Run the full intake pipeline for one callback. The raw body must be the
/// verbatim bytes the platform signed.
pub async fn ingest(
    deps: &Arc<ServerDeps>,
    platform: Platform,
    store_id: Uuid,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<IngestOutcome, IngestError> {
    let db = &deps.db_pool;

    let store = Store::find_by_id(store_id, db)
        .await
        .map_err(|_| IngestError::UnknownStore)?;
    if store.platform != platform {
        return Err(IngestError::UnknownStore);
    }

    // Resolve the signing secret; a store without one skips verification,
    // and that skip is recorded.
    let secret = match &store.credentials {
        Some(sealed) => deps
            .vault
            .unseal(sealed)
            .await
            .ok()
            .and_then(|c| c.webhook_secret),
        None => None,
    };

    let (header_name, encoding) = signature::signature_header(platform);
    let header_value = headers
        .get(header_name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    match (&secret, &header_value) {
        (Some(secret), Some(provided))
            if signature::verify(secret, &body, provided, encoding) =>
        {
            debug!(store_id = %store.id, "webhook signature verified");
        }
        (Some(_), _) => {
            warn!(store_id = %store.id, platform = %platform.as_str(), "webhook signature rejected");
            audit::record(
                db,
                AuditEntry::builder()
                    .tenant_id(store.tenant_id)
                    .action("signature_verification_failed")
                    .resource_type("store")
                    .resource_id(store.id.to_string())
                    .metadata(serde_json::json!({ "platform": platform.as_str() }))
                    .tags(vec![
                        AuditTag::Security.as_str().to_string(),
                        AuditTag::Webhook.as_str().to_string(),
                    ])
                    .build(),
            )
            .await;
            return Err(IngestError::SignatureInvalid);
        }
        (None, _) => {
            audit::record(
                db,
                AuditEntry::builder()
                    .tenant_id(store.tenant_id)
                    .action("signature_verification_skipped")
                    .resource_type("store")
                    .resource_id(store.id.to_string())
                    .metadata(serde_json::json!({ "reason": "no webhook secret configured" }))
                    .tags(vec![
                        AuditTag::Security.as_str().to_string(),
                        AuditTag::Webhook.as_str().to_string(),
                    ])
                    .build(),
            )
            .await;
        }
    }

    let payload = parse_body(&body)
        .ok_or_else(|| IngestError::Processing("unparseable webhook body".to_string()))?;

    let topic_hint = headers
        .get("x-shopify-topic")
        .and_then(|v| v.to_str().ok());
    let (external_id, event_type) =
        normalize::extract_identity(platform, topic_hint, &payload)
            .map_err(|e| IngestError::Processing(e.to_string()))?;

    // Replay check before insert keeps the common duplicate path cheap; the
    // unique index still backstops concurrent replicas.
    if let Some(existing) =
        WebhookEvent::find_existing(store_id, &external_id, &event_type, db)
            .await
            .map_err(|e| IngestError::Processing(e.to_string()))?
    {
        record_replay(deps, &store, &existing).await;
        return Ok(IngestOutcome::Replay {
            webhook_id: existing.id,
        });
    }

    let event = WebhookEvent::new(
        store_id,
        &external_id,
        &event_type,
        payload.clone(),
        header_value,
    );
    let inserted = event
        .insert_if_new(db)
        .await
        .map_err(|e| IngestError::Processing(e.to_string()))?;
    let Some(inserted) = inserted else {
        // Lost the race to a concurrent replica.
        let existing = WebhookEvent::find_existing(store_id, &external_id, &event_type, db)
            .await
            .map_err(|e| IngestError::Processing(e.to_string()))?
            .ok_or_else(|| IngestError::Processing("replay row vanished".to_string()))?;
        record_replay(deps, &store, &existing).await;
        return Ok(IngestOutcome::Replay {
            webhook_id: existing.id,
        });
    };

    WebhookEvent::mark_processing(inserted.id, db)
        .await
        .map_err(|e| IngestError::Processing(e.to_string()))?;

    let normalized = normalize::normalize(&event_type, &external_id, &payload);
    let job_type = format!("webhook_{}", platform.as_str());
    let new_job = NewJob::builder()
        .tenant_id(store.tenant_id)
        .store_id(store.id)
        .job_type(job_type.clone())
        .payload(
            serde_json::to_value(&normalized)
                .map_err(|e| IngestError::Processing(e.to_string()))?,
        )
        .priority(10i16)
        .idempotency_key(format!(
            "webhook_{}_{}_{}_{}",
            platform.as_str(),
            store.id,
            external_id,
            event_type
        ))
        .build();

    let enqueued = match deps.job_queue.enqueue(new_job).await {
        Ok(result) => result,
        Err(e) => {
            let _ = WebhookEvent::mark_failed(inserted.id, &e.to_string(), db).await;
            return Err(IngestError::Processing(e.to_string()));
        }
    };

    WebhookEvent::mark_processed(inserted.id, db)
        .await
        .map_err(|e| IngestError::Processing(e.to_string()))?;

    audit::record(
        db,
        AuditEntry::builder()
            .tenant_id(store.tenant_id)
            .action("webhook_received")
            .resource_type("webhook_event")
            .resource_id(inserted.id.to_string())
            .metadata(serde_json::json!({
                "platform": platform.as_str(),
                "event_type": event_type,
                "job_id": enqueued.job_id(),
            }))
            .tags(vec![AuditTag::Webhook.as_str().to_string()])
            .build(),
    )
    .await;

    deps.stream_hub
        .publish(
            store.tenant_id,
            ChangeEvent::new("webhook_received", "webhook_event", inserted.id),
        )
        .await;

    Ok(IngestOutcome::Accepted {
        webhook_id: inserted.id,
        job_id: enqueued.job_id(),
    })
}

async fn record_replay(deps: &Arc<ServerDeps>, store: &Store, existing: &WebhookEvent) {
    debug!(
        store_id = %store.id,
        external_id = %existing.external_id,
        event_type = %existing.event_type,
        "webhook replay detected"
    );
    audit::record(
        &deps.db_pool,
        AuditEntry::builder()
            .tenant_id(store.tenant_id)
            .action("replay_detected")
            .resource_type("webhook_event")
            .resource_id(existing.id.to_string())
            .metadata(serde_json::json!({
                "external_id": existing.external_id,
                "event_type": existing.event_type,
            }))
            .tags(vec![
                AuditTag::Webhook.as_str().to_string(),
                AuditTag::DataIntegrity.as_str().to_string(),
            ])
            .build(),
    )
    .await;
}

/// Raw JSON first, form-urlencoded as the fallback some platforms use.
fn parse_body(body: &Bytes) -> Option<serde_json::Value> {
    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) {
        return Some(value);
    }

    let text = std::str::from_utf8(body).ok()?;
    let mut map = serde_json::Map::new();
    for pair in text.split('&') {
        let (key, value) = pair.split_once('=')?;
        let key = urlencoding::decode(key).ok()?;
        let value_plus_decoded = value.replace('+', " ");
        let value = urlencoding::decode(&value_plus_decoded).ok()?;
        map.insert(
            key.into_owned(),
            serde_json::Value::String(value.into_owned()),
        );
    }
    if map.is_empty() {
        None
    } else {
        Some(serde_json::Value::Object(map))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_bodies_parse_directly() {
        let body = Bytes::from_static(br#"{"id": 1, "topic": "orders/create"}"#);
        let value = parse_body(&body).unwrap();
        assert_eq!(value["topic"], "orders/create");
    }

    #[test]
    fn form_bodies_fall_back_to_urlencoded() {
        let body = Bytes::from_static(b"sale_id=G123&product_name=Test+Product&price=9.99");
        let value = parse_body(&body).unwrap();
        assert_eq!(value["sale_id"], "G123");
        assert_eq!(value["product_name"], "Test Product");
    }

    #[test]
    fn garbage_bodies_are_rejected() {
        assert!(parse_body(&Bytes::from_static(b"\xff\xfe not text")).is_none());
    }
}
