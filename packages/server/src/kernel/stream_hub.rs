//! In-process change-notification hub.
//!
//! One coalesced broadcast channel per tenant: every job, approval, budget,
//! and reconciliation transition publishes a small JSON event, and the SSE
//! endpoint forwards them so the UI re-fetches instead of polling per table.
//!
//! Producers:
//!   hub.publish(tenant_id, ChangeEvent::new("job_completed", "job", job_id)).await;
//!
//! Consumers (SSE endpoint):
//!   let rx = hub.subscribe(tenant_id).await;

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

/// A coalesced change notification. Carries enough to re-fetch, never the
/// full row.
#[derive(Debug, Clone, Serialize)]
pub struct ChangeEvent {
    /// What happened, e.g. `job_completed`, `approval_decided`.
    #[serde(rename = "type")]
    pub kind: String,
    pub resource_type: String,
    pub resource_id: String,
}

impl ChangeEvent {
    pub fn new(kind: &str, resource_type: &str, resource_id: impl ToString) -> Self {
        Self {
            kind: kind.to_string(),
            resource_type: resource_type.to_string(),
            resource_id: resource_id.to_string(),
        }
    }
}

/// Tenant-keyed broadcast hub. Thread-safe, cloneable.
#[derive(Clone)]
pub struct StreamHub {
    channels: Arc<RwLock<HashMap<Uuid, broadcast::Sender<ChangeEvent>>>>,
    capacity: usize,
}

impl StreamHub {
    /// Create a new StreamHub with default capacity (256 events per tenant).
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            capacity,
        }
    }

    /// Publish a change event to a tenant's channel. No-op if no subscribers.
    pub async fn publish(&self, tenant_id: Uuid, event: ChangeEvent) {
        let channels = self.channels.read().await;
        if let Some(tx) = channels.get(&tenant_id) {
            // Ignore send errors (no active receivers)
            let _ = tx.send(event);
        }
    }

    /// Subscribe to a tenant's channel. Creates the channel if absent.
    pub async fn subscribe(&self, tenant_id: Uuid) -> broadcast::Receiver<ChangeEvent> {
        let mut channels = self.channels.write().await;
        let tx = channels
            .entry(tenant_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        tx.subscribe()
    }

    /// Remove channels with zero subscribers (housekeeping).
    pub async fn cleanup(&self) {
        let mut channels = self.channels.write().await;
        channels.retain(|_, tx| tx.receiver_count() > 0);
    }
}

impl Default for StreamHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_subscribe_roundtrip() {
        let hub = StreamHub::new();
        let tenant = Uuid::new_v4();
        let mut rx = hub.subscribe(tenant).await;

        hub.publish(tenant, ChangeEvent::new("job_completed", "job", "j1"))
            .await;

        let received = rx.recv().await.unwrap();
        assert_eq!(received.kind, "job_completed");
        assert_eq!(received.resource_id, "j1");
    }

    #[tokio::test]
    async fn tenants_are_isolated() {
        let hub = StreamHub::new();
        let tenant_a = Uuid::new_v4();
        let tenant_b = Uuid::new_v4();
        let mut rx_a = hub.subscribe(tenant_a).await;
        let _rx_b = hub.subscribe(tenant_b).await;

        hub.publish(tenant_b, ChangeEvent::new("budget_frozen", "budget", "b1"))
            .await;

        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_noop() {
        let hub = StreamHub::new();
        hub.publish(
            Uuid::new_v4(),
            ChangeEvent::new("approval_decided", "approval", "a1"),
        )
        .await;
    }

    #[tokio::test]
    async fn cleanup_removes_empty_channels() {
        let hub = StreamHub::new();
        let tenant = Uuid::new_v4();
        let rx = hub.subscribe(tenant).await;

        assert_eq!(hub.channels.read().await.len(), 1);

        drop(rx);
        hub.cleanup().await;

        assert_eq!(hub.channels.read().await.len(), 0);
    }
}
