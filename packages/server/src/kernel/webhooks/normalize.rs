//! Platform event normalization.
//!
//! Each platform names events its own way (`orders/create`,
//! `order:created`, `ORDER_CHANGE`); downstream jobs see one uniform shape.
//! The normalizer is total: an unknown topic degrades to
//! `resource_type = "unknown", action = "update"` instead of failing.

use serde::{Deserialize, Serialize};

use crate::domains::stores::Platform;
use crate::kernel::error::OrchestratorError;

/// The uniform internal event produced from any platform callback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedEvent {
    pub event_type: String,
    pub resource_type: String,
    pub resource_id: String,
    pub action: String,
    pub data: serde_json::Value,
}

/// Pull the replay-dedup identity out of a platform payload.
///
/// `topic_hint` carries the event name when the platform sends it as a
/// header (Shopify's `X-Shopify-Topic`) rather than in the body.
pub fn extract_identity(
    platform: Platform,
    topic_hint: Option<&str>,
    payload: &serde_json::Value,
) -> Result<(String, String), OrchestratorError> {
    let event_type = topic_hint
        .map(str::to_string)
        .or_else(|| string_at(payload, &["topic"]))
        .or_else(|| string_at(payload, &["type"]))
        .or_else(|| string_at(payload, &["event_type"]))
        .or_else(|| string_at(payload, &["notificationType"]))
        .ok_or_else(|| {
            OrchestratorError::Invalid(format!(
                "{} webhook carries no event type",
                platform.as_str()
            ))
        })?;

    let external_id = match platform {
        Platform::Shopify | Platform::Printify => string_at(payload, &["id"]),
        Platform::Etsy => string_at(payload, &["event_id"]).or_else(|| string_at(payload, &["id"])),
        Platform::Gumroad => {
            string_at(payload, &["sale_id"]).or_else(|| string_at(payload, &["id"]))
        }
        Platform::AmazonSpApi | Platform::AmazonKdp => {
            string_at(payload, &["notificationId"]).or_else(|| string_at(payload, &["id"]))
        }
    }
    .ok_or_else(|| {
        OrchestratorError::Invalid(format!(
            "{} webhook carries no external id",
            platform.as_str()
        ))
    })?;

    Ok((external_id, event_type))
}

/// Map a platform event into the uniform shape. Total by construction.
pub fn normalize(
    event_type: &str,
    external_id: &str,
    payload: &serde_json::Value,
) -> NormalizedEvent {
    let (resource_type, action) = classify_topic(event_type);

    NormalizedEvent {
        event_type: event_type.to_string(),
        resource_type: resource_type.to_string(),
        resource_id: resource_id_for(resource_type, external_id, payload),
        action: action.to_string(),
        data: payload.clone(),
    }
}

/// Split an event name on its platform separator and bucket both halves.
fn classify_topic(event_type: &str) -> (&'static str, &'static str) {
    let lowered = event_type.to_lowercase();
    let mut parts = lowered.split(|c| c == '/' || c == ':' || c == '.' || c == '_');
    let subject = parts.next().unwrap_or("");
    let verb = parts.next().unwrap_or("");

    let resource_type = match subject {
        "order" | "orders" | "sale" => "order",
        "product" | "products" | "listing" | "listings" | "item" => "product",
        "inventory" | "inventorylevel" | "inventory_levels" | "stock" => "inventory",
        "fulfillment" | "fulfillments" | "shipment" => "fulfillment",
        _ => "unknown",
    };

    let action = match verb {
        "create" | "created" => "create",
        "update" | "updated" | "edited" | "paid" => "update",
        "delete" | "deleted" | "cancelled" | "canceled" => "delete",
        _ => "update",
    };

    (resource_type, action)
}

/// Prefer the resource's own id over the event envelope id when the payload
/// nests it (Printify-style `resource.id`).
fn resource_id_for(
    resource_type: &str,
    external_id: &str,
    payload: &serde_json::Value,
) -> String {
    if resource_type != "unknown" {
        if let Some(nested) = string_at(payload, &["resource", "id"]) {
            return nested;
        }
    }
    external_id.to_string()
}

/// A string or number at a JSON path, stringified.
fn string_at(value: &serde_json::Value, path: &[&str]) -> Option<String> {
    let mut current = value;
    for key in path {
        current = current.get(key)?;
    }
    match current {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shopify_order_create_normalizes() {
        let payload = serde_json::json!({"id": 820982911946154500u64, "total_price": "10.00"});
        let (external_id, event_type) =
            extract_identity(Platform::Shopify, Some("orders/create"), &payload).unwrap();
        assert_eq!(external_id, "820982911946154500");
        assert_eq!(event_type, "orders/create");

        let event = normalize(&event_type, &external_id, &payload);
        assert_eq!(event.resource_type, "order");
        assert_eq!(event.action, "create");
        assert_eq!(event.resource_id, "820982911946154500");
    }

    #[test]
    fn printify_nested_resource_id_wins() {
        let payload = serde_json::json!({
            "id": "evt_1",
            "type": "product:publish:started",
            "resource": {"id": "prod_9", "type": "product"}
        });
        let (external_id, event_type) =
            extract_identity(Platform::Printify, None, &payload).unwrap();
        assert_eq!(external_id, "evt_1");

        let event = normalize(&event_type, &external_id, &payload);
        assert_eq!(event.resource_type, "product");
        assert_eq!(event.resource_id, "prod_9");
    }

    #[test]
    fn unknown_topics_degrade_instead_of_failing() {
        let event = normalize("carrier/ping", "x1", &serde_json::json!({}));
        assert_eq!(event.resource_type, "unknown");
        assert_eq!(event.action, "update");
        assert_eq!(event.resource_id, "x1");
    }

    #[test]
    fn deleted_and_cancelled_map_to_delete() {
        assert_eq!(classify_topic("products/delete").1, "delete");
        assert_eq!(classify_topic("orders/cancelled").1, "delete");
    }

    #[test]
    fn missing_identity_is_invalid() {
        let payload = serde_json::json!({"foo": "bar"});
        let err = extract_identity(Platform::Shopify, Some("orders/create"), &payload)
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Invalid(_)));

        let err = extract_identity(Platform::Printify, None, &serde_json::json!({"id": "e"}))
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Invalid(_)));
    }

    #[test]
    fn gumroad_sale_id_is_the_identity() {
        let payload = serde_json::json!({"sale_id": "G123", "resource_name": "sale"});
        let (external_id, _) =
            extract_identity(Platform::Gumroad, Some("sale"), &payload).unwrap();
        assert_eq!(external_id, "G123");
    }
}
