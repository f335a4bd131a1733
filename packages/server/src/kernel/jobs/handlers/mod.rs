//! Built-in job handlers.
//!
//! The engine is type-agnostic; these are the handlers the orchestration
//! plane ships. Each declares its own payload schema and validates it on
//! entry; an unparseable payload fails permanently, not retryably.

pub mod budget_check;
pub mod inventory_sync;
pub mod listing_publish;
pub mod product_sync;
pub mod reconciliation;
pub mod webhook;

use super::registry::JobRegistry;

/// Build the full registry of built-in handlers. Called once at startup;
/// the registry is never mutated afterwards.
pub fn build_registry() -> JobRegistry {
    let mut registry = JobRegistry::new();

    registry.register("product_sync", product_sync::handle);
    registry.register("listing_publish", listing_publish::handle);
    registry.register("inventory_sync", inventory_sync::handle);
    registry.register("reconciliation", reconciliation::handle);
    registry.register("budget_check", budget_check::handle);

    // One normalized handler behind every platform's webhook job type.
    registry.register("webhook_shopify", webhook::handle);
    registry.register("webhook_etsy", webhook::handle);
    registry.register("webhook_printify", webhook::handle);
    registry.register("webhook_amazon_sp_api", webhook::handle);
    registry.register("webhook_gumroad", webhook::handle);
    registry.register("webhook_amazon_kdp", webhook::handle);

    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_builtin_types_are_registered() {
        let registry = build_registry();
        for job_type in [
            "product_sync",
            "listing_publish",
            "inventory_sync",
            "reconciliation",
            "budget_check",
            "webhook_shopify",
            "webhook_etsy",
            "webhook_printify",
            "webhook_amazon_sp_api",
            "webhook_gumroad",
            "webhook_amazon_kdp",
        ] {
            assert!(registry.is_registered(job_type), "{job_type} missing");
        }
        assert!(!registry.is_registered("csv_import"));
    }
}
