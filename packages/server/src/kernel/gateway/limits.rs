//! Per-platform bucket taxonomy.
//!
//! Capacities and refill rates follow the platforms' published limits. A
//! request consumes every bucket named for its path; the state layer refunds
//! partial consumption when a secondary bucket rejects.

use chrono::{DateTime, Utc};

use super::bucket::{RateLimitState, TokenBucket};
use crate::domains::stores::Platform;

/// Static description of one named bucket.
#[derive(Debug, Clone, Copy)]
pub struct BucketSpec {
    pub name: &'static str,
    pub capacity: f64,
    pub refill_rate_per_second: f64,
}

/// All buckets a platform maintains per store.
pub fn bucket_specs(platform: Platform) -> &'static [BucketSpec] {
    match platform {
        // 600 req/min global, 100 req/min on catalog paths.
        Platform::Printify => &[
            BucketSpec {
                name: "global",
                capacity: 600.0,
                refill_rate_per_second: 10.0,
            },
            BucketSpec {
                name: "catalog",
                capacity: 100.0,
                refill_rate_per_second: 100.0 / 60.0,
            },
        ],
        // Single cost-based bucket: 1000 points, 50/s restore.
        Platform::Shopify => &[BucketSpec {
            name: "cost",
            capacity: 1000.0,
            refill_rate_per_second: 50.0,
        }],
        // 10 req/s steady state.
        Platform::Etsy => &[BucketSpec {
            name: "global",
            capacity: 10.0,
            refill_rate_per_second: 10.0,
        }],
        Platform::Gumroad => &[BucketSpec {
            name: "global",
            capacity: 120.0,
            refill_rate_per_second: 2.0,
        }],
        // SP-API default tier: burst 6, 2/s sustained.
        Platform::AmazonSpApi => &[BucketSpec {
            name: "global",
            capacity: 6.0,
            refill_rate_per_second: 2.0,
        }],
        Platform::AmazonKdp => &[BucketSpec {
            name: "global",
            capacity: 60.0,
            refill_rate_per_second: 1.0,
        }],
    }
}

/// The buckets a specific request consumes, primary first.
pub fn buckets_for_request(platform: Platform, path: &str) -> Vec<&'static str> {
    match platform {
        Platform::Printify if path.contains("/catalog") => vec!["global", "catalog"],
        Platform::Printify => vec!["global"],
        Platform::Shopify => vec!["cost"],
        _ => vec!["global"],
    }
}

/// The bucket whose headroom decides the `throttled` signal.
pub fn primary_bucket(platform: Platform) -> &'static str {
    match platform {
        Platform::Shopify => "cost",
        _ => "global",
    }
}

/// Shopify prices calls by query cost; everything else is one token per call.
pub fn is_cost_based(platform: Platform) -> bool {
    matches!(platform, Platform::Shopify)
}

/// Add any buckets the stored state is missing, starting full. Covers both
/// brand-new stores and taxonomy additions.
pub fn ensure_buckets(state: &mut RateLimitState, platform: Platform, now: DateTime<Utc>) {
    for spec in bucket_specs(platform) {
        state
            .buckets
            .entry(spec.name.to_string())
            .or_insert_with(|| TokenBucket::full(spec.capacity, spec.refill_rate_per_second, now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn printify_catalog_paths_consume_both_buckets() {
        let buckets = buckets_for_request(Platform::Printify, "/v1/catalog/blueprints.json");
        assert_eq!(buckets, vec!["global", "catalog"]);

        let buckets = buckets_for_request(Platform::Printify, "/v1/shops/1/orders.json");
        assert_eq!(buckets, vec!["global"]);
    }

    #[test]
    fn shopify_uses_a_single_cost_bucket() {
        assert_eq!(buckets_for_request(Platform::Shopify, "/graphql.json"), vec!["cost"]);
        assert!(is_cost_based(Platform::Shopify));
        assert!(!is_cost_based(Platform::Etsy));
    }

    #[test]
    fn ensure_buckets_fills_missing_without_touching_existing() {
        let now = Utc::now();
        let mut state = RateLimitState::default();
        ensure_buckets(&mut state, Platform::Printify, now);
        assert_eq!(state.buckets.len(), 2);

        state.bucket_mut("global").unwrap().tokens = 5.0;
        ensure_buckets(&mut state, Platform::Printify, now);
        assert_eq!(state.buckets["global"].tokens, 5.0);
    }
}
