//! Token buckets for per-store rate limiting.
//!
//! The full bucket set for a store is serialized as JSON into the store row
//! and rewritten under optimistic concurrency; no bucket state lives in
//! process memory between calls.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A single named bucket. `tokens` stays within `[0, capacity]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenBucket {
    pub tokens: f64,
    pub capacity: f64,
    pub refill_rate_per_second: f64,
    pub last_refill: DateTime<Utc>,
}

impl TokenBucket {
    /// A bucket starting full.
    pub fn full(capacity: f64, refill_rate_per_second: f64, now: DateTime<Utc>) -> Self {
        Self {
            tokens: capacity,
            capacity,
            refill_rate_per_second,
            last_refill: now,
        }
    }

    /// Refill for elapsed time, truncated to capacity. A zero-elapsed (or
    /// backwards) clock leaves the token count unchanged.
    pub fn refill(&mut self, now: DateTime<Utc>) {
        let elapsed_ms = (now - self.last_refill).num_milliseconds();
        if elapsed_ms > 0 {
            let elapsed = elapsed_ms as f64 / 1000.0;
            self.tokens =
                (self.tokens + elapsed * self.refill_rate_per_second).min(self.capacity);
            self.last_refill = now;
        }
    }

    pub fn available(&self) -> f64 {
        self.tokens
    }

    /// Seconds until `cost` tokens will be available, rounded up.
    pub fn seconds_until(&self, cost: f64) -> u64 {
        let deficit = (cost - self.tokens).max(0.0);
        (deficit / self.refill_rate_per_second).ceil() as u64
    }

    /// Refill, then consume `cost` tokens or report how long to wait. A cost
    /// above capacity can never succeed and reports the full-drain wait.
    pub fn try_consume(&mut self, cost: f64, now: DateTime<Utc>) -> Result<(), u64> {
        self.refill(now);
        if cost > self.capacity {
            return Err((self.capacity / self.refill_rate_per_second).ceil() as u64);
        }
        if self.tokens >= cost {
            self.tokens -= cost;
            Ok(())
        } else {
            Err(self.seconds_until(cost))
        }
    }

    /// Return tokens taken in the same critical section (secondary-bucket
    /// failure, or an actual cost below the estimate).
    pub fn refund(&mut self, amount: f64) {
        self.tokens = (self.tokens + amount).min(self.capacity);
    }

    /// Consume extra tokens discovered after the fact (actual cost above the
    /// estimate). Floors at zero rather than failing.
    pub fn drain(&mut self, amount: f64) {
        self.tokens = (self.tokens - amount).max(0.0);
    }

    /// Adopt an upstream `Retry-After`: empty the bucket and hold it empty
    /// until the given horizon (refill clamps negative elapsed to zero).
    pub fn sync_from_retry_after(&mut self, retry_after_seconds: u64, now: DateTime<Utc>) {
        self.tokens = 0.0;
        self.last_refill = now + Duration::seconds(retry_after_seconds as i64);
    }
}

/// The full named-bucket set for one store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitState {
    #[serde(default)]
    pub buckets: BTreeMap<String, TokenBucket>,
}

impl RateLimitState {
    pub fn from_value(value: &serde_json::Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({}))
    }

    pub fn bucket_mut(&mut self, name: &str) -> Option<&mut TokenBucket> {
        self.buckets.get_mut(name)
    }

    /// Consume `cost` from every named bucket, all-or-nothing. On a partial
    /// failure the already-consumed buckets are refunded before returning,
    /// so a response never reflects a half-consumed set.
    pub fn try_consume_all(
        &mut self,
        names: &[&str],
        cost: f64,
        now: DateTime<Utc>,
    ) -> Result<(), RateLimitHit> {
        let mut consumed: Vec<&str> = Vec::with_capacity(names.len());
        for name in names {
            let bucket = match self.buckets.get_mut(*name) {
                Some(b) => b,
                None => continue,
            };
            match bucket.try_consume(cost, now) {
                Ok(()) => consumed.push(name),
                Err(retry_after_seconds) => {
                    for earlier in consumed {
                        if let Some(b) = self.buckets.get_mut(earlier) {
                            b.refund(cost);
                        }
                    }
                    return Err(RateLimitHit {
                        limit_type: name.to_string(),
                        retry_after_seconds,
                    });
                }
            }
        }
        Ok(())
    }
}

/// Which bucket rejected the call and how long to wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitHit {
    pub limit_type: String,
    pub retry_after_seconds: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn zero_elapsed_refill_leaves_state_unchanged() {
        let now = at(0);
        let mut bucket = TokenBucket::full(100.0, 10.0, now);
        bucket.tokens = 40.0;
        bucket.refill(now);
        assert_eq!(bucket.tokens, 40.0);
        assert_eq!(bucket.last_refill, now);
    }

    #[test]
    fn refill_truncates_at_capacity() {
        let mut bucket = TokenBucket::full(100.0, 10.0, at(0));
        bucket.tokens = 95.0;
        bucket.refill(at(60));
        assert_eq!(bucket.tokens, 100.0);
    }

    #[test]
    fn consume_and_deficit_wait() {
        // Shopify-shaped bucket: 1000 capacity, 50/s restore.
        let mut bucket = TokenBucket::full(1000.0, 50.0, at(0));
        assert!(bucket.try_consume(600.0, at(0)).is_ok());
        assert_eq!(bucket.tokens, 400.0);

        // Needs 600, has 400: deficit 200 / 50 = 4s.
        assert_eq!(bucket.try_consume(600.0, at(0)), Err(4));
        assert_eq!(bucket.tokens, 400.0);
    }

    #[test]
    fn cost_above_capacity_is_rejected_with_full_drain_wait() {
        let mut bucket = TokenBucket::full(1000.0, 50.0, at(0));
        assert_eq!(bucket.try_consume(1500.0, at(0)), Err(20));
        assert_eq!(bucket.tokens, 1000.0);
    }

    #[test]
    fn retry_after_sync_holds_bucket_empty() {
        let mut bucket = TokenBucket::full(600.0, 10.0, at(0));
        bucket.sync_from_retry_after(30, at(0));
        bucket.refill(at(10));
        assert_eq!(bucket.tokens, 0.0);

        bucket.refill(at(40));
        assert!((bucket.tokens - 100.0).abs() < 1e-9);
    }

    #[test]
    fn secondary_failure_refunds_primary() {
        let now = at(0);
        let mut state = RateLimitState::default();
        state
            .buckets
            .insert("global".to_string(), TokenBucket::full(600.0, 10.0, now));
        let mut catalog = TokenBucket::full(100.0, 100.0 / 60.0, now);
        catalog.tokens = 0.0;
        state.buckets.insert("catalog".to_string(), catalog);

        let hit = state
            .try_consume_all(&["global", "catalog"], 1.0, now)
            .unwrap_err();

        assert_eq!(hit.limit_type, "catalog");
        assert_eq!(state.buckets["global"].tokens, 600.0);
        assert_eq!(state.buckets["catalog"].tokens, 0.0);
        assert_eq!(hit.retry_after_seconds, 1);
    }

    #[test]
    fn state_roundtrips_through_json() {
        let mut state = RateLimitState::default();
        state
            .buckets
            .insert("global".to_string(), TokenBucket::full(600.0, 10.0, at(0)));
        let restored = RateLimitState::from_value(&state.to_value());
        assert_eq!(restored.buckets["global"], state.buckets["global"]);
    }

    #[test]
    fn malformed_blob_degrades_to_empty_state() {
        let state = RateLimitState::from_value(&serde_json::json!("not a map"));
        assert!(state.buckets.is_empty());
    }
}
