//! Platform gateway: every outbound platform call goes through here.
//!
//! The gateway wraps the HTTP client with per-store token-bucket limiting,
//! cost accounting, and request shaping. It never sleeps to wait out a rate
//! limit; it reports `RateLimited { retry_after }` and lets the caller
//! reschedule.
//!
//! # Architecture
//!
//! ```text
//! PlatformGateway::call(store_id, req)
//!     │
//!     ├─► Load store + unseal credentials (vault)
//!     ├─► Slim + estimate GraphQL cost (cost.rs)
//!     ├─► Reserve tokens (bucket.rs, optimistic CAS on the store row)
//!     ├─► HTTP call (reqwest, 30s timeout)
//!     ├─► Reconcile actual cost / upstream Retry-After
//!     └─► Audit api_call / external_rate_limit
//! ```

pub mod bucket;
pub mod cost;
pub mod limits;

use std::sync::Arc;

use chrono::Utc;
use reqwest::Method;
use sqlx::PgPool;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::common::sql::Record;
use crate::domains::stores::{Platform, Store};
use crate::kernel::audit::{self, AuditEntry, AuditTag};
use crate::kernel::error::OrchestratorError;
use crate::kernel::vault::CredentialVault;
use bucket::RateLimitState;

pub use bucket::TokenBucket;

/// Bounded retries for the optimistic read-modify-write on bucket state.
const STATE_WRITE_ATTEMPTS: usize = 5;

/// Callers are told to slow down once headroom drops below this share.
const THROTTLE_HEADROOM: f64 = 0.2;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("rate limited ({limit_type}), retry after {retry_after_seconds}s")]
    RateLimited {
        retry_after_seconds: u64,
        limit_type: String,
    },
    #[error("upstream rejected the request ({status})")]
    Upstream4xx { status: u16, body: String },
    #[error("upstream failure ({status})")]
    Upstream5xx { status: u16 },
    #[error("store has no usable credentials")]
    CredentialsMissing,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("transport: {0}")]
    Transport(String),
}

impl From<GatewayError> for OrchestratorError {
    fn from(e: GatewayError) -> Self {
        match e {
            GatewayError::RateLimited {
                retry_after_seconds,
                ..
            } => OrchestratorError::RateLimited {
                retry_after_seconds,
            },
            GatewayError::Upstream4xx { status, body } if status == 401 || status == 403 => {
                OrchestratorError::Unauthorized {
                    reason: format!("upstream {status}: {body}"),
                    credential_related: true,
                }
            }
            GatewayError::Upstream4xx { status, body } => {
                OrchestratorError::Invalid(format!("upstream {status}: {body}"))
            }
            GatewayError::Upstream5xx { status } => {
                OrchestratorError::Transient(format!("upstream {status}"))
            }
            GatewayError::CredentialsMissing => OrchestratorError::Unauthorized {
                reason: "store credentials missing or unreadable".to_string(),
                credential_related: true,
            },
            GatewayError::NotFound(what) => OrchestratorError::NotFound(what),
            GatewayError::Transport(msg) => OrchestratorError::Transient(msg),
        }
    }
}

/// An outbound platform request, REST or GraphQL.
#[derive(Debug, Clone)]
pub struct PlatformRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<serde_json::Value>,
    pub graphql: Option<String>,
    pub keep_typename: bool,
}

impl PlatformRequest {
    pub fn get(path: &str) -> Self {
        Self {
            method: Method::GET,
            path: path.to_string(),
            body: None,
            graphql: None,
            keep_typename: false,
        }
    }

    pub fn post(path: &str, body: serde_json::Value) -> Self {
        Self {
            method: Method::POST,
            path: path.to_string(),
            body: Some(body),
            graphql: None,
            keep_typename: false,
        }
    }

    pub fn put(path: &str, body: serde_json::Value) -> Self {
        Self {
            method: Method::PUT,
            path: path.to_string(),
            body: Some(body),
            graphql: None,
            keep_typename: false,
        }
    }

    /// A Shopify admin GraphQL call. The query is slimmed and cost-estimated
    /// before it leaves the process.
    pub fn graphql(query: &str) -> Self {
        Self {
            method: Method::POST,
            path: "/admin/api/2024-10/graphql.json".to_string(),
            body: None,
            graphql: Some(query.to_string()),
            keep_typename: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub body: serde_json::Value,
    /// Tokens the call ended up consuming (actual cost when reported).
    pub cost: f64,
    /// True when bucket headroom is below 20% of capacity; callers should
    /// slow further enqueues.
    pub throttled: bool,
}

#[derive(Clone)]
pub struct PlatformGateway {
    db: PgPool,
    http: reqwest::Client,
    vault: Arc<dyn CredentialVault>,
}

impl PlatformGateway {
    pub fn new(
        db: PgPool,
        vault: Arc<dyn CredentialVault>,
        timeout: std::time::Duration,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { db, http, vault })
    }

    /// Execute one outbound call for a store.
    pub async fn call(
        &self,
        store_id: Uuid,
        req: PlatformRequest,
    ) -> Result<GatewayResponse, GatewayError> {
        let store = self.load_store(store_id).await?;
        let platform = store.platform;

        let sealed = store
            .credentials
            .as_ref()
            .ok_or(GatewayError::CredentialsMissing)?;
        let creds = self
            .vault
            .unseal(sealed)
            .await
            .map_err(|_| GatewayError::CredentialsMissing)?;
        let token = creds
            .access_token
            .as_deref()
            .ok_or(GatewayError::CredentialsMissing)?;

        // Shape the query and price the call before anything leaves.
        let slimmed_query = req
            .graphql
            .as_deref()
            .map(|q| cost::slim_query(q, req.keep_typename));
        let estimated = match &slimmed_query {
            Some(query) if limits::is_cost_based(platform) => cost::estimate_cost(query),
            _ => 1.0,
        };

        let buckets = limits::buckets_for_request(platform, &req.path);
        let (mut remaining, mut throttled) = self
            .reserve(&store, &buckets, estimated)
            .await?;

        // Build and send the HTTP request.
        let base_url = match creds.api_base_url.as_deref() {
            Some(base) => base.trim_end_matches('/').to_string(),
            None => default_base_url(platform)
                .ok_or(GatewayError::CredentialsMissing)?
                .to_string(),
        };
        let url = format!("{base_url}{}", req.path);

        let mut builder = self.http.request(req.method.clone(), &url);
        builder = match platform {
            Platform::Shopify => builder.header("X-Shopify-Access-Token", token),
            _ => builder.bearer_auth(token),
        };
        let payload = match &slimmed_query {
            Some(query) => Some(serde_json::json!({ "query": query })),
            None => req.body.clone(),
        };
        if let Some(payload) = &payload {
            builder = builder.json(payload);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        let status = response.status();

        if status.as_u16() == 429 {
            return Err(self
                .handle_upstream_429(&store, &buckets, &req, response)
                .await);
        }
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            if status.as_u16() == 404 {
                return Err(GatewayError::NotFound(req.path.clone()));
            }
            return Err(GatewayError::Upstream4xx {
                status: status.as_u16(),
                body,
            });
        }
        if status.is_server_error() {
            return Err(GatewayError::Upstream5xx {
                status: status.as_u16(),
            });
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| GatewayError::Transport(format!("unreadable response body: {e}")))?;

        // The platform's reported cost supersedes the estimate.
        let mut final_cost = estimated;
        if limits::is_cost_based(platform) {
            if let Some(actual) = actual_query_cost(&body) {
                let delta = actual - estimated;
                if delta.abs() > f64::EPSILON {
                    if let Ok(r) = self.adjust(&store, limits::primary_bucket(platform), delta).await
                    {
                        remaining = r;
                    }
                }
                final_cost = actual;
            }
            if let Some(available) = currently_available(&body) {
                remaining = available;
            }
            let capacity = limits::bucket_specs(platform)
                .iter()
                .find(|s| s.name == limits::primary_bucket(platform))
                .map(|s| s.capacity)
                .unwrap_or(1.0);
            throttled = remaining < THROTTLE_HEADROOM * capacity;
        }

        debug!(
            store_id = %store.id,
            path = %req.path,
            cost = final_cost,
            remaining,
            throttled,
            "platform call completed"
        );

        audit::record(
            &self.db,
            AuditEntry::builder()
                .tenant_id(store.tenant_id)
                .action("api_call")
                .resource_type("store")
                .resource_id(store.id.to_string())
                .metadata(serde_json::json!({
                    "path": req.path,
                    "method": req.method.as_str(),
                    "cost": final_cost,
                    "bucket_remaining": remaining,
                }))
                .tags(vec![
                    AuditTag::Automation.as_str().to_string(),
                    "api_call".to_string(),
                ])
                .build(),
        )
        .await;

        Ok(GatewayResponse {
            body,
            cost: final_cost,
            throttled,
        })
    }

    async fn load_store(&self, store_id: Uuid) -> Result<Store, GatewayError> {
        Store::find_by_id(store_id, &self.db).await.map_err(|e| {
            match e.downcast_ref::<sqlx::Error>() {
                Some(sqlx::Error::RowNotFound) => {
                    GatewayError::NotFound(format!("store {store_id}"))
                }
                _ => GatewayError::Transport(e.to_string()),
            }
        })
    }

    /// Consume `cost` from the request's buckets under optimistic
    /// concurrency. Nothing is persisted when any bucket rejects, so a
    /// failed secondary leaves the primary untouched. Returns the primary
    /// bucket's remaining tokens and the throttle signal.
    async fn reserve(
        &self,
        store: &Store,
        buckets: &[&'static str],
        cost: f64,
    ) -> Result<(f64, bool), GatewayError> {
        for _ in 0..STATE_WRITE_ATTEMPTS {
            let now = Utc::now();
            let (value, version) = Store::load_rate_limit_state(store.id, &self.db)
                .await
                .map_err(|e| GatewayError::Transport(e.to_string()))?;

            let mut state = RateLimitState::from_value(&value);
            limits::ensure_buckets(&mut state, store.platform, now);

            if let Err(hit) = state.try_consume_all(buckets, cost, now) {
                return Err(GatewayError::RateLimited {
                    retry_after_seconds: hit.retry_after_seconds,
                    limit_type: hit.limit_type,
                });
            }

            let written =
                Store::store_rate_limit_state(store.id, &state.to_value(), version, &self.db)
                    .await
                    .map_err(|e| GatewayError::Transport(e.to_string()))?;
            if written {
                let primary = limits::primary_bucket(store.platform);
                let (remaining, capacity) = state
                    .buckets
                    .get(primary)
                    .map(|b| (b.available(), b.capacity))
                    .unwrap_or((0.0, 1.0));
                return Ok((remaining, remaining < THROTTLE_HEADROOM * capacity));
            }
        }

        Err(GatewayError::Transport(format!(
            "rate limit state contention for store {}",
            store.id
        )))
    }

    /// Apply a post-hoc cost correction to one bucket. Positive deltas drain,
    /// negative deltas refund. Returns the bucket's remaining tokens.
    async fn adjust(
        &self,
        store: &Store,
        bucket_name: &str,
        delta: f64,
    ) -> Result<f64, GatewayError> {
        for _ in 0..STATE_WRITE_ATTEMPTS {
            let (value, version) = Store::load_rate_limit_state(store.id, &self.db)
                .await
                .map_err(|e| GatewayError::Transport(e.to_string()))?;

            let mut state = RateLimitState::from_value(&value);
            let remaining = match state.bucket_mut(bucket_name) {
                Some(bucket) => {
                    if delta > 0.0 {
                        bucket.drain(delta);
                    } else {
                        bucket.refund(-delta);
                    }
                    bucket.available()
                }
                None => return Ok(0.0),
            };

            let written =
                Store::store_rate_limit_state(store.id, &state.to_value(), version, &self.db)
                    .await
                    .map_err(|e| GatewayError::Transport(e.to_string()))?;
            if written {
                return Ok(remaining);
            }
        }

        Err(GatewayError::Transport(format!(
            "rate limit state contention for store {}",
            store.id
        )))
    }

    /// Record an upstream 429 and resync local state to its Retry-After.
    async fn handle_upstream_429(
        &self,
        store: &Store,
        buckets: &[&'static str],
        req: &PlatformRequest,
        response: reqwest::Response,
    ) -> GatewayError {
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(30);

        warn!(
            store_id = %store.id,
            path = %req.path,
            retry_after,
            "upstream rate limit"
        );

        audit::record(
            &self.db,
            AuditEntry::builder()
                .tenant_id(store.tenant_id)
                .action("external_rate_limit")
                .resource_type("store")
                .resource_id(store.id.to_string())
                .metadata(serde_json::json!({
                    "path": req.path,
                    "retry_after": retry_after,
                }))
                .tags(vec![
                    AuditTag::RateLimiting.as_str().to_string(),
                    "external_rate_limit".to_string(),
                ])
                .build(),
        )
        .await;

        // Best effort: hold the consumed buckets empty until the platform's
        // horizon. A lost CAS here just means another writer already synced.
        for _ in 0..STATE_WRITE_ATTEMPTS {
            let now = Utc::now();
            let Ok((value, version)) = Store::load_rate_limit_state(store.id, &self.db).await
            else {
                break;
            };
            let mut state = RateLimitState::from_value(&value);
            for name in buckets {
                if let Some(bucket) = state.bucket_mut(name) {
                    bucket.sync_from_retry_after(retry_after, now);
                }
            }
            match Store::store_rate_limit_state(store.id, &state.to_value(), version, &self.db)
                .await
            {
                Ok(true) => break,
                Ok(false) => continue,
                Err(_) => break,
            }
        }

        GatewayError::RateLimited {
            retry_after_seconds: retry_after,
            limit_type: "upstream".to_string(),
        }
    }
}

fn default_base_url(platform: Platform) -> Option<&'static str> {
    match platform {
        // Shopify admin URLs are store-specific; they come from credentials.
        Platform::Shopify => None,
        Platform::Etsy => Some("https://api.etsy.com/v3"),
        Platform::Printify => Some("https://api.printify.com/v1"),
        Platform::AmazonSpApi => Some("https://sellingpartnerapi-na.amazon.com"),
        Platform::Gumroad => Some("https://api.gumroad.com/v2"),
        Platform::AmazonKdp => Some("https://kdp.amazon.com/api"),
    }
}

fn actual_query_cost(body: &serde_json::Value) -> Option<f64> {
    body.get("extensions")?
        .get("cost")?
        .get("actualQueryCost")?
        .as_f64()
}

fn currently_available(body: &serde_json::Value) -> Option<f64> {
    body.get("extensions")?
        .get("cost")?
        .get("throttleStatus")?
        .get("currentlyAvailable")?
        .as_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_errors_map_to_the_taxonomy() {
        let err: OrchestratorError = GatewayError::RateLimited {
            retry_after_seconds: 4,
            limit_type: "cost".to_string(),
        }
        .into();
        assert!(matches!(
            err,
            OrchestratorError::RateLimited {
                retry_after_seconds: 4
            }
        ));

        let err: OrchestratorError = GatewayError::Upstream4xx {
            status: 401,
            body: "bad token".to_string(),
        }
        .into();
        assert!(matches!(
            err,
            OrchestratorError::Unauthorized {
                credential_related: true,
                ..
            }
        ));

        let err: OrchestratorError = GatewayError::Upstream4xx {
            status: 422,
            body: "unprocessable".to_string(),
        }
        .into();
        assert!(matches!(err, OrchestratorError::Invalid(_)));

        let err: OrchestratorError = GatewayError::Upstream5xx { status: 502 }.into();
        assert!(matches!(err, OrchestratorError::Transient(_)));
    }

    #[test]
    fn actual_cost_is_read_from_extensions() {
        let body = serde_json::json!({
            "data": {},
            "extensions": {
                "cost": {
                    "requestedQueryCost": 600,
                    "actualQueryCost": 580,
                    "throttleStatus": {
                        "maximumAvailable": 1000.0,
                        "currentlyAvailable": 420.0,
                        "restoreRate": 50.0
                    }
                }
            }
        });
        assert_eq!(actual_query_cost(&body), Some(580.0));
        assert_eq!(currently_available(&body), Some(420.0));
    }

    #[test]
    fn rest_responses_have_no_cost_extensions() {
        let body = serde_json::json!({"ok": true});
        assert_eq!(actual_query_cost(&body), None);
        assert_eq!(currently_available(&body), None);
    }
}
