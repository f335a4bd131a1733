//! Job registry: maps job type strings to typed handlers.
//!
//! Each handler declares its own payload struct; the registry deserializes
//! the job's JSON payload and invokes the handler with the shared deps and a
//! per-job cancellation token. The runner only ever sees a typed
//! [`JobOutcome`] or a classified error.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::job::Job;
use crate::kernel::error::OrchestratorError;
use crate::kernel::ServerDeps;

/// What a handler decided about its job.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Success {
        result: Option<serde_json::Value>,
        /// Ask the engine to schedule a reconciliation pass for the job's
        /// store (60s delay, priority 5).
        reconciliation_needed: bool,
    },
    Retry {
        error: String,
        reason: Option<String>,
    },
    Permanent {
        error: String,
    },
}

impl JobOutcome {
    pub fn success() -> Self {
        JobOutcome::Success {
            result: None,
            reconciliation_needed: false,
        }
    }

    pub fn success_with(result: serde_json::Value) -> Self {
        JobOutcome::Success {
            result: Some(result),
            reconciliation_needed: false,
        }
    }

    pub fn success_needs_reconciliation(result: serde_json::Value) -> Self {
        JobOutcome::Success {
            result: Some(result),
            reconciliation_needed: true,
        }
    }

    pub fn retry(error: impl Into<String>, reason: impl Into<String>) -> Self {
        JobOutcome::Retry {
            error: error.into(),
            reason: Some(reason.into()),
        }
    }

    pub fn permanent(error: impl Into<String>) -> Self {
        JobOutcome::Permanent {
            error: error.into(),
        }
    }
}

/// Per-job execution context handed to handlers.
#[derive(Clone)]
pub struct JobContext {
    pub deps: Arc<ServerDeps>,
    /// Derived from the worker's shutdown token and the job's lease; a
    /// cancelled handler must return promptly.
    pub cancel: CancellationToken,
    pub job_id: Uuid,
    pub tenant_id: Uuid,
    pub store_id: Option<Uuid>,
}

type HandlerResult = Result<JobOutcome, OrchestratorError>;

type BoxedHandler = Box<
    dyn Fn(serde_json::Value, JobContext) -> Pin<Box<dyn Future<Output = HandlerResult> + Send>>
        + Send
        + Sync,
>;

/// Registry that maps job type strings to handlers. Built once at startup
/// and never mutated afterwards.
#[derive(Default)]
pub struct JobRegistry {
    registrations: HashMap<&'static str, BoxedHandler>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            registrations: HashMap::new(),
        }
    }

    /// Register a job type with its handler. The payload type `P` is
    /// deserialized from the job's JSON payload on entry; a payload that
    /// does not fit the declared schema fails permanently as `Invalid`.
    pub fn register<P, F, Fut>(&mut self, job_type: &'static str, handler: F)
    where
        P: DeserializeOwned + Send + 'static,
        F: Fn(P, JobContext) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let boxed: BoxedHandler = Box::new(move |value, ctx| {
            let handler = handler.clone();
            Box::pin(async move {
                let payload: P = serde_json::from_value(value).map_err(|e| {
                    OrchestratorError::Invalid(format!(
                        "payload for {job_type} failed validation: {e}"
                    ))
                })?;
                handler(payload, ctx).await
            })
        });

        self.registrations.insert(job_type, boxed);
    }

    /// Execute a claimed job with its registered handler.
    pub async fn execute(&self, job: &Job, ctx: JobContext) -> HandlerResult {
        let handler = self
            .registrations
            .get(job.job_type.as_str())
            .ok_or_else(|| {
                OrchestratorError::Invalid(format!("unknown job type: {}", job.job_type))
            })?;

        (handler)(job.payload.clone(), ctx).await
    }

    pub fn is_registered(&self, job_type: &str) -> bool {
        self.registrations.contains_key(job_type)
    }

    pub fn registered_types(&self) -> Vec<&'static str> {
        self.registrations.keys().copied().collect()
    }
}

/// Thread-safe registry wrapped in Arc.
pub type SharedJobRegistry = Arc<JobRegistry>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct TestPayload {
        #[allow(dead_code)]
        listing_id: Uuid,
    }

    #[test]
    fn register_and_check() {
        let mut registry = JobRegistry::new();
        registry.register("test_job", |_payload: TestPayload, _ctx| async move {
            Ok(JobOutcome::success())
        });

        assert!(registry.is_registered("test_job"));
        assert!(!registry.is_registered("unknown_job"));
        assert_eq!(registry.registered_types(), vec!["test_job"]);
    }

    #[test]
    fn outcome_constructors() {
        assert!(matches!(
            JobOutcome::success(),
            JobOutcome::Success {
                result: None,
                reconciliation_needed: false
            }
        ));
        assert!(matches!(
            JobOutcome::success_needs_reconciliation(serde_json::json!({})),
            JobOutcome::Success {
                reconciliation_needed: true,
                ..
            }
        ));
        assert!(matches!(
            JobOutcome::retry("boom", "upstream 503"),
            JobOutcome::Retry { .. }
        ));
        assert!(matches!(
            JobOutcome::permanent("bad payload"),
            JobOutcome::Permanent { .. }
        ));
    }
}
