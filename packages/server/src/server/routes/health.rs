//! Health and readiness surface for the orchestration plane.
//!
//! A database ping alone says nothing about whether work is moving, so the
//! response also reports queue pressure: due backlog, in-flight jobs, stale
//! leases, and the age of the oldest runnable job. Stale leases or an aging
//! backlog mean the job runners are down or starved while the database
//! answers fine; that surfaces as `degraded` rather than a hard 503.

use axum::{extract::Extension, http::StatusCode, Json};
use chrono::Duration;
use serde::Serialize;
use std::time::Instant;

use crate::kernel::jobs::{Job, QueueDepth};
use crate::server::app::AppState;

/// Due jobs beyond this count mean the runners are not keeping up.
const BACKLOG_DEGRADED: i64 = 500;
/// A runnable job older than this has waited through many poll intervals.
const OLDEST_DUE_DEGRADED_SECS: i64 = 300;

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    database: DatabaseHealth,
    job_queue: JobQueueHealth,
}

#[derive(Serialize)]
pub struct DatabaseHealth {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Serialize)]
pub struct JobQueueHealth {
    status: &'static str,
    due_pending: i64,
    running: i64,
    stale_leases: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    oldest_due_seconds: Option<i64>,
}

impl JobQueueHealth {
    fn unknown() -> Self {
        Self {
            status: "unknown",
            due_pending: 0,
            running: 0,
            stale_leases: 0,
            oldest_due_seconds: None,
        }
    }
}

/// Health check endpoint
///
/// Answers 503 only when the database is unreachable; queue trouble (stale
/// leases, deep or aging backlog) stays 200 with `status = "degraded"` so
/// load balancers keep routing while operators investigate.
pub async fn health_handler(
    Extension(state): Extension<AppState>,
) -> (StatusCode, Json<HealthResponse>) {
    let started = Instant::now();
    let database = match tokio::time::timeout(
        std::time::Duration::from_secs(5),
        sqlx::query("SELECT 1").execute(&state.deps.db_pool),
    )
    .await
    {
        Ok(Ok(_)) => DatabaseHealth {
            status: "ok",
            latency_ms: Some(started.elapsed().as_millis() as u64),
            error: None,
        },
        Ok(Err(e)) => DatabaseHealth {
            status: "error",
            latency_ms: None,
            error: Some(format!("Query failed: {}", e)),
        },
        Err(_) => DatabaseHealth {
            status: "error",
            latency_ms: None,
            error: Some("Query timeout (>5s)".to_string()),
        },
    };

    let job_queue = if database.status == "ok" {
        let lease = Duration::milliseconds(state.deps.config.job_lease.as_millis() as i64);
        match Job::queue_depth(lease, &state.deps.db_pool).await {
            Ok(depth) => JobQueueHealth {
                status: queue_status(&depth),
                due_pending: depth.due_pending,
                running: depth.running,
                stale_leases: depth.stale_leases,
                oldest_due_seconds: depth.oldest_due_seconds,
            },
            Err(e) => {
                tracing::warn!(error = %e, "queue depth probe failed");
                JobQueueHealth::unknown()
            }
        }
    } else {
        JobQueueHealth::unknown()
    };

    let db_healthy = database.status == "ok";
    let status = if !db_healthy {
        "unhealthy"
    } else if job_queue.status == "ok" {
        "healthy"
    } else {
        "degraded"
    };
    let status_code = if db_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        Json(HealthResponse {
            status,
            database,
            job_queue,
        }),
    )
}

/// Classify queue pressure. Stale leases outrank backlog: they mean claims
/// are dying, not merely queuing.
fn queue_status(depth: &QueueDepth) -> &'static str {
    if depth.stale_leases > 0 {
        return "stalled_leases";
    }
    if depth.due_pending > BACKLOG_DEGRADED
        || depth.oldest_due_seconds.unwrap_or(0) > OLDEST_DUE_DEGRADED_SECS
    {
        return "backlogged";
    }
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;

    fn depth(due_pending: i64, stale_leases: i64, oldest: Option<i64>) -> QueueDepth {
        QueueDepth {
            due_pending,
            running: 2,
            stale_leases,
            oldest_due_seconds: oldest,
        }
    }

    #[test]
    fn quiet_queue_is_ok() {
        assert_eq!(queue_status(&depth(3, 0, Some(10))), "ok");
        assert_eq!(queue_status(&depth(0, 0, None)), "ok");
    }

    #[test]
    fn stale_leases_outrank_backlog() {
        assert_eq!(queue_status(&depth(10_000, 1, Some(900))), "stalled_leases");
    }

    #[test]
    fn deep_or_aging_backlog_degrades() {
        assert_eq!(queue_status(&depth(501, 0, Some(10))), "backlogged");
        assert_eq!(queue_status(&depth(3, 0, Some(301))), "backlogged");
    }

    #[test]
    fn boundary_values_stay_ok() {
        assert_eq!(queue_status(&depth(500, 0, Some(300))), "ok");
    }
}
