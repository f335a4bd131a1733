//! Webhook intake endpoint.
//!
//! `POST /webhooks/{platform}/{store_id}` with the platform's native payload
//! and signature header. The raw body is buffered verbatim; signature
//! verification runs over exactly the bytes the platform signed.

use std::time::Duration;

use axum::extract::{Extension, Path};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use bytes::Bytes;
use serde::Serialize;
use uuid::Uuid;

use crate::domains::stores::Platform;
use crate::kernel::webhooks::{self, IngestError, IngestOutcome};
use crate::server::app::AppState;

/// Whole-pipeline ceiling; signature verification is fast, DB inserts
/// dominate.
const INTAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Serialize)]
pub struct WebhookResponse {
    pub status: &'static str,
    pub webhook_id: Option<Uuid>,
}

/// POST /webhooks/{platform}/{store_id}
pub async fn intake_handler(
    Extension(state): Extension<AppState>,
    Path((platform, store_id)): Path<(String, Uuid)>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<WebhookResponse>) {
    let Some(platform) = Platform::from_path_segment(&platform) else {
        return not_found();
    };

    let outcome = tokio::time::timeout(
        INTAKE_TIMEOUT,
        webhooks::ingest(&state.deps, platform, store_id, &headers, body),
    )
    .await;

    match outcome {
        Ok(Ok(IngestOutcome::Accepted { webhook_id, .. })) => (
            StatusCode::OK,
            Json(WebhookResponse {
                status: "ok",
                webhook_id: Some(webhook_id),
            }),
        ),
        Ok(Ok(IngestOutcome::Replay { webhook_id })) => (
            StatusCode::OK,
            Json(WebhookResponse {
                status: "replay",
                webhook_id: Some(webhook_id),
            }),
        ),
        Ok(Err(IngestError::UnknownStore)) => not_found(),
        Ok(Err(IngestError::SignatureInvalid)) => (
            StatusCode::UNAUTHORIZED,
            Json(WebhookResponse {
                status: "signature_invalid",
                webhook_id: None,
            }),
        ),
        Ok(Err(IngestError::Processing(message))) => {
            tracing::error!(store_id = %store_id, error = %message, "webhook processing failed");
            processing_error()
        }
        Err(_) => {
            tracing::error!(store_id = %store_id, "webhook intake exceeded 10s ceiling");
            processing_error()
        }
    }
}

fn not_found() -> (StatusCode, Json<WebhookResponse>) {
    (
        StatusCode::NOT_FOUND,
        Json(WebhookResponse {
            status: "unknown_store",
            webhook_id: None,
        }),
    )
}

fn processing_error() -> (StatusCode, Json<WebhookResponse>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(WebhookResponse {
            status: "error",
            webhook_id: None,
        }),
    )
}
