//! SSE change-notification endpoint.
//!
//! GET /streams/{tenant_id}
//!
//! One coalesced stream per tenant: job, approval, budget, webhook, and
//! reconciliation transitions arrive as small JSON events and the UI
//! re-fetches what changed. Consumers that fall behind get a `lagged` event
//! with the number of missed notifications instead of silent gaps.

use std::convert::Infallible;

use axum::extract::{Extension, Path};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{self, StreamExt};
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::server::app::AppState;

/// SSE stream handler.
pub async fn stream_handler(
    Extension(state): Extension<AppState>,
    Path(tenant_id): Path<Uuid>,
) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.deps.stream_hub.subscribe(tenant_id).await;

    let connected =
        stream::once(async { Ok::<_, Infallible>(Event::default().event("connected").data("ok")) });

    let events = BroadcastStream::new(rx).filter_map(|result| async {
        match result {
            Ok(change) => Event::default()
                .event(change.kind.clone())
                .json_data(&change)
                .ok()
                .map(Ok),
            Err(tokio_stream::wrappers::errors::BroadcastStreamRecvError::Lagged(n)) => {
                Event::default()
                    .event("lagged")
                    .json_data(&serde_json::json!({ "missed": n }))
                    .ok()
                    .map(Ok)
            }
        }
    });

    Sse::new(connected.chain(events)).keep_alive(KeepAlive::default())
}
