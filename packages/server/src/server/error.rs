//! HTTP mapping for the orchestrator error taxonomy.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::kernel::OrchestratorError;

/// Route-level error that renders as a JSON problem body.
#[derive(Debug)]
pub struct ApiError(pub OrchestratorError);

impl From<OrchestratorError> for ApiError {
    fn from(e: OrchestratorError) -> Self {
        ApiError(e)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        match e.downcast_ref::<sqlx::Error>() {
            Some(sqlx::Error::RowNotFound) => {
                ApiError(OrchestratorError::NotFound("resource".to_string()))
            }
            _ => ApiError(OrchestratorError::Transient(e.to_string())),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, retry_after) = match &self.0 {
            OrchestratorError::Invalid(_) => (StatusCode::BAD_REQUEST, None),
            OrchestratorError::Unauthorized { .. } => (StatusCode::UNAUTHORIZED, None),
            OrchestratorError::NotFound(_) => (StatusCode::NOT_FOUND, None),
            OrchestratorError::Conflict => (StatusCode::CONFLICT, None),
            OrchestratorError::RateLimited {
                retry_after_seconds,
            } => (StatusCode::TOO_MANY_REQUESTS, Some(*retry_after_seconds)),
            OrchestratorError::BudgetFrozen { .. } => (StatusCode::LOCKED, None),
            OrchestratorError::Transient(_) => (StatusCode::INTERNAL_SERVER_ERROR, None),
        };

        let body = serde_json::json!({
            "error": self.0.to_string(),
            "retry_after": retry_after,
        });

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_maps_to_status_codes() {
        let cases = [
            (OrchestratorError::Invalid("x".into()), StatusCode::BAD_REQUEST),
            (OrchestratorError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (OrchestratorError::Conflict, StatusCode::CONFLICT),
            (
                OrchestratorError::RateLimited {
                    retry_after_seconds: 4,
                },
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (
                OrchestratorError::Transient("x".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (error, expected) in cases {
            let response = ApiError(error).into_response();
            assert_eq!(response.status(), expected);
        }
    }
}
