//! Engine error to HTTP response mapping.

use agentry_core::{EngineError, ErrorKind};
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::{debug, error};

/// Wrapper carrying an engine error across a handler boundary.
pub struct ApiError(pub EngineError);

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status =
            StatusCode::from_u16(kind.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        // 5xx get full context in the log; 4xx only at debug level.
        if status.is_server_error() {
            error!(error = %self.0, code = kind.code(), "Request failed");
        } else {
            debug!(error = %self.0, code = kind.code(), "Request rejected");
        }

        let message = match kind {
            // Internal detail stays out of the response body.
            ErrorKind::Internal | ErrorKind::Misconfigured => "internal error".to_string(),
            ErrorKind::Provider => format!("Model unavailable: {}", self.0),
            _ => self.0.to_string(),
        };
        (status, Json(json!({"error": message, "code": kind.code()}))).into_response()
    }
}

/// Shorthand for handler results.
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_maps_to_404() {
        let response = ApiError(EngineError::not_found("agent")).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_internal_hides_detail() {
        let response =
            ApiError(EngineError::internal("connection pool exploded")).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_conflict_is_423() {
        let err = EngineError::Conflict {
            message: "locked by agent x".into(),
        };
        assert_eq!(ApiError(err).into_response().status().as_u16(), 423);
    }

    #[test]
    fn test_credits_is_402() {
        let err = EngineError::InsufficientCredits {
            required: 3,
            balance: 0,
        };
        assert_eq!(ApiError(err).into_response().status().as_u16(), 402);
    }
}
