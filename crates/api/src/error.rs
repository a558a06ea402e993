//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use saga::SagaError;
use saga_store::SagaStoreError;

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Resource not found.
    NotFound(String),
    /// Bad request from the client.
    BadRequest(String),
    /// The request conflicts with the saga's current state.
    Conflict(String),
    /// Saga engine error.
    Saga(SagaError),
    /// Saga store error.
    Store(SagaStoreError),
    /// Internal server error.
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Saga(err) => saga_error_to_response(err),
            ApiError::Store(err) => store_error_to_response(err),
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "internal server error");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

fn saga_error_to_response(err: SagaError) -> (StatusCode, String) {
    match err {
        SagaError::Store(store_err) => store_error_to_response(store_err),
        SagaError::ContextKeyConflict { .. } | SagaError::SagaTypeMismatch { .. } => {
            (StatusCode::BAD_REQUEST, err.to_string())
        }
        SagaError::NotPending(_) | SagaError::NotResumable(_) | SagaError::ExclusivityLost(_) => {
            (StatusCode::CONFLICT, err.to_string())
        }
        SagaError::UnknownSagaType(_) => (StatusCode::NOT_FOUND, err.to_string()),
        _ => {
            tracing::error!(error = %err, "saga engine error");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

fn store_error_to_response(err: SagaStoreError) -> (StatusCode, String) {
    match &err {
        SagaStoreError::NotFound(_) => (StatusCode::NOT_FOUND, err.to_string()),
        SagaStoreError::ConcurrencyConflict { .. } | SagaStoreError::LeaseHeld { .. } => {
            (StatusCode::CONFLICT, err.to_string())
        }
        _ => {
            tracing::error!(error = %err, "saga store error");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

impl From<SagaError> for ApiError {
    fn from(err: SagaError) -> Self {
        ApiError::Saga(err)
    }
}

impl From<SagaStoreError> for ApiError {
    fn from(err: SagaStoreError) -> Self {
        ApiError::Store(err)
    }
}
