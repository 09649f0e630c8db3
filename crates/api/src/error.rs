//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use domain::OrderError;
use fulfillment::FulfillmentError;

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Resource not found.
    NotFound(String),
    /// Bad request from the client.
    BadRequest(String),
    /// Missing or wrong credentials.
    Unauthorized(String),
    /// Error from the fulfillment services.
    Fulfillment(FulfillmentError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Fulfillment(err) => fulfillment_error_to_response(err),
        };

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

fn fulfillment_error_to_response(err: FulfillmentError) -> (StatusCode, String) {
    match &err {
        FulfillmentError::OrderNotFound(_) => (StatusCode::NOT_FOUND, err.to_string()),
        FulfillmentError::InvalidPayload(_) => (StatusCode::BAD_REQUEST, err.to_string()),
        FulfillmentError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, err.to_string()),
        FulfillmentError::Order(order_err) => match order_err {
            OrderError::InvalidStateTransition { .. }
            | OrderError::AlreadySubmitted { .. }
            | OrderError::FulfillmentIdConflict { .. } => (StatusCode::CONFLICT, err.to_string()),
            OrderError::NoItems
            | OrderError::InvalidQuantity { .. }
            | OrderError::InvalidPrice { .. }
            | OrderError::AmountOverflow
            | OrderError::MissingVariant { .. } => (StatusCode::BAD_REQUEST, err.to_string()),
        },
        FulfillmentError::Provider(provider_err) if provider_err.is_rejection() => {
            (StatusCode::SERVICE_UNAVAILABLE, err.to_string())
        }
        FulfillmentError::Provider(_) => {
            tracing::warn!(error = %err, "provider error");
            (StatusCode::BAD_GATEWAY, err.to_string())
        }
        FulfillmentError::Store(_) | FulfillmentError::Interrupted(_) => {
            tracing::error!(error = %err, "internal server error");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal server error".to_string(),
            )
        }
    }
}

impl From<FulfillmentError> for ApiError {
    fn from(err: FulfillmentError) -> Self {
        ApiError::Fulfillment(err)
    }
}
