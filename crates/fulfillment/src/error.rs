//! Service-layer error types.

use common::OrderId;
use domain::OrderError;
use order_store::StoreError;
use providers::ProviderError;
use thiserror::Error;

/// Errors that can occur while driving orders through fulfillment.
#[derive(Debug, Error)]
pub enum FulfillmentError {
    /// Order not found.
    #[error("Order not found: {0}")]
    OrderNotFound(OrderId),

    /// The request or webhook body could not be understood.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// A webhook signature or token did not match.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// The order rejected the transition.
    #[error("Order error: {0}")]
    Order(#[from] OrderError),

    /// Storage failure.
    #[error("Store error: {0}")]
    Store(StoreError),

    /// Provider failure that could not be absorbed.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// A background submission task panicked or was cancelled.
    #[error("Submission interrupted: {0}")]
    Interrupted(String),
}

impl From<StoreError> for FulfillmentError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::OrderNotFound(id) => FulfillmentError::OrderNotFound(id),
            StoreError::Order(e) => FulfillmentError::Order(e),
            other => FulfillmentError::Store(other),
        }
    }
}

/// Convenience type alias for fulfillment results.
pub type Result<T> = std::result::Result<T, FulfillmentError>;
