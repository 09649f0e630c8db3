//! Append-only audit records.

use chrono::{DateTime, Utc};
use common::OrderId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One failed attempt to submit an order to the fulfillment provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionFailure {
    pub id: Uuid,
    pub order_id: OrderId,
    /// 1-based attempt number.
    pub attempt: u32,
    pub error: String,
    /// Whether the provider error was classified as worth retrying.
    pub retryable: bool,
    pub created_at: DateTime<Utc>,
}

impl SubmissionFailure {
    pub fn new(order_id: OrderId, attempt: u32, error: impl Into<String>, retryable: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            order_id,
            attempt,
            error: error.into(),
            retryable,
            created_at: Utc::now(),
        }
    }
}

/// A notification received from the payment provider.
///
/// `event_id` is the provider's identifier and is unique across stored
/// events; it is the idempotency key for payment webhooks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentWebhookEvent {
    pub id: Uuid,
    pub event_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub processed: bool,
    pub received_at: DateTime<Utc>,
}

impl PaymentWebhookEvent {
    pub fn new(
        event_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_id: event_id.into(),
            event_type: event_type.into(),
            payload,
            processed: false,
            received_at: Utc::now(),
        }
    }
}

/// A notification received from the fulfillment provider.
///
/// The provider sends no reliable event id, so these rows are not unique;
/// every delivery is kept for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FulfillmentWebhookEvent {
    pub id: Uuid,
    pub event_type: String,
    /// The provider's order id, when the payload carries one.
    pub provider_order_id: Option<String>,
    pub payload: serde_json::Value,
    pub processed: bool,
    pub received_at: DateTime<Utc>,
}

impl FulfillmentWebhookEvent {
    pub fn new(
        event_type: impl Into<String>,
        provider_order_id: Option<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            provider_order_id,
            payload,
            processed: false,
            received_at: Utc::now(),
        }
    }
}
