use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::OrderId;
use domain::{
    FulfillmentWebhookEvent, Order, OrderError, OrderItem, OrderStatus, PaymentWebhookEvent,
    SubmissionFailure,
};
use uuid::Uuid;

use crate::Result;

/// Result of recording a payment provider event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentEventInsert {
    /// First delivery of this event id.
    Inserted,
    /// The event id was already stored; `processed` tells whether an earlier
    /// delivery ran to completion.
    Duplicate { processed: bool },
}

/// Core trait for order persistence.
///
/// The store is the single source of truth for order state. Implementations
/// must be thread-safe (Send + Sync) and must make [`modify_order`] and
/// [`record_submission_failure`] atomic per order: the current row is read,
/// the transition validated and the new row written without any other writer
/// interleaving.
///
/// [`modify_order`]: OrderStore::modify_order
/// [`record_submission_failure`]: OrderStore::record_submission_failure
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Inserts a new order together with its items.
    async fn insert_order(&self, order: &Order, items: &[OrderItem]) -> Result<()>;

    /// Loads an order by id.
    async fn get_order(&self, id: OrderId) -> Result<Option<Order>>;

    /// Loads an order's items in creation order.
    async fn get_items(&self, id: OrderId) -> Result<Vec<OrderItem>>;

    /// Finds the order carrying a fulfillment provider id.
    async fn find_by_fulfillment_id(&self, fulfillment_order_id: &str) -> Result<Option<Order>>;

    /// Finds the order attached to a payment session.
    async fn find_by_payment_session(&self, session_id: &str) -> Result<Option<Order>>;

    /// Applies a transition to one order atomically.
    ///
    /// `transition` sees the current row; if it returns an error nothing is
    /// written. Returns the order as stored afterwards together with the
    /// transition's own result.
    async fn modify_order<T, F>(&self, id: OrderId, transition: F) -> Result<(Order, T)>
    where
        F: FnOnce(&mut Order) -> std::result::Result<T, OrderError> + Send,
        T: Send;

    /// Moves a claimed order back to `Paid` and appends the failure record
    /// in the same atomic step.
    async fn record_submission_failure(
        &self,
        id: OrderId,
        error: &str,
        retryable: bool,
        max_attempts: u32,
    ) -> Result<(Order, SubmissionFailure)>;

    /// Lists the submission failures for an order, oldest first.
    async fn submission_failures(&self, id: OrderId) -> Result<Vec<SubmissionFailure>>;

    /// Lists paid orders eligible for another submission attempt, least
    /// recently touched first.
    async fn find_retryable(&self, max_attempts: u32, limit: usize) -> Result<Vec<Order>>;

    /// Lists orders in a status, optionally only those untouched since
    /// `updated_before`, least recently touched first.
    async fn find_by_status(
        &self,
        status: OrderStatus,
        updated_before: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Order>>;

    /// Stores a payment provider event unless its event id is already known.
    async fn insert_payment_event(&self, event: &PaymentWebhookEvent)
    -> Result<PaymentEventInsert>;

    /// Flags a payment provider event as fully processed.
    async fn mark_payment_event_processed(&self, event_id: &str) -> Result<()>;

    /// Stores a fulfillment provider event.
    async fn insert_fulfillment_event(&self, event: &FulfillmentWebhookEvent) -> Result<()>;

    /// Returns true if an event of this type for this provider order was
    /// processed at or after `since`.
    async fn fulfillment_event_processed_since(
        &self,
        provider_order_id: &str,
        event_type: &str,
        since: DateTime<Utc>,
    ) -> Result<bool>;

    /// Flags a fulfillment provider event as processed.
    async fn mark_fulfillment_event_processed(&self, id: Uuid) -> Result<()>;
}
