use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::OrderId;
use domain::{
    FulfillmentWebhookEvent, Order, OrderError, OrderItem, OrderStatus, PaymentWebhookEvent,
    SubmissionFailure,
};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{
    Result, StoreError,
    store::{OrderStore, PaymentEventInsert},
};

#[derive(Default)]
struct Tables {
    orders: HashMap<OrderId, Order>,
    items: HashMap<OrderId, Vec<OrderItem>>,
    failures: Vec<SubmissionFailure>,
    payment_events: Vec<PaymentWebhookEvent>,
    fulfillment_events: Vec<FulfillmentWebhookEvent>,
}

/// In-memory order store for tests and local runs.
///
/// A single write lock covers every table, which trivially makes each
/// mutation atomic.
#[derive(Clone, Default)]
pub struct InMemoryOrderStore {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryOrderStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored payment events.
    pub async fn payment_event_count(&self) -> usize {
        self.tables.read().await.payment_events.len()
    }

    /// Returns the number of stored fulfillment events.
    pub async fn fulfillment_event_count(&self) -> usize {
        self.tables.read().await.fulfillment_events.len()
    }
}

fn oldest_first(mut orders: Vec<Order>, limit: usize) -> Vec<Order> {
    orders.sort_by_key(|o| o.updated_at());
    orders.truncate(limit);
    orders
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn insert_order(&self, order: &Order, items: &[OrderItem]) -> Result<()> {
        let mut tables = self.tables.write().await;
        if tables.orders.contains_key(&order.id()) {
            return Err(StoreError::DuplicateOrder(order.id()));
        }
        tables.orders.insert(order.id(), order.clone());
        tables.items.insert(order.id(), items.to_vec());
        Ok(())
    }

    async fn get_order(&self, id: OrderId) -> Result<Option<Order>> {
        Ok(self.tables.read().await.orders.get(&id).cloned())
    }

    async fn get_items(&self, id: OrderId) -> Result<Vec<OrderItem>> {
        Ok(self
            .tables
            .read()
            .await
            .items
            .get(&id)
            .cloned()
            .unwrap_or_default())
    }

    async fn find_by_fulfillment_id(&self, fulfillment_order_id: &str) -> Result<Option<Order>> {
        let tables = self.tables.read().await;
        Ok(tables
            .orders
            .values()
            .find(|o| o.fulfillment_order_id() == Some(fulfillment_order_id))
            .cloned())
    }

    async fn find_by_payment_session(&self, session_id: &str) -> Result<Option<Order>> {
        let tables = self.tables.read().await;
        Ok(tables
            .orders
            .values()
            .find(|o| o.payment_session_id() == Some(session_id))
            .cloned())
    }

    async fn modify_order<T, F>(&self, id: OrderId, transition: F) -> Result<(Order, T)>
    where
        F: FnOnce(&mut Order) -> std::result::Result<T, OrderError> + Send,
        T: Send,
    {
        let mut tables = self.tables.write().await;
        let stored = tables
            .orders
            .get_mut(&id)
            .ok_or(StoreError::OrderNotFound(id))?;

        // Work on a copy so a rejected transition leaves the row untouched.
        let mut order = stored.clone();
        let value = transition(&mut order)?;
        *stored = order.clone();

        Ok((order, value))
    }

    async fn record_submission_failure(
        &self,
        id: OrderId,
        error: &str,
        retryable: bool,
        max_attempts: u32,
    ) -> Result<(Order, SubmissionFailure)> {
        let mut tables = self.tables.write().await;
        let stored = tables
            .orders
            .get_mut(&id)
            .ok_or(StoreError::OrderNotFound(id))?;

        let mut order = stored.clone();
        let failure = order.fail_submission(error, retryable, max_attempts)?;
        *stored = order.clone();
        tables.failures.push(failure.clone());

        Ok((order, failure))
    }

    async fn submission_failures(&self, id: OrderId) -> Result<Vec<SubmissionFailure>> {
        let tables = self.tables.read().await;
        let mut failures: Vec<_> = tables
            .failures
            .iter()
            .filter(|f| f.order_id == id)
            .cloned()
            .collect();
        failures.sort_by_key(|f| f.attempt);
        Ok(failures)
    }

    async fn find_retryable(&self, max_attempts: u32, limit: usize) -> Result<Vec<Order>> {
        let tables = self.tables.read().await;
        let orders = tables
            .orders
            .values()
            .filter(|o| o.is_retryable(max_attempts))
            .cloned()
            .collect();
        Ok(oldest_first(orders, limit))
    }

    async fn find_by_status(
        &self,
        status: OrderStatus,
        updated_before: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Order>> {
        let tables = self.tables.read().await;
        let orders = tables
            .orders
            .values()
            .filter(|o| o.status() == status)
            .filter(|o| updated_before.is_none_or(|cutoff| o.updated_at() < cutoff))
            .cloned()
            .collect();
        Ok(oldest_first(orders, limit))
    }

    async fn insert_payment_event(
        &self,
        event: &PaymentWebhookEvent,
    ) -> Result<PaymentEventInsert> {
        let mut tables = self.tables.write().await;
        if let Some(existing) = tables
            .payment_events
            .iter()
            .find(|e| e.event_id == event.event_id)
        {
            return Ok(PaymentEventInsert::Duplicate {
                processed: existing.processed,
            });
        }
        tables.payment_events.push(event.clone());
        Ok(PaymentEventInsert::Inserted)
    }

    async fn mark_payment_event_processed(&self, event_id: &str) -> Result<()> {
        let mut tables = self.tables.write().await;
        if let Some(event) = tables
            .payment_events
            .iter_mut()
            .find(|e| e.event_id == event_id)
        {
            event.processed = true;
        }
        Ok(())
    }

    async fn insert_fulfillment_event(&self, event: &FulfillmentWebhookEvent) -> Result<()> {
        self.tables
            .write()
            .await
            .fulfillment_events
            .push(event.clone());
        Ok(())
    }

    async fn fulfillment_event_processed_since(
        &self,
        provider_order_id: &str,
        event_type: &str,
        since: DateTime<Utc>,
    ) -> Result<bool> {
        let tables = self.tables.read().await;
        Ok(tables.fulfillment_events.iter().any(|e| {
            e.processed
                && e.event_type == event_type
                && e.provider_order_id.as_deref() == Some(provider_order_id)
                && e.received_at >= since
        }))
    }

    async fn mark_fulfillment_event_processed(&self, id: Uuid) -> Result<()> {
        let mut tables = self.tables.write().await;
        if let Some(event) = tables.fulfillment_events.iter_mut().find(|e| e.id == id) {
            event.processed = true;
        }
        Ok(())
    }
}
