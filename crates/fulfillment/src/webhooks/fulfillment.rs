//! Fulfillment provider webhook ingestion.
//!
//! The provider sends no reliable event id. Every delivery is stored for
//! audit; a shipment or failure event for the same provider order that was
//! already processed within the dedup window is acknowledged as a duplicate.

use chrono::{Duration, Utc};
use common::OrderId;
use domain::{FulfillmentWebhookEvent, Order, TrackingInfo};
use order_store::OrderStore;
use serde_json::Value;

use super::signature;
use super::{WebhookOutcome, record_outcome};
use crate::error::{FulfillmentError, Result};
use crate::lifecycle::OrderLifecycle;

const ORDER_UPDATED: &str = "order_updated";
const PACKAGE_SHIPPED: &str = "package_shipped";
const ORDER_FAILED: &str = "order_failed";

/// Fulfillment webhook settings.
#[derive(Debug, Clone)]
pub struct FulfillmentWebhookConfig {
    /// Token embedded in the webhook URL path.
    pub token: String,
    /// Window within which a repeated event counts as a duplicate.
    pub dedup_window: Duration,
}

impl FulfillmentWebhookConfig {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            dedup_window: Duration::minutes(10),
        }
    }
}

/// Handles fulfillment provider webhooks.
pub struct FulfillmentWebhookHandler<S: OrderStore> {
    lifecycle: OrderLifecycle<S>,
    config: FulfillmentWebhookConfig,
}

/// The provider's order id, sent as a number or a string.
fn provider_order_id(event: &Value) -> Option<String> {
    match event.pointer("/data/order/id")? {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

impl<S: OrderStore> FulfillmentWebhookHandler<S> {
    /// Creates a new handler.
    pub fn new(lifecycle: OrderLifecycle<S>, config: FulfillmentWebhookConfig) -> Self {
        Self { lifecycle, config }
    }

    /// Authenticates, records and processes one delivery.
    pub async fn handle(&self, token: &str, body: &[u8]) -> Result<WebhookOutcome> {
        if !signature::token_matches(token, &self.config.token) {
            tracing::warn!("fulfillment webhook rejected: token mismatch");
            return Err(FulfillmentError::Unauthorized("token mismatch".into()));
        }

        let event: Value = serde_json::from_slice(body)
            .map_err(|e| FulfillmentError::InvalidPayload(e.to_string()))?;
        let event_type = event
            .get("type")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| FulfillmentError::InvalidPayload("event has no type".into()))?
            .to_string();

        let outcome = self.process(event_type, event).await?;
        record_outcome("fulfillment", outcome);
        Ok(outcome)
    }

    #[tracing::instrument(name = "fulfillment_webhook", skip(self, event), fields(provider_order_id))]
    async fn process(&self, event_type: String, event: Value) -> Result<WebhookOutcome> {
        let store = self.lifecycle.store();
        let provider_id = provider_order_id(&event);
        if let Some(id) = &provider_id {
            tracing::Span::current().record("provider_order_id", id.as_str());
        }

        let record = FulfillmentWebhookEvent::new(&event_type, provider_id.clone(), event.clone());
        store.insert_fulfillment_event(&record).await?;

        if matches!(event_type.as_str(), PACKAGE_SHIPPED | ORDER_FAILED)
            && let Some(id) = &provider_id
        {
            let since = Utc::now() - self.config.dedup_window;
            if store
                .fulfillment_event_processed_since(id, &event_type, since)
                .await?
            {
                tracing::info!("duplicate fulfillment event acknowledged");
                return Ok(WebhookOutcome::Duplicate);
            }
        }

        let outcome = match event_type.as_str() {
            PACKAGE_SHIPPED => self.package_shipped(provider_id.as_deref(), &event).await?,
            ORDER_FAILED => self.order_failed(provider_id.as_deref(), &event).await?,
            ORDER_UPDATED => {
                let status = event.pointer("/data/order/status").and_then(Value::as_str);
                tracing::info!(status, "fulfillment order updated");
                WebhookOutcome::Ignored
            }
            _ => {
                tracing::debug!("fulfillment event type not handled");
                WebhookOutcome::Ignored
            }
        };

        store.mark_fulfillment_event_processed(record.id).await?;
        Ok(outcome)
    }

    async fn package_shipped(
        &self,
        provider_id: Option<&str>,
        event: &Value,
    ) -> Result<WebhookOutcome> {
        let number = event
            .pointer("/data/shipment/tracking_number")
            .and_then(|v| match v {
                Value::String(s) if !s.is_empty() => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .ok_or_else(|| FulfillmentError::InvalidPayload("shipment has no tracking number".into()))?;
        let url = event
            .pointer("/data/shipment/tracking_url")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        let Some(order) = self.find_order(provider_id, event).await? else {
            tracing::warn!("no order for shipment");
            return Ok(WebhookOutcome::Ignored);
        };

        match self
            .lifecycle
            .mark_shipped(order.id(), TrackingInfo { number, url })
            .await
        {
            Ok((_, true)) => Ok(WebhookOutcome::Processed),
            Ok((_, false)) => Ok(WebhookOutcome::Duplicate),
            Err(FulfillmentError::Order(e)) => {
                tracing::warn!(order_id = %order.id(), error = %e, "shipment not applied");
                Ok(WebhookOutcome::Ignored)
            }
            Err(e) => Err(e),
        }
    }

    async fn order_failed(&self, provider_id: Option<&str>, event: &Value) -> Result<WebhookOutcome> {
        let Some(order) = self.find_order(provider_id, event).await? else {
            tracing::warn!("no order for provider failure");
            return Ok(WebhookOutcome::Ignored);
        };
        let reason = event
            .pointer("/data/reason")
            .and_then(Value::as_str)
            .unwrap_or("unspecified");

        match self.lifecycle.mark_fulfillment_failed(order.id()).await {
            Ok((_, true)) => {
                tracing::warn!(order_id = %order.id(), reason, "provider reported order failure");
                Ok(WebhookOutcome::Processed)
            }
            Ok((_, false)) => Ok(WebhookOutcome::Duplicate),
            Err(FulfillmentError::Order(e)) => {
                tracing::warn!(order_id = %order.id(), error = %e, "provider failure not applied");
                Ok(WebhookOutcome::Ignored)
            }
            Err(e) => Err(e),
        }
    }

    /// Resolves the order by provider id, falling back to our own id echoed
    /// back as `external_id`.
    async fn find_order(&self, provider_id: Option<&str>, event: &Value) -> Result<Option<Order>> {
        let store = self.lifecycle.store();

        if let Some(id) = provider_id
            && let Some(order) = store.find_by_fulfillment_id(id).await?
        {
            return Ok(Some(order));
        }

        let external = event
            .pointer("/data/order/external_id")
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<OrderId>().ok());
        match external {
            Some(id) => Ok(store.get_order(id).await?),
            None => Ok(None),
        }
    }
}
