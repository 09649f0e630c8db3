//! Payment provider webhook ingestion.
//!
//! Every event is stored under its provider event id before it is acted on.
//! The unique event id makes redelivery of a fully processed event a no-op;
//! an event stored by an attempt that failed midway is processed again, and
//! the order's state guards keep that safe.

use std::sync::Arc;

use common::OrderId;
use domain::{Order, OrderStatus, PaymentWebhookEvent};
use order_store::{OrderStore, PaymentEventInsert};
use providers::{PaymentProvider, SessionDetails};
use serde_json::Value;

use super::signature::{self, SignatureError};
use super::{WebhookOutcome, record_outcome};
use crate::error::{FulfillmentError, Result};
use crate::lifecycle::OrderLifecycle;

const COMPLETED_EVENTS: &[&str] = &[
    "checkout.session.completed",
    "checkout.session.async_payment_succeeded",
];
/// The session can no longer be paid.
const FAILED_EVENTS: &[&str] = &["checkout.session.async_payment_failed"];
/// One declined attempt; the customer may still pay in the same session.
const DECLINED_EVENTS: &[&str] = &["payment_intent.payment_failed"];

/// How payment webhooks are authenticated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentWebhookAuth {
    /// HMAC signature header signed with the endpoint secret.
    Signature { secret: String },
    /// Shared token in the URL, for deployments without a signing secret.
    Token { token: String },
}

impl PaymentWebhookAuth {
    /// Prefers the signing secret when one is configured.
    pub fn from_settings(secret: Option<String>, token: Option<String>) -> Self {
        match secret.filter(|s| !s.is_empty()) {
            Some(secret) => PaymentWebhookAuth::Signature { secret },
            None => PaymentWebhookAuth::Token {
                token: token.unwrap_or_default(),
            },
        }
    }

    fn verify(
        &self,
        signature_header: Option<&str>,
        token: Option<&str>,
        body: &[u8],
    ) -> Result<()> {
        let result = match self {
            PaymentWebhookAuth::Signature { secret } => match signature_header {
                Some(header) => signature::verify_signature(
                    header,
                    body,
                    secret,
                    chrono::Utc::now().timestamp(),
                ),
                None => Err(SignatureError::Missing),
            },
            PaymentWebhookAuth::Token { token: expected } => match token {
                Some(t) if signature::token_matches(t, expected) => Ok(()),
                Some(_) => Err(SignatureError::Mismatch),
                None => Err(SignatureError::Missing),
            },
        };
        result.map_err(|e| FulfillmentError::Unauthorized(e.to_string()))
    }
}

fn str_at(value: &Value, pointer: &str) -> Option<String> {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Handles payment provider webhooks.
pub struct PaymentWebhookHandler<S: OrderStore> {
    lifecycle: OrderLifecycle<S>,
    payment: Arc<dyn PaymentProvider>,
    auth: PaymentWebhookAuth,
}

impl<S: OrderStore + Clone + 'static> PaymentWebhookHandler<S> {
    /// Creates a new handler.
    pub fn new(
        lifecycle: OrderLifecycle<S>,
        payment: Arc<dyn PaymentProvider>,
        auth: PaymentWebhookAuth,
    ) -> Self {
        Self {
            lifecycle,
            payment,
            auth,
        }
    }

    /// Authenticates, records and processes one delivery.
    pub async fn handle(
        &self,
        signature_header: Option<&str>,
        token: Option<&str>,
        body: &[u8],
    ) -> Result<WebhookOutcome> {
        self.auth
            .verify(signature_header, token, body)
            .inspect_err(|e| tracing::warn!(error = %e, "payment webhook rejected"))?;

        let event: Value = serde_json::from_slice(body)
            .map_err(|e| FulfillmentError::InvalidPayload(e.to_string()))?;
        let event_id = str_at(&event, "/id")
            .ok_or_else(|| FulfillmentError::InvalidPayload("event has no id".into()))?;
        let event_type = str_at(&event, "/type")
            .ok_or_else(|| FulfillmentError::InvalidPayload("event has no type".into()))?;

        let outcome = self.process(&event_id, &event_type, event).await?;
        record_outcome("payment", outcome);
        Ok(outcome)
    }

    #[tracing::instrument(name = "payment_webhook", skip(self, event))]
    async fn process(
        &self,
        event_id: &str,
        event_type: &str,
        event: Value,
    ) -> Result<WebhookOutcome> {
        let store = self.lifecycle.store();
        let record = PaymentWebhookEvent::new(event_id, event_type, event.clone());

        match store.insert_payment_event(&record).await? {
            PaymentEventInsert::Inserted => {}
            PaymentEventInsert::Duplicate { processed: true } => {
                tracing::info!("duplicate payment event acknowledged");
                return Ok(WebhookOutcome::Duplicate);
            }
            PaymentEventInsert::Duplicate { processed: false } => {
                tracing::info!("reprocessing payment event left unprocessed");
            }
        }

        let outcome = if COMPLETED_EVENTS.contains(&event_type) {
            self.payment_completed(object(&event)?).await?
        } else if FAILED_EVENTS.contains(&event_type) {
            self.payment_failed(object(&event)?).await?
        } else if DECLINED_EVENTS.contains(&event_type) {
            let order_id = str_at(object(&event)?, "/metadata/order_id");
            tracing::info!(
                order_id = order_id.as_deref(),
                "payment attempt declined, session still open"
            );
            WebhookOutcome::Ignored
        } else {
            tracing::debug!("payment event type not handled");
            WebhookOutcome::Ignored
        };

        store.mark_payment_event_processed(event_id).await?;
        Ok(outcome)
    }

    async fn payment_completed(&self, object: &Value) -> Result<WebhookOutcome> {
        let from_payload = SessionDetails::from_json(object)
            .map_err(|e| FulfillmentError::InvalidPayload(e.to_string()))?;
        if !from_payload.is_paid() {
            tracing::info!(
                session_id = %from_payload.id,
                payment_status = %from_payload.payment_status,
                "checkout completed without settled payment"
            );
            return Ok(WebhookOutcome::Ignored);
        }

        let Some(order) = self.find_order(object).await? else {
            tracing::warn!(session_id = %from_payload.id, "no order for paid checkout session");
            return Ok(WebhookOutcome::Ignored);
        };

        let details = match self.payment.get_checkout_session(&from_payload.id).await {
            Ok(details) => details,
            Err(e) => {
                tracing::warn!(error = %e, "session fetch failed, using webhook payload");
                from_payload
            }
        };

        let (order, changed) = match self
            .lifecycle
            .mark_paid(order.id(), details.confirmation())
            .await
        {
            Ok(result) => result,
            Err(FulfillmentError::Order(e)) => {
                tracing::warn!(order_id = %order.id(), error = %e, "payment not applied");
                return Ok(WebhookOutcome::Ignored);
            }
            Err(e) => return Err(e),
        };

        if order.status() == OrderStatus::Paid && !order.needs_attention() {
            let submission = self.lifecycle.submit_for_fulfillment(order.id()).await?;
            tracing::debug!(order_id = %order.id(), ?submission, "synchronous submission finished");
        }

        Ok(if changed {
            WebhookOutcome::Processed
        } else {
            WebhookOutcome::Duplicate
        })
    }

    async fn payment_failed(&self, object: &Value) -> Result<WebhookOutcome> {
        let Some(order) = self.find_order(object).await? else {
            tracing::warn!("no order for failed payment");
            return Ok(WebhookOutcome::Ignored);
        };

        match self.lifecycle.mark_payment_failed(order.id()).await {
            Ok((_, true)) => Ok(WebhookOutcome::Processed),
            Ok((_, false)) => Ok(WebhookOutcome::Duplicate),
            Err(FulfillmentError::Order(e)) => {
                tracing::warn!(order_id = %order.id(), error = %e, "payment failure not applied");
                Ok(WebhookOutcome::Ignored)
            }
            Err(e) => Err(e),
        }
    }

    /// Resolves the order from `metadata.order_id`, then
    /// `client_reference_id`, then the stored session id.
    async fn find_order(&self, object: &Value) -> Result<Option<Order>> {
        let store = self.lifecycle.store();

        for pointer in ["/metadata/order_id", "/client_reference_id"] {
            let Some(id) = str_at(object, pointer).and_then(|s| s.parse::<OrderId>().ok()) else {
                continue;
            };
            if let Some(order) = store.get_order(id).await? {
                return Ok(Some(order));
            }
        }

        match str_at(object, "/id") {
            Some(session_id) => Ok(store.find_by_payment_session(&session_id).await?),
            None => Ok(None),
        }
    }
}

fn object(event: &Value) -> Result<&Value> {
    event
        .pointer("/data/object")
        .filter(|o| o.is_object())
        .ok_or_else(|| FulfillmentError::InvalidPayload("event has no data.object".into()))
}
