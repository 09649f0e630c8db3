//! Webhook ingestion for both providers.

pub mod fulfillment;
pub mod payment;
pub mod signature;

use serde::Serialize;

pub use fulfillment::{FulfillmentWebhookConfig, FulfillmentWebhookHandler};
pub use payment::{PaymentWebhookAuth, PaymentWebhookHandler};
pub use signature::SignatureError;

/// What a webhook delivery amounted to. Every variant is acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookOutcome {
    /// The event drove a state change.
    Processed,
    /// The event repeated one already handled.
    Duplicate,
    /// The event was stored but required no action.
    Ignored,
}

impl WebhookOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookOutcome::Processed => "processed",
            WebhookOutcome::Duplicate => "duplicate",
            WebhookOutcome::Ignored => "ignored",
        }
    }
}

fn record_outcome(source: &'static str, outcome: WebhookOutcome) {
    metrics::counter!(
        "webhook_events_total",
        "source" => source,
        "outcome" => outcome.as_str()
    )
    .increment(1);
}
