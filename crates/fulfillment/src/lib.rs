//! Order fulfillment services.
//!
//! This crate ties the order store to both providers:
//! - [`CheckoutService`] creates orders and their payment sessions
//! - [`OrderLifecycle`] applies guarded transitions and submits paid orders
//! - [`webhooks`] ingests payment and fulfillment provider events idempotently
//! - [`RetryWorker`] re-drives paid orders that were not submitted

pub mod checkout;
pub mod error;
pub mod lifecycle;
pub mod retry;
pub mod webhooks;

pub use checkout::{CheckoutRequest, CheckoutService, CheckoutStarted};
pub use error::{FulfillmentError, Result};
pub use lifecycle::{LifecycleConfig, OrderDetails, OrderLifecycle, SubmissionOutcome};
pub use retry::{RetryConfig, RetrySummary, RetryWorker};
pub use webhooks::{
    FulfillmentWebhookConfig, FulfillmentWebhookHandler, PaymentWebhookAuth,
    PaymentWebhookHandler, SignatureError, WebhookOutcome,
};
