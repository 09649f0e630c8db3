//! Outbound clients for the payment and fulfillment providers.
//!
//! This crate provides:
//! - `CircuitBreaker`, the per-provider protection primitive
//! - `ProviderError` with its transient/permanent classification
//! - `PaymentProvider` / `FulfillmentProvider` traits, their HTTP clients
//!   and in-memory implementations for tests

pub mod breaker;
pub mod error;
pub mod fulfillment;
mod http;
pub mod payment;

pub use breaker::{BreakerConfig, BreakerError, CircuitBreaker, CircuitState};
pub use error::{ProviderError, Result};
pub use fulfillment::{
    FulfillmentClient, FulfillmentClientConfig, FulfillmentProvider, InMemoryFulfillmentProvider,
};
pub use payment::{
    CheckoutSession, InMemoryPaymentProvider, PaymentClient, PaymentClientConfig, PaymentProvider,
    SessionDetails, ShippingRules,
};
