//! Domain layer for the order-fulfillment bridge.
//!
//! This crate provides:
//! - The order status state machine and its transition rules
//! - The `Order` record with guarded transition methods
//! - Append-only audit records (submission failures, webhook events)

pub mod audit;
pub mod order;

pub use audit::{FulfillmentWebhookEvent, PaymentWebhookEvent, SubmissionFailure};
pub use common::{Money, OrderId};
pub use order::{
    CustomerContact, NewOrderItem, Order, OrderError, OrderItem, OrderParts, OrderStatus,
    PaymentConfirmation, ShippingAddress, TrackingInfo, UnknownStatus,
};
