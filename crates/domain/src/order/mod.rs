//! Order record, state machine and related types.

mod model;
mod state;
mod value_objects;

pub use model::{Order, OrderParts};
pub use state::{OrderStatus, UnknownStatus};
pub use value_objects::{
    CustomerContact, NewOrderItem, OrderItem, PaymentConfirmation, ShippingAddress, TrackingInfo,
};

use thiserror::Error;

/// Errors that can occur during order operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrderError {
    /// Order is not in a status that allows the action.
    #[error("Invalid state transition: cannot {action} from {current_state} state")]
    InvalidStateTransition {
        current_state: OrderStatus,
        action: &'static str,
    },

    /// The order already carries a fulfillment provider id.
    #[error("Order already submitted as {fulfillment_order_id}")]
    AlreadySubmitted { fulfillment_order_id: String },

    /// A different fulfillment provider id was reported for the order.
    #[error("Fulfillment order id conflict: have {existing}, got {received}")]
    FulfillmentIdConflict { existing: String, received: String },

    /// Order has no items.
    #[error("Order has no items")]
    NoItems,

    /// Invalid quantity.
    #[error("Invalid quantity: {quantity} (must be greater than 0)")]
    InvalidQuantity { quantity: u32 },

    /// Invalid price.
    #[error("Invalid price: {price} (must be greater than 0)")]
    InvalidPrice { price: i64 },

    /// A line or order total does not fit in the amount type.
    #[error("Order amount overflows")]
    AmountOverflow,

    /// Item has no fulfillment provider variant.
    #[error("Item '{product_name}' has no fulfillment variant id")]
    MissingVariant { product_name: String },
}
