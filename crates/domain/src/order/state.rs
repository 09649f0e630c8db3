//! Order status state machine.

use serde::{Deserialize, Serialize};

/// The status of an order in its fulfillment lifecycle.
///
/// State transitions:
/// ```text
/// Created ──► AwaitingPayment ──► Paid ──► Submitting ──► Submitted ──► Confirmed ──► Fulfilled
///    │               │             ▲           │              │             │
///    │               │             └───────────┘              └─────────────┴──► (shipment) Fulfilled
///    └───────────────┴──► PaymentFailed
///
/// any non-terminal ──► FulfillmentFailed
/// ```
///
/// `Submitting` is a claim marker held only while a submission call is in
/// flight; a failed or rejected submission drops back to `Paid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Order row exists, no payment session yet.
    #[default]
    Created,

    /// A hosted checkout session has been opened for the order.
    AwaitingPayment,

    /// Payment captured; the order is waiting for (re)submission.
    Paid,

    /// A submission to the fulfillment provider is in flight.
    Submitting,

    /// The provider accepted a draft order.
    Submitted,

    /// The provider draft has been confirmed for production.
    Confirmed,

    /// The order shipped (terminal state).
    Fulfilled,

    /// The provider reported the order as failed (terminal state).
    FulfillmentFailed,

    /// Payment did not go through (terminal state).
    PaymentFailed,
}

impl OrderStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [OrderStatus; 9] = [
        OrderStatus::Created,
        OrderStatus::AwaitingPayment,
        OrderStatus::Paid,
        OrderStatus::Submitting,
        OrderStatus::Submitted,
        OrderStatus::Confirmed,
        OrderStatus::Fulfilled,
        OrderStatus::FulfillmentFailed,
        OrderStatus::PaymentFailed,
    ];

    /// Returns true if a checkout session can be attached in this state.
    pub fn can_await_payment(&self) -> bool {
        matches!(self, OrderStatus::Created)
    }

    /// Returns true if a payment confirmation can be applied in this state.
    pub fn can_mark_paid(&self) -> bool {
        matches!(self, OrderStatus::Created | OrderStatus::AwaitingPayment)
    }

    /// Returns true if a payment failure can be applied in this state.
    pub fn can_fail_payment(&self) -> bool {
        matches!(self, OrderStatus::Created | OrderStatus::AwaitingPayment)
    }

    /// Returns true if a submission can be claimed in this state.
    pub fn can_claim_submission(&self) -> bool {
        matches!(self, OrderStatus::Paid)
    }

    /// Returns true if the provider draft can be confirmed in this state.
    pub fn can_confirm(&self) -> bool {
        matches!(self, OrderStatus::Submitted)
    }

    /// Returns true if a shipment can be recorded in this state.
    pub fn can_mark_shipped(&self) -> bool {
        matches!(self, OrderStatus::Submitted | OrderStatus::Confirmed)
    }

    /// Returns true if a provider-side failure can be recorded in this state.
    pub fn can_fail_fulfillment(&self) -> bool {
        !self.is_terminal()
    }

    /// Returns true if payment has been captured for an order in this state.
    pub fn is_paid(&self) -> bool {
        matches!(
            self,
            OrderStatus::Paid
                | OrderStatus::Submitting
                | OrderStatus::Submitted
                | OrderStatus::Confirmed
                | OrderStatus::Fulfilled
                | OrderStatus::FulfillmentFailed
        )
    }

    /// Returns true if this is a terminal state (no further transitions possible).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Fulfilled | OrderStatus::FulfillmentFailed | OrderStatus::PaymentFailed
        )
    }

    /// Returns the status name as stored and reported.
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Created => "created",
            OrderStatus::AwaitingPayment => "awaiting_payment",
            OrderStatus::Paid => "paid",
            OrderStatus::Submitting => "submitting",
            OrderStatus::Submitted => "submitted",
            OrderStatus::Confirmed => "confirmed",
            OrderStatus::Fulfilled => "fulfilled",
            OrderStatus::FulfillmentFailed => "fulfillment_failed",
            OrderStatus::PaymentFailed => "payment_failed",
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error returned when parsing an unknown status string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown order status: {0}")]
pub struct UnknownStatus(pub String);

impl std::str::FromStr for OrderStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OrderStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}
