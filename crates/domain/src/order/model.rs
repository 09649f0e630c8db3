//! The order record and its guarded transitions.

use chrono::{DateTime, Utc};
use common::{Money, OrderId};
use serde::{Deserialize, Serialize};

use super::{
    CustomerContact, NewOrderItem, OrderError, OrderItem, OrderStatus, PaymentConfirmation,
    ShippingAddress, TrackingInfo,
};
use crate::audit::SubmissionFailure;

/// An order moving through payment and fulfillment.
///
/// All status changes go through the transition methods below. Each returns
/// `Ok(true)` when it changed the order, `Ok(false)` when the order was
/// already in the requested end state (a repeated notification), and
/// `Err(OrderError::InvalidStateTransition)` when the transition is not
/// allowed from the current status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    id: OrderId,
    contact: CustomerContact,
    total: Money,
    currency: String,
    shipping: Option<ShippingAddress>,
    payment_session_id: Option<String>,
    payment_intent_id: Option<String>,
    fulfillment_order_id: Option<String>,
    tracking_number: Option<String>,
    tracking_url: Option<String>,
    status: OrderStatus,
    submission_attempts: u32,
    needs_attention: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

/// Raw order fields, used by storage backends to rebuild an [`Order`].
#[derive(Debug, Clone)]
pub struct OrderParts {
    pub id: OrderId,
    pub contact: CustomerContact,
    pub total: Money,
    pub currency: String,
    pub shipping: Option<ShippingAddress>,
    pub payment_session_id: Option<String>,
    pub payment_intent_id: Option<String>,
    pub fulfillment_order_id: Option<String>,
    pub tracking_number: Option<String>,
    pub tracking_url: Option<String>,
    pub status: OrderStatus,
    pub submission_attempts: u32,
    pub needs_attention: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<OrderParts> for Order {
    fn from(p: OrderParts) -> Self {
        Self {
            id: p.id,
            contact: p.contact,
            total: p.total,
            currency: p.currency,
            shipping: p.shipping,
            payment_session_id: p.payment_session_id,
            payment_intent_id: p.payment_intent_id,
            fulfillment_order_id: p.fulfillment_order_id,
            tracking_number: p.tracking_number,
            tracking_url: p.tracking_url,
            status: p.status,
            submission_attempts: p.submission_attempts,
            needs_attention: p.needs_attention,
            created_at: p.created_at,
            updated_at: p.updated_at,
        }
    }
}

impl Order {
    /// Creates a new order in `Created` status together with its items.
    ///
    /// The total is the sum of the line prices.
    pub fn create(
        contact: CustomerContact,
        currency: impl Into<String>,
        shipping: Option<ShippingAddress>,
        items: Vec<NewOrderItem>,
    ) -> Result<(Order, Vec<OrderItem>), OrderError> {
        if items.is_empty() {
            return Err(OrderError::NoItems);
        }
        for item in &items {
            if item.quantity == 0 {
                return Err(OrderError::InvalidQuantity {
                    quantity: item.quantity,
                });
            }
            if !item.unit_price.is_positive() {
                return Err(OrderError::InvalidPrice {
                    price: item.unit_price.minor_units(),
                });
            }
            if item.fulfillment_variant_id.trim().is_empty() {
                return Err(OrderError::MissingVariant {
                    product_name: item.product_name.clone(),
                });
            }
        }

        let id = OrderId::new();
        let items = items
            .into_iter()
            .map(|item| OrderItem::from_new(id, item))
            .collect::<Result<Vec<_>, _>>()?;
        let total = Money::checked_sum(items.iter().map(|i| i.line_price))
            .ok_or(OrderError::AmountOverflow)?;
        let now = Utc::now();

        let order = Order {
            id,
            contact,
            total,
            currency: currency.into().to_lowercase(),
            shipping,
            payment_session_id: None,
            payment_intent_id: None,
            fulfillment_order_id: None,
            tracking_number: None,
            tracking_url: None,
            status: OrderStatus::Created,
            submission_attempts: 0,
            needs_attention: false,
            created_at: now,
            updated_at: now,
        };

        Ok((order, items))
    }

    fn invalid(&self, action: &'static str) -> OrderError {
        OrderError::InvalidStateTransition {
            current_state: self.status,
            action,
        }
    }

    fn set_status(&mut self, status: OrderStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    /// Attaches a hosted checkout session (`Created` ⇒ `AwaitingPayment`).
    pub fn begin_payment(&mut self, session_id: &str) -> Result<bool, OrderError> {
        if self.status == OrderStatus::AwaitingPayment
            && self.payment_session_id.as_deref() == Some(session_id)
        {
            return Ok(false);
        }
        if !self.status.can_await_payment() {
            return Err(self.invalid("await payment"));
        }
        self.payment_session_id = Some(session_id.to_string());
        self.set_status(OrderStatus::AwaitingPayment);
        Ok(true)
    }

    /// Applies a successful payment (`Created`/`AwaitingPayment` ⇒ `Paid`).
    ///
    /// A repeat confirmation for an order already past payment is a no-op.
    pub fn mark_paid(&mut self, confirmation: PaymentConfirmation) -> Result<bool, OrderError> {
        if !self.status.can_mark_paid() {
            if self.status.is_paid() {
                return Ok(false);
            }
            return Err(self.invalid("mark paid"));
        }

        self.payment_session_id = Some(confirmation.session_id);
        if confirmation.payment_intent_id.is_some() {
            self.payment_intent_id = confirmation.payment_intent_id;
        }
        if let Some(contact) = confirmation.contact {
            if !contact.email.is_empty() {
                self.contact.email = contact.email;
            }
            if !contact.name.is_empty() {
                self.contact.name = contact.name;
            }
        }
        if confirmation.shipping.is_some() {
            self.shipping = confirmation.shipping;
        }
        self.set_status(OrderStatus::Paid);
        Ok(true)
    }

    /// Records a failed payment (`Created`/`AwaitingPayment` ⇒ `PaymentFailed`).
    pub fn mark_payment_failed(&mut self) -> Result<bool, OrderError> {
        if self.status == OrderStatus::PaymentFailed {
            return Ok(false);
        }
        if !self.status.can_fail_payment() {
            return Err(self.invalid("fail payment"));
        }
        self.set_status(OrderStatus::PaymentFailed);
        Ok(true)
    }

    /// Claims the order for a submission attempt (`Paid` ⇒ `Submitting`).
    ///
    /// Fails with `AlreadySubmitted` if a provider id is already recorded, so
    /// a draft is never created twice for the same order.
    pub fn claim_submission(&mut self) -> Result<(), OrderError> {
        if let Some(existing) = &self.fulfillment_order_id {
            return Err(OrderError::AlreadySubmitted {
                fulfillment_order_id: existing.clone(),
            });
        }
        if !self.status.can_claim_submission() {
            return Err(self.invalid("claim submission"));
        }
        self.set_status(OrderStatus::Submitting);
        Ok(())
    }

    /// Stores the provider id after a successful submission (`Submitting` ⇒ `Submitted`).
    pub fn complete_submission(&mut self, fulfillment_order_id: &str) -> Result<(), OrderError> {
        if self.status != OrderStatus::Submitting {
            return Err(self.invalid("complete submission"));
        }
        match &self.fulfillment_order_id {
            Some(existing) if existing != fulfillment_order_id => {
                return Err(OrderError::FulfillmentIdConflict {
                    existing: existing.clone(),
                    received: fulfillment_order_id.to_string(),
                });
            }
            Some(_) => {}
            None => self.fulfillment_order_id = Some(fulfillment_order_id.to_string()),
        }
        self.set_status(OrderStatus::Submitted);
        Ok(())
    }

    /// Gives up a claim without counting an attempt (`Submitting` ⇒ `Paid`).
    pub fn release_submission(&mut self) -> Result<(), OrderError> {
        if self.status != OrderStatus::Submitting {
            return Err(self.invalid("release submission"));
        }
        self.set_status(OrderStatus::Paid);
        Ok(())
    }

    /// Releases a claim taken before `claimed_before` (`Submitting` ⇒ `Paid`).
    ///
    /// Returns `Ok(false)` and leaves the order alone when the claim is
    /// newer, i.e. it was renewed by another attempt since it looked stale.
    pub fn release_stale_submission(
        &mut self,
        claimed_before: DateTime<Utc>,
    ) -> Result<bool, OrderError> {
        if self.status != OrderStatus::Submitting {
            return Err(self.invalid("release submission"));
        }
        if self.updated_at >= claimed_before {
            return Ok(false);
        }
        self.set_status(OrderStatus::Paid);
        Ok(true)
    }

    /// Records a failed submission attempt (`Submitting` ⇒ `Paid`).
    ///
    /// Increments the attempt counter and returns the audit record to append.
    /// The order is flagged for attention when the error is permanent or the
    /// attempt bound has been reached.
    pub fn fail_submission(
        &mut self,
        error: &str,
        retryable: bool,
        max_attempts: u32,
    ) -> Result<SubmissionFailure, OrderError> {
        if self.status != OrderStatus::Submitting {
            return Err(self.invalid("fail submission"));
        }
        self.submission_attempts += 1;
        if !retryable || self.submission_attempts >= max_attempts {
            self.needs_attention = true;
        }
        self.set_status(OrderStatus::Paid);
        Ok(SubmissionFailure::new(
            self.id,
            self.submission_attempts,
            error,
            retryable,
        ))
    }

    /// Confirms the provider draft (`Submitted` ⇒ `Confirmed`).
    ///
    /// A confirmation landing after the shipment is a no-op.
    pub fn confirm(&mut self) -> Result<bool, OrderError> {
        if matches!(self.status, OrderStatus::Confirmed | OrderStatus::Fulfilled) {
            return Ok(false);
        }
        if !self.status.can_confirm() {
            return Err(self.invalid("confirm"));
        }
        self.set_status(OrderStatus::Confirmed);
        Ok(true)
    }

    /// Records the shipment (`Submitted`/`Confirmed` ⇒ `Fulfilled`).
    ///
    /// Tracking fields are written once; a repeated shipment leaves them alone.
    pub fn mark_shipped(&mut self, tracking: TrackingInfo) -> Result<bool, OrderError> {
        if self.status == OrderStatus::Fulfilled {
            return Ok(false);
        }
        if !self.status.can_mark_shipped() {
            return Err(self.invalid("mark shipped"));
        }
        self.tracking_number = Some(tracking.number);
        self.tracking_url = tracking.url;
        self.set_status(OrderStatus::Fulfilled);
        Ok(true)
    }

    /// Records a provider-side failure (any non-terminal ⇒ `FulfillmentFailed`).
    pub fn mark_fulfillment_failed(&mut self) -> Result<bool, OrderError> {
        if self.status == OrderStatus::FulfillmentFailed {
            return Ok(false);
        }
        if !self.status.can_fail_fulfillment() {
            return Err(self.invalid("fail fulfillment"));
        }
        self.set_status(OrderStatus::FulfillmentFailed);
        Ok(true)
    }

    /// Clears the attention flag so the order can be submitted again.
    pub fn clear_attention(&mut self) -> bool {
        let was = self.needs_attention;
        self.needs_attention = false;
        if was {
            self.updated_at = Utc::now();
        }
        was
    }

    /// Returns true if the retry worker should pick this order up.
    pub fn is_retryable(&self, max_attempts: u32) -> bool {
        self.status == OrderStatus::Paid
            && self.fulfillment_order_id.is_none()
            && !self.needs_attention
            && self.submission_attempts < max_attempts
    }
}

// Query methods
impl Order {
    pub fn id(&self) -> OrderId {
        self.id
    }

    pub fn contact(&self) -> &CustomerContact {
        &self.contact
    }

    pub fn total(&self) -> Money {
        self.total
    }

    /// Returns the lowercase ISO currency code.
    pub fn currency(&self) -> &str {
        &self.currency
    }

    pub fn shipping(&self) -> Option<&ShippingAddress> {
        self.shipping.as_ref()
    }

    pub fn payment_session_id(&self) -> Option<&str> {
        self.payment_session_id.as_deref()
    }

    pub fn payment_intent_id(&self) -> Option<&str> {
        self.payment_intent_id.as_deref()
    }

    /// Returns the fulfillment provider's order id, once submitted.
    pub fn fulfillment_order_id(&self) -> Option<&str> {
        self.fulfillment_order_id.as_deref()
    }

    pub fn tracking_number(&self) -> Option<&str> {
        self.tracking_number.as_deref()
    }

    pub fn tracking_url(&self) -> Option<&str> {
        self.tracking_url.as_deref()
    }

    pub fn status(&self) -> OrderStatus {
        self.status
    }

    /// Returns the number of failed submission attempts.
    pub fn submission_attempts(&self) -> u32 {
        self.submission_attempts
    }

    pub fn needs_attention(&self) -> bool {
        self.needs_attention
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_order() -> Order {
        let (order, _) = Order::create(
            CustomerContact::new("ada@example.com", "Ada"),
            "USD",
            None,
            vec![NewOrderItem::new(
                "Poster",
                "A2",
                2,
                Money::from_minor(1500),
                "4011",
            )],
        )
        .unwrap();
        order
    }

    fn paid_order() -> Order {
        let mut order = new_order();
        order.begin_payment("cs_1").unwrap();
        order
            .mark_paid(PaymentConfirmation {
                session_id: "cs_1".into(),
                payment_intent_id: Some("pi_1".into()),
                ..Default::default()
            })
            .unwrap();
        order
    }

    #[test]
    fn test_create_computes_total() {
        let order = new_order();
        assert_eq!(order.status(), OrderStatus::Created);
        assert_eq!(order.total(), Money::from_minor(3000));
        assert_eq!(order.currency(), "usd");
    }

    #[test]
    fn test_create_rejects_bad_items() {
        let contact = CustomerContact::default();
        assert_eq!(
            Order::create(contact.clone(), "usd", None, vec![]).unwrap_err(),
            OrderError::NoItems
        );
        let zero_qty = NewOrderItem::new("P", "", 0, Money::from_minor(10), "1");
        assert!(matches!(
            Order::create(contact.clone(), "usd", None, vec![zero_qty]),
            Err(OrderError::InvalidQuantity { .. })
        ));
        let no_variant = NewOrderItem::new("P", "", 1, Money::from_minor(10), " ");
        assert!(matches!(
            Order::create(contact, "usd", None, vec![no_variant]),
            Err(OrderError::MissingVariant { .. })
        ));
    }

    #[test]
    fn test_create_rejects_overflowing_amounts() {
        let contact = CustomerContact::default();
        let huge_line = NewOrderItem::new("P", "", 3, Money::from_minor(i64::MAX / 2), "1");
        assert_eq!(
            Order::create(contact.clone(), "usd", None, vec![huge_line]).unwrap_err(),
            OrderError::AmountOverflow
        );

        let half = NewOrderItem::new("P", "", 1, Money::from_minor(i64::MAX / 2 + 1), "1");
        assert_eq!(
            Order::create(contact, "usd", None, vec![half.clone(), half]).unwrap_err(),
            OrderError::AmountOverflow
        );
    }

    #[test]
    fn test_mark_paid_sets_payment_fields() {
        let order = paid_order();
        assert_eq!(order.status(), OrderStatus::Paid);
        assert_eq!(order.payment_session_id(), Some("cs_1"));
        assert_eq!(order.payment_intent_id(), Some("pi_1"));
    }

    #[test]
    fn test_mark_paid_twice_is_noop() {
        let mut order = paid_order();
        let changed = order
            .mark_paid(PaymentConfirmation {
                session_id: "cs_1".into(),
                ..Default::default()
            })
            .unwrap();
        assert!(!changed);
        assert_eq!(order.payment_intent_id(), Some("pi_1"));
    }

    #[test]
    fn test_payment_failed_after_paid_is_rejected() {
        let mut order = paid_order();
        assert!(matches!(
            order.mark_payment_failed(),
            Err(OrderError::InvalidStateTransition { .. })
        ));
    }

    #[test]
    fn test_claim_requires_paid() {
        let mut order = new_order();
        assert!(order.claim_submission().is_err());

        let mut order = paid_order();
        order.claim_submission().unwrap();
        assert_eq!(order.status(), OrderStatus::Submitting);
        // A second claim loses.
        assert!(order.claim_submission().is_err());
    }

    #[test]
    fn test_fail_submission_falls_back_to_paid() {
        let mut order = paid_order();
        order.claim_submission().unwrap();
        let failure = order.fail_submission("HTTP 500", true, 5).unwrap();

        assert_eq!(order.status(), OrderStatus::Paid);
        assert_eq!(order.submission_attempts(), 1);
        assert_eq!(failure.attempt, 1);
        assert!(failure.retryable);
        assert!(!order.needs_attention());
        assert!(order.is_retryable(5));
    }

    #[test]
    fn test_permanent_failure_flags_order() {
        let mut order = paid_order();
        order.claim_submission().unwrap();
        order.fail_submission("bad address", false, 5).unwrap();
        assert!(order.needs_attention());
        assert!(!order.is_retryable(5));
    }

    #[test]
    fn test_attempt_bound_flags_order() {
        let mut order = paid_order();
        for _ in 0..3 {
            order.claim_submission().unwrap();
            order.fail_submission("HTTP 503", true, 3).unwrap();
        }
        assert_eq!(order.submission_attempts(), 3);
        assert_eq!(order.status(), OrderStatus::Paid);
        assert!(order.needs_attention());
    }

    #[test]
    fn test_release_does_not_count_attempt() {
        let mut order = paid_order();
        order.claim_submission().unwrap();
        order.release_submission().unwrap();
        assert_eq!(order.status(), OrderStatus::Paid);
        assert_eq!(order.submission_attempts(), 0);
    }

    #[test]
    fn test_release_stale_leaves_fresh_claim() {
        let mut order = paid_order();
        let before_claim = Utc::now() - chrono::Duration::seconds(1);
        order.claim_submission().unwrap();

        assert_eq!(order.release_stale_submission(before_claim), Ok(false));
        assert_eq!(order.status(), OrderStatus::Submitting);

        let after_claim = order.updated_at() + chrono::Duration::seconds(1);
        assert_eq!(order.release_stale_submission(after_claim), Ok(true));
        assert_eq!(order.status(), OrderStatus::Paid);
        assert!(order.release_stale_submission(after_claim).is_err());
    }

    #[test]
    fn test_fulfillment_id_is_set_once() {
        let mut order = paid_order();
        order.claim_submission().unwrap();
        order.complete_submission("D1").unwrap();
        assert_eq!(order.fulfillment_order_id(), Some("D1"));

        assert_eq!(
            order.claim_submission().unwrap_err(),
            OrderError::AlreadySubmitted {
                fulfillment_order_id: "D1".into()
            }
        );
    }

    #[test]
    fn test_shipment_is_idempotent() {
        let mut order = paid_order();
        order.claim_submission().unwrap();
        order.complete_submission("D1").unwrap();

        let first = order
            .mark_shipped(TrackingInfo {
                number: "TRK123".into(),
                url: Some("https://track/TRK123".into()),
            })
            .unwrap();
        assert!(first);

        let second = order
            .mark_shipped(TrackingInfo {
                number: "OTHER".into(),
                url: None,
            })
            .unwrap();
        assert!(!second);
        assert_eq!(order.tracking_number(), Some("TRK123"));
        assert_eq!(order.tracking_url(), Some("https://track/TRK123"));
    }

    #[test]
    fn test_shipment_before_confirmation_converges() {
        let mut order = paid_order();
        order.claim_submission().unwrap();
        order.complete_submission("D1").unwrap();
        order
            .mark_shipped(TrackingInfo {
                number: "TRK".into(),
                url: None,
            })
            .unwrap();
        // Late confirmation is absorbed.
        assert!(!order.confirm().unwrap());
        assert_eq!(order.status(), OrderStatus::Fulfilled);
    }

    #[test]
    fn test_terminal_states_never_regress() {
        let mut order = paid_order();
        order.mark_fulfillment_failed().unwrap();
        assert!(!order.mark_fulfillment_failed().unwrap());
        assert!(
            order
                .mark_shipped(TrackingInfo {
                    number: "TRK".into(),
                    url: None
                })
                .is_err()
        );
        assert!(order.claim_submission().is_err());
        assert_eq!(order.status(), OrderStatus::FulfillmentFailed);
    }
}
