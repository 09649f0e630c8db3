//! Checkout: creates the order and opens its hosted payment session.

use std::sync::Arc;

use common::OrderId;
use domain::{CustomerContact, NewOrderItem, Order, ShippingAddress};
use order_store::OrderStore;
use providers::{PaymentProvider, ShippingRules};
use serde::{Deserialize, Serialize};

use crate::error::{FulfillmentError, Result};

/// A customer's checkout request.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutRequest {
    pub email: String,
    #[serde(default)]
    pub name: String,
    pub currency: String,
    pub items: Vec<NewOrderItem>,
    /// Optional; the hosted checkout collects one when absent.
    #[serde(default)]
    pub shipping: Option<ShippingAddress>,
}

/// The session the customer should be redirected to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckoutStarted {
    pub order_id: OrderId,
    pub session_id: String,
    pub checkout_url: String,
}

/// Creates orders and their payment sessions.
pub struct CheckoutService<S: OrderStore> {
    store: S,
    payment: Arc<dyn PaymentProvider>,
    shipping: ShippingRules,
}

impl<S: OrderStore> CheckoutService<S> {
    /// Creates a new checkout service.
    pub fn new(store: S, payment: Arc<dyn PaymentProvider>, shipping: ShippingRules) -> Self {
        Self {
            store,
            payment,
            shipping,
        }
    }

    /// Creates the order in `Created`, opens a hosted session and moves the
    /// order to `AwaitingPayment`.
    ///
    /// If the payment provider fails the order stays `Created` and the error
    /// is returned.
    #[tracing::instrument(skip(self, request), fields(items = request.items.len()))]
    pub async fn start_checkout(&self, request: CheckoutRequest) -> Result<CheckoutStarted> {
        if request.email.trim().is_empty() {
            return Err(FulfillmentError::InvalidPayload("email is required".into()));
        }
        if request.currency.trim().len() != 3 {
            return Err(FulfillmentError::InvalidPayload(format!(
                "invalid currency: {}",
                request.currency
            )));
        }

        let (order, items) = Order::create(
            CustomerContact::new(request.email, request.name),
            request.currency,
            request.shipping,
            request.items,
        )?;
        self.store.insert_order(&order, &items).await?;
        tracing::info!(order_id = %order.id(), total = %order.total(), "order created");

        let session = self
            .payment
            .create_checkout_session(&order, &items, &self.shipping)
            .await?;

        let (order, _) = self
            .store
            .modify_order(order.id(), |o| o.begin_payment(&session.id))
            .await?;
        metrics::counter!("checkout_sessions_total").increment(1);

        Ok(CheckoutStarted {
            order_id: order.id(),
            session_id: session.id,
            checkout_url: session.url,
        })
    }
}
