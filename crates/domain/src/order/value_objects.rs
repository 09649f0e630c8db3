//! Value objects for the order domain.

use common::{Money, OrderId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::OrderError;

/// Customer contact details captured at checkout.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CustomerContact {
    pub email: String,
    pub name: String,
}

impl CustomerContact {
    /// Creates a new contact.
    pub fn new(email: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            name: name.into(),
        }
    }
}

/// Shipping address in the shape both providers understand.
///
/// `state` is a region code (e.g. `"CA"`), `country` an ISO 3166-1 alpha-2
/// code.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ShippingAddress {
    pub name: String,
    pub line1: String,
    pub line2: Option<String>,
    pub city: String,
    pub state: Option<String>,
    pub postal_code: String,
    pub country: String,
}

impl ShippingAddress {
    /// Returns true if the fields the fulfillment provider requires are present.
    pub fn is_complete(&self) -> bool {
        !self.name.trim().is_empty()
            && !self.line1.trim().is_empty()
            && !self.city.trim().is_empty()
            && !self.postal_code.trim().is_empty()
            && self.country.trim().len() == 2
    }
}

/// Tracking details reported by the fulfillment provider on shipment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingInfo {
    pub number: String,
    pub url: Option<String>,
}

/// Payment details applied when the payment provider reports success.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PaymentConfirmation {
    pub session_id: String,
    pub payment_intent_id: Option<String>,
    /// Contact from the provider, when it is authoritative.
    pub contact: Option<CustomerContact>,
    /// Shipping address collected by the hosted checkout.
    pub shipping: Option<ShippingAddress>,
}

/// An item to be placed on a new order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewOrderItem {
    pub product_name: String,
    pub variant_name: String,
    pub quantity: u32,
    pub unit_price: Money,
    /// The fulfillment provider's variant identifier.
    pub fulfillment_variant_id: String,
}

impl NewOrderItem {
    /// Creates a new order item request.
    pub fn new(
        product_name: impl Into<String>,
        variant_name: impl Into<String>,
        quantity: u32,
        unit_price: Money,
        fulfillment_variant_id: impl Into<String>,
    ) -> Self {
        Self {
            product_name: product_name.into(),
            variant_name: variant_name.into(),
            quantity,
            unit_price,
            fulfillment_variant_id: fulfillment_variant_id.into(),
        }
    }
}

/// A line on an order. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    pub id: Uuid,
    pub order_id: OrderId,
    pub product_name: String,
    pub variant_name: String,
    pub quantity: u32,
    pub unit_price: Money,
    pub line_price: Money,
    pub fulfillment_variant_id: String,
}

impl OrderItem {
    pub(crate) fn from_new(order_id: OrderId, item: NewOrderItem) -> Result<Self, OrderError> {
        let line_price = item
            .unit_price
            .checked_mul(item.quantity)
            .ok_or(OrderError::AmountOverflow)?;
        Ok(Self {
            id: Uuid::new_v4(),
            order_id,
            line_price,
            product_name: item.product_name,
            variant_name: item.variant_name,
            quantity: item.quantity,
            unit_price: item.unit_price,
            fulfillment_variant_id: item.fulfillment_variant_id,
        })
    }

    /// Returns a display name combining product and variant.
    pub fn display_name(&self) -> String {
        if self.variant_name.is_empty() {
            self.product_name.clone()
        } else {
            format!("{} - {}", self.product_name, self.variant_name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address() -> ShippingAddress {
        ShippingAddress {
            name: "Ada Lovelace".into(),
            line1: "12 St James's Square".into(),
            line2: None,
            city: "London".into(),
            state: None,
            postal_code: "SW1Y 4JH".into(),
            country: "GB".into(),
        }
    }

    #[test]
    fn test_complete_address() {
        assert!(address().is_complete());
    }

    #[test]
    fn test_incomplete_address() {
        let mut addr = address();
        addr.line1 = "  ".into();
        assert!(!addr.is_complete());

        let mut addr = address();
        addr.country = "GBR".into();
        assert!(!addr.is_complete());
    }

    #[test]
    fn test_line_price_is_computed() {
        let order_id = OrderId::new();
        let item = OrderItem::from_new(
            order_id,
            NewOrderItem::new("Poster", "A2", 3, Money::from_minor(1500), "4011"),
        )
        .unwrap();
        assert_eq!(item.order_id, order_id);
        assert_eq!(item.line_price, Money::from_minor(4500));
        assert_eq!(item.display_name(), "Poster - A2");
    }

    #[test]
    fn test_line_price_overflow() {
        let result = OrderItem::from_new(
            OrderId::new(),
            NewOrderItem::new("Poster", "A2", 3, Money::from_minor(i64::MAX / 2), "4011"),
        );
        assert_eq!(result.unwrap_err(), OrderError::AmountOverflow);
    }
}
