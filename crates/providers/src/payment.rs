//! Payment provider trait, hosted-checkout HTTP client and in-memory
//! implementation.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use domain::{CustomerContact, Order, OrderItem, PaymentConfirmation, ShippingAddress};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::breaker::CircuitBreaker;
use crate::error::{ProviderError, Result};
use crate::http;

/// Where the hosted checkout may ship and which shipping rates it offers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShippingRules {
    /// ISO 3166-1 alpha-2 country codes.
    pub allowed_countries: Vec<String>,
    /// Provider shipping rate ids offered at checkout.
    pub shipping_rate_ids: Vec<String>,
}

/// A hosted checkout session the customer is redirected to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    pub url: String,
}

/// A checkout session as reported by the payment provider.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionDetails {
    pub id: String,
    /// `"paid"`, `"unpaid"` or `"no_payment_required"`.
    pub payment_status: String,
    pub payment_intent_id: Option<String>,
    pub client_reference_id: Option<String>,
    /// `metadata.order_id`.
    pub metadata_order_id: Option<String>,
    pub customer_email: Option<String>,
    pub customer_name: Option<String>,
    pub shipping: Option<ShippingAddress>,
}

impl SessionDetails {
    /// Returns true if the provider considers the session paid.
    pub fn is_paid(&self) -> bool {
        self.payment_status == "paid"
    }

    /// Reads the fields the bridge needs from a checkout session object.
    ///
    /// `payment_intent` may be a bare id or an expanded object. The shipping
    /// address is taken from `collected_information.shipping_details`, then
    /// `shipping_details`, then `customer_details`.
    pub fn from_json(session: &Value) -> Result<Self> {
        let id = str_at(session, "/id")
            .ok_or_else(|| ProviderError::Decode("checkout session has no id".into()))?;

        let payment_intent_id = match session.get("payment_intent") {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Object(obj)) => obj.get("id").and_then(Value::as_str).map(str::to_string),
            _ => None,
        };

        let shipping = ["/collected_information/shipping_details", "/shipping_details", "/customer_details"]
            .iter()
            .filter_map(|path| session.pointer(path))
            .find_map(address_from_json);

        Ok(Self {
            id,
            payment_status: str_at(session, "/payment_status").unwrap_or_default(),
            payment_intent_id,
            client_reference_id: str_at(session, "/client_reference_id"),
            metadata_order_id: str_at(session, "/metadata/order_id"),
            customer_email: str_at(session, "/customer_details/email")
                .or_else(|| str_at(session, "/customer_email")),
            customer_name: str_at(session, "/customer_details/name"),
            shipping,
        })
    }

    /// Builds the confirmation applied to the order when it is marked paid.
    pub fn confirmation(&self) -> PaymentConfirmation {
        let contact = self.customer_email.as_ref().map(|email| {
            CustomerContact::new(email.clone(), self.customer_name.clone().unwrap_or_default())
        });

        PaymentConfirmation {
            session_id: self.id.clone(),
            payment_intent_id: self.payment_intent_id.clone(),
            contact,
            shipping: self.shipping.clone(),
        }
    }
}

fn str_at(value: &Value, pointer: &str) -> Option<String> {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn address_from_json(details: &Value) -> Option<ShippingAddress> {
    let address = details.get("address")?;
    let line1 = str_at(address, "/line1")?;
    Some(ShippingAddress {
        name: str_at(details, "/name").unwrap_or_default(),
        line1,
        line2: str_at(address, "/line2"),
        city: str_at(address, "/city").unwrap_or_default(),
        state: str_at(address, "/state"),
        postal_code: str_at(address, "/postal_code").unwrap_or_default(),
        country: str_at(address, "/country").unwrap_or_default(),
    })
}

/// Trait for the hosted-checkout payment provider.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Opens a hosted checkout session for an order.
    async fn create_checkout_session(
        &self,
        order: &Order,
        items: &[OrderItem],
        shipping: &ShippingRules,
    ) -> Result<CheckoutSession>;

    /// Fetches a session with its payment intent expanded.
    async fn get_checkout_session(&self, session_id: &str) -> Result<SessionDetails>;
}

/// Connection settings for [`PaymentClient`].
#[derive(Debug, Clone)]
pub struct PaymentClientConfig {
    pub base_url: String,
    pub secret_key: String,
    pub success_url: String,
    pub cancel_url: String,
    pub timeout: Duration,
}

/// Form fields for a checkout session, in the provider's bracket notation.
fn checkout_form(
    config: &PaymentClientConfig,
    order: &Order,
    items: &[OrderItem],
    shipping: &ShippingRules,
) -> Result<Vec<(String, String)>> {
    if items.is_empty() {
        return Err(ProviderError::InvalidRequest("order has no items".into()));
    }

    let order_id = order.id().to_string();
    let mut form = vec![
        ("mode".to_string(), "payment".to_string()),
        ("success_url".to_string(), config.success_url.clone()),
        ("cancel_url".to_string(), config.cancel_url.clone()),
        ("client_reference_id".to_string(), order_id.clone()),
        ("metadata[order_id]".to_string(), order_id.clone()),
        ("payment_intent_data[metadata][order_id]".to_string(), order_id),
    ];
    if !order.contact().email.is_empty() {
        form.push(("customer_email".to_string(), order.contact().email.clone()));
    }

    for (i, item) in items.iter().enumerate() {
        let prefix = format!("line_items[{i}]");
        form.push((format!("{prefix}[quantity]"), item.quantity.to_string()));
        form.push((format!("{prefix}[price_data][currency]"), order.currency().to_string()));
        form.push((
            format!("{prefix}[price_data][unit_amount]"),
            item.unit_price.minor_units().to_string(),
        ));
        form.push((
            format!("{prefix}[price_data][product_data][name]"),
            item.display_name(),
        ));
    }

    for (i, country) in shipping.allowed_countries.iter().enumerate() {
        form.push((
            format!("shipping_address_collection[allowed_countries][{i}]"),
            country.clone(),
        ));
    }
    for (i, rate) in shipping.shipping_rate_ids.iter().enumerate() {
        form.push((format!("shipping_options[{i}][shipping_rate]"), rate.clone()));
    }

    Ok(form)
}

/// HTTP client for the payment provider's checkout API.
///
/// Every request goes through the provider's circuit breaker.
pub struct PaymentClient {
    http: reqwest::Client,
    config: PaymentClientConfig,
    breaker: Arc<CircuitBreaker>,
}

impl PaymentClient {
    /// Creates a new client.
    pub fn new(config: PaymentClientConfig, breaker: Arc<CircuitBreaker>) -> Result<Self> {
        Ok(Self {
            http: http::build_client(config.timeout)?,
            config,
            breaker,
        })
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    async fn post_session(&self, form: &[(String, String)]) -> Result<CheckoutSession> {
        let response = self
            .http
            .post(http::join(&self.config.base_url, "v1/checkout/sessions"))
            .bearer_auth(&self.config.secret_key)
            .form(form)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(http::error_from_response(response).await);
        }

        response
            .json::<CheckoutSession>()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))
    }

    async fn fetch_session(&self, session_id: &str) -> Result<SessionDetails> {
        let response = self
            .http
            .get(http::join(
                &self.config.base_url,
                &format!("v1/checkout/sessions/{session_id}"),
            ))
            .bearer_auth(&self.config.secret_key)
            .query(&[("expand[]", "payment_intent")])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(http::error_from_response(response).await);
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;
        SessionDetails::from_json(&body)
    }
}

#[async_trait]
impl PaymentProvider for PaymentClient {
    #[tracing::instrument(skip(self, order, items, shipping), fields(order_id = %order.id()))]
    async fn create_checkout_session(
        &self,
        order: &Order,
        items: &[OrderItem],
        shipping: &ShippingRules,
    ) -> Result<CheckoutSession> {
        let form = checkout_form(&self.config, order, items, shipping)?;

        let result = self
            .breaker
            .execute(|| self.post_session(&form))
            .await
            .map_err(ProviderError::from);

        match &result {
            Ok(session) => tracing::info!(session_id = %session.id, "checkout session created"),
            Err(e) => tracing::warn!(error = %e, "checkout session creation failed"),
        }
        result
    }

    #[tracing::instrument(skip(self))]
    async fn get_checkout_session(&self, session_id: &str) -> Result<SessionDetails> {
        let result = self
            .breaker
            .execute(|| self.fetch_session(session_id))
            .await
            .map_err(ProviderError::from);

        if let Err(e) = &result {
            tracing::warn!(error = %e, "checkout session fetch failed");
        }
        result
    }
}

#[derive(Debug, Default)]
struct InMemoryPaymentState {
    sessions: HashMap<String, SessionDetails>,
    failures: VecDeque<ProviderError>,
    next_id: u32,
}

/// In-memory payment provider for testing.
///
/// Created sessions start unpaid; tests mark them paid or replace them with
/// [`InMemoryPaymentProvider::put_session`].
#[derive(Clone, Default)]
pub struct InMemoryPaymentProvider {
    state: Arc<Mutex<InMemoryPaymentState>>,
}

impl InMemoryPaymentProvider {
    /// Creates a new in-memory provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next call fail with `error`.
    pub async fn fail_next(&self, error: ProviderError) {
        self.state.lock().await.failures.push_back(error);
    }

    /// Stores or replaces a session.
    pub async fn put_session(&self, session: SessionDetails) {
        self.state
            .lock()
            .await
            .sessions
            .insert(session.id.clone(), session);
    }

    /// Returns a stored session.
    pub async fn session(&self, session_id: &str) -> Option<SessionDetails> {
        self.state.lock().await.sessions.get(session_id).cloned()
    }

    /// Number of sessions created or stored.
    pub async fn session_count(&self) -> usize {
        self.state.lock().await.sessions.len()
    }
}

#[async_trait]
impl PaymentProvider for InMemoryPaymentProvider {
    async fn create_checkout_session(
        &self,
        order: &Order,
        items: &[OrderItem],
        _shipping: &ShippingRules,
    ) -> Result<CheckoutSession> {
        let mut state = self.state.lock().await;
        if let Some(error) = state.failures.pop_front() {
            return Err(error);
        }
        if items.is_empty() {
            return Err(ProviderError::InvalidRequest("order has no items".into()));
        }

        state.next_id += 1;
        let id = format!("cs_test_{}", state.next_id);
        state.sessions.insert(
            id.clone(),
            SessionDetails {
                id: id.clone(),
                payment_status: "unpaid".to_string(),
                client_reference_id: Some(order.id().to_string()),
                metadata_order_id: Some(order.id().to_string()),
                customer_email: Some(order.contact().email.clone()).filter(|e| !e.is_empty()),
                ..SessionDetails::default()
            },
        );

        Ok(CheckoutSession {
            url: format!("https://checkout.test/pay/{id}"),
            id,
        })
    }

    async fn get_checkout_session(&self, session_id: &str) -> Result<SessionDetails> {
        let mut state = self.state.lock().await;
        if let Some(error) = state.failures.pop_front() {
            return Err(error);
        }
        state
            .sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| ProviderError::Http {
                status: 404,
                message: format!("No such checkout.session: '{session_id}'"),
            })
    }
}

#[cfg(test)]
mod tests {
    use domain::{Money, NewOrderItem};
    use serde_json::json;

    use super::*;

    fn config() -> PaymentClientConfig {
        PaymentClientConfig {
            base_url: "https://payments.test".into(),
            secret_key: "sk_test".into(),
            success_url: "https://shop.test/thanks".into(),
            cancel_url: "https://shop.test/cart".into(),
            timeout: Duration::from_secs(15),
        }
    }

    fn order() -> (Order, Vec<OrderItem>) {
        Order::create(
            CustomerContact::new("buyer@example.com", "Jane Doe"),
            "USD",
            None,
            vec![
                NewOrderItem::new("Poster", "A2", 2, Money::from_minor(1500), "sv-1"),
                NewOrderItem::new("Mug", "", 1, Money::from_minor(1200), "sv-2"),
            ],
        )
        .unwrap()
    }

    fn field<'a>(form: &'a [(String, String)], key: &str) -> Option<&'a str> {
        form.iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn test_checkout_form() {
        let (order, items) = order();
        let rules = ShippingRules {
            allowed_countries: vec!["US".into(), "CA".into()],
            shipping_rate_ids: vec!["shr_1".into()],
        };
        let form = checkout_form(&config(), &order, &items, &rules).unwrap();
        let id = order.id().to_string();

        assert_eq!(field(&form, "mode"), Some("payment"));
        assert_eq!(field(&form, "client_reference_id"), Some(id.as_str()));
        assert_eq!(field(&form, "metadata[order_id]"), Some(id.as_str()));
        assert_eq!(field(&form, "line_items[0][quantity]"), Some("2"));
        assert_eq!(field(&form, "line_items[0][price_data][currency]"), Some("usd"));
        assert_eq!(field(&form, "line_items[0][price_data][unit_amount]"), Some("1500"));
        assert_eq!(
            field(&form, "line_items[0][price_data][product_data][name]"),
            Some("Poster - A2")
        );
        assert_eq!(field(&form, "line_items[1][price_data][product_data][name]"), Some("Mug"));
        assert_eq!(
            field(&form, "shipping_address_collection[allowed_countries][1]"),
            Some("CA")
        );
        assert_eq!(field(&form, "shipping_options[0][shipping_rate]"), Some("shr_1"));
    }

    #[test]
    fn test_session_from_json_with_expanded_intent() {
        let session = json!({
            "id": "cs_1",
            "payment_status": "paid",
            "client_reference_id": "ref",
            "metadata": {"order_id": "O1"},
            "payment_intent": {"id": "pi_1", "status": "succeeded"},
            "customer_details": {"email": "buyer@example.com", "name": "Jane Doe"},
            "shipping_details": {
                "name": "Jane Doe",
                "address": {
                    "line1": "1 Main St",
                    "line2": null,
                    "city": "Springfield",
                    "state": "IL",
                    "postal_code": "62701",
                    "country": "US"
                }
            }
        });

        let details = SessionDetails::from_json(&session).unwrap();
        assert!(details.is_paid());
        assert_eq!(details.payment_intent_id.as_deref(), Some("pi_1"));
        assert_eq!(details.metadata_order_id.as_deref(), Some("O1"));
        assert_eq!(details.client_reference_id.as_deref(), Some("ref"));

        let shipping = details.shipping.clone().unwrap();
        assert_eq!(shipping.line1, "1 Main St");
        assert_eq!(shipping.line2, None);
        assert_eq!(shipping.state.as_deref(), Some("IL"));

        let confirmation = details.confirmation();
        assert_eq!(confirmation.session_id, "cs_1");
        assert_eq!(confirmation.contact.unwrap().email, "buyer@example.com");
    }

    #[test]
    fn test_session_from_json_minimal() {
        let details =
            SessionDetails::from_json(&json!({"id": "cs_2", "payment_intent": "pi_2"})).unwrap();
        assert!(!details.is_paid());
        assert_eq!(details.payment_intent_id.as_deref(), Some("pi_2"));
        assert!(details.shipping.is_none());
        assert!(details.confirmation().contact.is_none());

        assert!(SessionDetails::from_json(&json!({"object": "checkout.session"})).is_err());
    }

    #[tokio::test]
    async fn test_in_memory_sessions() {
        let provider = InMemoryPaymentProvider::new();
        let (order, items) = order();

        let session = provider
            .create_checkout_session(&order, &items, &ShippingRules::default())
            .await
            .unwrap();
        assert!(session.url.ends_with(&session.id));

        let details = provider.get_checkout_session(&session.id).await.unwrap();
        assert!(!details.is_paid());
        assert_eq!(details.metadata_order_id, Some(order.id().to_string()));

        provider.fail_next(ProviderError::Timeout).await;
        assert_eq!(
            provider.get_checkout_session(&session.id).await,
            Err(ProviderError::Timeout)
        );
        assert!(provider.get_checkout_session("cs_missing").await.is_err());
    }
}
