//! Fulfillment provider trait, HTTP client and in-memory implementation.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use domain::{Order, OrderItem};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::breaker::CircuitBreaker;
use crate::error::{ProviderError, Result};
use crate::http;

/// Trait for the print-on-demand fulfillment provider.
#[async_trait]
pub trait FulfillmentProvider: Send + Sync {
    /// Creates a draft order at the provider and returns its id.
    async fn submit_order(&self, order: &Order, items: &[OrderItem]) -> Result<String>;

    /// Finalizes a draft order so the provider starts production.
    async fn confirm_order(&self, fulfillment_order_id: &str) -> Result<()>;
}

/// Connection settings for [`FulfillmentClient`].
#[derive(Debug, Clone)]
pub struct FulfillmentClientConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
}

#[derive(Debug, Serialize)]
struct DraftRequest<'a> {
    external_id: String,
    recipient: Recipient<'a>,
    items: Vec<DraftItem<'a>>,
}

#[derive(Debug, Serialize)]
struct Recipient<'a> {
    name: &'a str,
    address1: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    address2: Option<&'a str>,
    city: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    state_code: Option<&'a str>,
    country_code: &'a str,
    zip: &'a str,
    email: &'a str,
}

#[derive(Debug, Serialize)]
struct DraftItem<'a> {
    sync_variant_id: &'a str,
    quantity: u32,
    retail_price: String,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct DraftOrder {
    id: serde_json::Value,
}

fn draft_request<'a>(order: &'a Order, items: &'a [OrderItem]) -> Result<DraftRequest<'a>> {
    let shipping = order
        .shipping()
        .filter(|s| s.is_complete())
        .ok_or_else(|| {
            ProviderError::InvalidRequest("order has no complete shipping address".into())
        })?;
    if items.is_empty() {
        return Err(ProviderError::InvalidRequest("order has no items".into()));
    }

    Ok(DraftRequest {
        external_id: order.id().to_string(),
        recipient: Recipient {
            name: &shipping.name,
            address1: &shipping.line1,
            address2: shipping.line2.as_deref().filter(|s| !s.is_empty()),
            city: &shipping.city,
            state_code: shipping.state.as_deref().filter(|s| !s.is_empty()),
            country_code: &shipping.country,
            zip: &shipping.postal_code,
            email: &order.contact().email,
        },
        items: items
            .iter()
            .map(|item| DraftItem {
                sync_variant_id: &item.fulfillment_variant_id,
                quantity: item.quantity,
                retail_price: item.unit_price.to_decimal_string(),
            })
            .collect(),
    })
}

/// HTTP client for the fulfillment provider's order API.
///
/// Every request goes through the provider's circuit breaker.
pub struct FulfillmentClient {
    http: reqwest::Client,
    config: FulfillmentClientConfig,
    breaker: Arc<CircuitBreaker>,
}

impl FulfillmentClient {
    /// Creates a new client.
    pub fn new(config: FulfillmentClientConfig, breaker: Arc<CircuitBreaker>) -> Result<Self> {
        Ok(Self {
            http: http::build_client(config.timeout)?,
            config,
            breaker,
        })
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    async fn post_draft(&self, body: &DraftRequest<'_>) -> Result<String> {
        let response = self
            .http
            .post(http::join(&self.config.base_url, "orders"))
            .bearer_auth(&self.config.api_key)
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(http::error_from_response(response).await);
        }

        let envelope: Envelope<DraftOrder> = response
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;

        match envelope.result.map(|r| r.id) {
            Some(serde_json::Value::Number(n)) => Ok(n.to_string()),
            Some(serde_json::Value::String(s)) if !s.is_empty() => Ok(s),
            _ => Err(ProviderError::Decode("response has no order id".into())),
        }
    }

    async fn post_confirm(&self, fulfillment_order_id: &str) -> Result<()> {
        let response = self
            .http
            .post(http::join(
                &self.config.base_url,
                &format!("orders/{fulfillment_order_id}/confirm"),
            ))
            .bearer_auth(&self.config.api_key)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(http::error_from_response(response).await);
        }
        Ok(())
    }
}

#[async_trait]
impl FulfillmentProvider for FulfillmentClient {
    #[tracing::instrument(skip(self, order, items), fields(order_id = %order.id()))]
    async fn submit_order(&self, order: &Order, items: &[OrderItem]) -> Result<String> {
        let body = draft_request(order, items)?;
        let started = std::time::Instant::now();

        let result = self
            .breaker
            .execute(|| self.post_draft(&body))
            .await
            .map_err(ProviderError::from);

        metrics::histogram!(
            "provider_request_duration_seconds",
            "provider" => "fulfillment",
            "operation" => "submit_order"
        )
        .record(started.elapsed().as_secs_f64());
        match &result {
            Ok(id) => tracing::info!(fulfillment_order_id = %id, "draft order created"),
            Err(e) => tracing::warn!(error = %e, "draft order creation failed"),
        }
        result
    }

    #[tracing::instrument(skip(self))]
    async fn confirm_order(&self, fulfillment_order_id: &str) -> Result<()> {
        let result = self
            .breaker
            .execute(|| self.post_confirm(fulfillment_order_id))
            .await
            .map_err(ProviderError::from);

        if let Err(e) = &result {
            tracing::warn!(error = %e, "draft order confirmation failed");
        }
        result
    }
}

#[derive(Debug, Default)]
struct InMemoryFulfillmentState {
    drafts: Vec<String>,
    confirmed: Vec<String>,
    submit_failures: VecDeque<ProviderError>,
    confirm_failures: VecDeque<ProviderError>,
    submit_calls: usize,
    submit_delay: Option<Duration>,
    next_id: u32,
}

/// In-memory fulfillment provider for testing.
///
/// Queued failures are returned by the next calls in order. When built with
/// a breaker, calls go through it just like the HTTP client's.
#[derive(Clone, Default)]
pub struct InMemoryFulfillmentProvider {
    state: Arc<Mutex<InMemoryFulfillmentState>>,
    breaker: Option<Arc<CircuitBreaker>>,
}

impl InMemoryFulfillmentProvider {
    /// Creates a new in-memory provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a provider whose calls go through `breaker`.
    pub fn with_breaker(breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            state: Arc::default(),
            breaker: Some(breaker),
        }
    }

    /// Makes the next `submit_order` call fail with `error`.
    pub async fn fail_next_submit(&self, error: ProviderError) {
        self.state.lock().await.submit_failures.push_back(error);
    }

    /// Makes the next `confirm_order` call fail with `error`.
    pub async fn fail_next_confirm(&self, error: ProviderError) {
        self.state.lock().await.confirm_failures.push_back(error);
    }

    /// Makes every `submit_order` call take `delay` before it answers.
    pub async fn set_submit_delay(&self, delay: Duration) {
        self.state.lock().await.submit_delay = Some(delay);
    }

    /// Number of `submit_order` calls that reached the provider.
    pub async fn submit_calls(&self) -> usize {
        self.state.lock().await.submit_calls
    }

    /// Draft ids created so far.
    pub async fn drafts(&self) -> Vec<String> {
        self.state.lock().await.drafts.clone()
    }

    /// Draft ids confirmed so far.
    pub async fn confirmed(&self) -> Vec<String> {
        self.state.lock().await.confirmed.clone()
    }

    async fn do_submit(&self) -> Result<String> {
        let delay = {
            let mut state = self.state.lock().await;
            state.submit_calls += 1;
            state.submit_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().await;
        if let Some(error) = state.submit_failures.pop_front() {
            return Err(error);
        }
        state.next_id += 1;
        let id = format!("D{}", state.next_id);
        state.drafts.push(id.clone());
        Ok(id)
    }

    async fn do_confirm(&self, fulfillment_order_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(error) = state.confirm_failures.pop_front() {
            return Err(error);
        }
        if !state.drafts.iter().any(|d| d == fulfillment_order_id) {
            return Err(ProviderError::Http {
                status: 404,
                message: format!("order {fulfillment_order_id} not found"),
            });
        }
        if !state.confirmed.iter().any(|d| d == fulfillment_order_id) {
            state.confirmed.push(fulfillment_order_id.to_string());
        }
        Ok(())
    }
}

#[async_trait]
impl FulfillmentProvider for InMemoryFulfillmentProvider {
    async fn submit_order(&self, order: &Order, items: &[OrderItem]) -> Result<String> {
        draft_request(order, items)?;
        match &self.breaker {
            Some(breaker) => Ok(breaker.execute(|| self.do_submit()).await?),
            None => self.do_submit().await,
        }
    }

    async fn confirm_order(&self, fulfillment_order_id: &str) -> Result<()> {
        match &self.breaker {
            Some(breaker) => Ok(breaker
                .execute(|| self.do_confirm(fulfillment_order_id))
                .await?),
            None => self.do_confirm(fulfillment_order_id).await,
        }
    }
}
