//! HTTP server for the order-fulfillment bridge.
//!
//! Exposes checkout, both provider webhooks and operator endpoints, with
//! structured logging (tracing) and Prometheus metrics.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::{get, post};
use fulfillment::{
    CheckoutService, FulfillmentWebhookHandler, OrderLifecycle, PaymentWebhookHandler,
};
use metrics_exporter_prometheus::PrometheusHandle;
use order_store::OrderStore;
use providers::{
    CircuitBreaker, FulfillmentClient, FulfillmentProvider, PaymentClient, PaymentProvider,
    ProviderError,
};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use config::Config;

/// Shared application state accessible from all order handlers.
pub struct AppState<S: OrderStore> {
    pub checkout: CheckoutService<S>,
    pub lifecycle: OrderLifecycle<S>,
    pub payment_webhooks: PaymentWebhookHandler<S>,
    pub fulfillment_webhooks: FulfillmentWebhookHandler<S>,
    pub admin_token: Option<String>,
}

/// The two provider clients and the breakers guarding them.
pub struct Providers {
    pub payment: Arc<dyn PaymentProvider>,
    pub fulfillment: Arc<dyn FulfillmentProvider>,
    pub breakers: Vec<Arc<CircuitBreaker>>,
}

impl Providers {
    /// Builds the HTTP clients, each behind its own breaker.
    pub fn from_config(config: &Config) -> Result<Self, ProviderError> {
        let payment_breaker = Arc::new(CircuitBreaker::new("payment", config.breaker()));
        let fulfillment_breaker = Arc::new(CircuitBreaker::new("fulfillment", config.breaker()));

        let payment = PaymentClient::new(config.payment_client(), payment_breaker.clone())?;
        let fulfillment =
            FulfillmentClient::new(config.fulfillment_client(), fulfillment_breaker.clone())?;

        Ok(Self {
            payment: Arc::new(payment),
            fulfillment: Arc::new(fulfillment),
            breakers: vec![payment_breaker, fulfillment_breaker],
        })
    }
}

/// Wires the services over one store and one set of providers.
pub fn create_state<S: OrderStore + Clone + 'static>(
    store: S,
    providers: &Providers,
    config: &Config,
) -> Arc<AppState<S>> {
    let lifecycle = OrderLifecycle::new(
        store.clone(),
        providers.fulfillment.clone(),
        config.lifecycle(),
    );

    Arc::new(AppState {
        checkout: CheckoutService::new(store, providers.payment.clone(), config.shipping_rules()),
        payment_webhooks: PaymentWebhookHandler::new(
            lifecycle.clone(),
            providers.payment.clone(),
            config.payment_webhook_auth(),
        ),
        fulfillment_webhooks: FulfillmentWebhookHandler::new(
            lifecycle.clone(),
            config.fulfillment_webhook(),
        ),
        lifecycle,
        admin_token: config.admin_token.clone(),
    })
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<S: OrderStore + Clone + 'static>(
    state: Arc<AppState<S>>,
    breakers: Vec<Arc<CircuitBreaker>>,
    metrics_handle: PrometheusHandle,
    request_timeout: Duration,
) -> Router {
    let status_router = Router::new()
        .route("/health", get(routes::health::check))
        .route("/metrics", get(routes::metrics::get))
        .with_state(Arc::new(routes::StatusState {
            breakers,
            metrics: metrics_handle,
        }));

    Router::new()
        .route("/checkout", post(routes::checkout::create::<S>))
        .route("/webhooks/payment", post(routes::webhooks::payment::<S>))
        .route(
            "/webhooks/fulfillment/{token}",
            post(routes::webhooks::fulfillment::<S>),
        )
        .route("/admin/orders/{id}", get(routes::admin::get_order::<S>))
        .route(
            "/admin/orders/{id}/resubmit",
            post(routes::admin::resubmit::<S>),
        )
        .with_state(state)
        .merge(status_router)
        .layer(TimeoutLayer::new(request_timeout))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
}
