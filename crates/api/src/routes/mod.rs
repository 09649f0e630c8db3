//! HTTP route handlers.

pub mod admin;
pub mod checkout;
pub mod health;
pub mod metrics;
pub mod webhooks;

use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;
use providers::CircuitBreaker;

/// State for the health and metrics endpoints, independent of the store.
pub struct StatusState {
    pub breakers: Vec<Arc<CircuitBreaker>>,
    pub metrics: PrometheusHandle,
}
