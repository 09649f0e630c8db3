//! Prometheus metrics endpoint.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use providers::CircuitState;

use super::StatusState;

/// GET /metrics — Prometheus exposition, with breaker state gauges
/// refreshed at scrape time (0 closed, 1 half-open, 2 open).
pub async fn get(State(state): State<Arc<StatusState>>) -> impl IntoResponse {
    for breaker in &state.breakers {
        let value = match breaker.state() {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        };
        metrics::gauge!("circuit_breaker_state", "breaker" => breaker.name().to_string())
            .set(value);
    }

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.metrics.render(),
    )
}
