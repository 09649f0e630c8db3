//! Health check endpoint.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use providers::CircuitState;
use serde::Serialize;

use super::StatusState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    /// Current state of each provider breaker, by name.
    pub breakers: BTreeMap<String, CircuitState>,
}

/// GET /health — process liveness plus breaker states.
///
/// An open breaker does not make the service unhealthy; webhooks are still
/// accepted and the retry worker catches up once it closes.
pub async fn check(State(state): State<Arc<StatusState>>) -> Json<HealthResponse> {
    let breakers = state
        .breakers
        .iter()
        .map(|b| (b.name().to_string(), b.state()))
        .collect();

    Json(HealthResponse {
        status: "ok",
        breakers,
    })
}
