//! Provider webhook endpoints.
//!
//! Both answer 200 for anything that was authenticated and understood,
//! including duplicates and events that required no action, so providers
//! stop redelivering.

use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use fulfillment::WebhookOutcome;
use order_store::OrderStore;
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::ApiError;

const SIGNATURE_HEADER: &str = "stripe-signature";

#[derive(Deserialize)]
pub struct TokenQuery {
    pub token: Option<String>,
}

#[derive(Serialize)]
pub struct WebhookAck {
    pub received: bool,
    pub outcome: WebhookOutcome,
}

impl From<WebhookOutcome> for WebhookAck {
    fn from(outcome: WebhookOutcome) -> Self {
        Self {
            received: true,
            outcome,
        }
    }
}

/// POST /webhooks/payment
#[tracing::instrument(skip_all)]
pub async fn payment<S: OrderStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, ApiError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());

    let outcome = state
        .payment_webhooks
        .handle(signature, query.token.as_deref(), &body)
        .await?;
    Ok(Json(outcome.into()))
}

/// POST /webhooks/fulfillment/{token}
#[tracing::instrument(skip_all)]
pub async fn fulfillment<S: OrderStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(token): Path<String>,
    body: Bytes,
) -> Result<Json<WebhookAck>, ApiError> {
    let outcome = state.fulfillment_webhooks.handle(&token, &body).await?;
    Ok(Json(outcome.into()))
}
