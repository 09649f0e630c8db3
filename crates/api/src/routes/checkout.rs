//! Checkout endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use fulfillment::{CheckoutRequest, CheckoutStarted};
use order_store::OrderStore;

use crate::AppState;
use crate::error::ApiError;

/// POST /checkout — create an order and its hosted payment session.
#[tracing::instrument(skip_all)]
pub async fn create<S: OrderStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Json(req): Json<CheckoutRequest>,
) -> Result<(StatusCode, Json<CheckoutStarted>), ApiError> {
    let started = state.checkout.start_checkout(req).await?;
    Ok((StatusCode::CREATED, Json(started)))
}
