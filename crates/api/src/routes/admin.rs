//! Operator endpoints, behind a bearer token.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, header};
use common::OrderId;
use fulfillment::webhooks::signature::token_matches;
use fulfillment::{OrderDetails, SubmissionOutcome};
use order_store::OrderStore;
use serde::Serialize;

use crate::AppState;
use crate::error::ApiError;

#[derive(Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ResubmitResponse {
    Submitted { fulfillment_order_id: String },
    AlreadySubmitted { fulfillment_order_id: String },
    NotEligible { status: String },
    Deferred,
    Failed {
        attempt: u32,
        retryable: bool,
        needs_attention: bool,
        error: String,
    },
}

impl From<SubmissionOutcome> for ResubmitResponse {
    fn from(outcome: SubmissionOutcome) -> Self {
        match outcome {
            SubmissionOutcome::Submitted {
                fulfillment_order_id,
            } => ResubmitResponse::Submitted {
                fulfillment_order_id,
            },
            SubmissionOutcome::AlreadySubmitted {
                fulfillment_order_id,
            } => ResubmitResponse::AlreadySubmitted {
                fulfillment_order_id,
            },
            SubmissionOutcome::NotEligible { status } => ResubmitResponse::NotEligible {
                status: status.to_string(),
            },
            SubmissionOutcome::Deferred => ResubmitResponse::Deferred,
            SubmissionOutcome::Failed {
                attempt,
                retryable,
                needs_attention,
                error,
            } => ResubmitResponse::Failed {
                attempt,
                retryable,
                needs_attention,
                error,
            },
        }
    }
}

fn authorize(headers: &HeaderMap, admin_token: Option<&str>) -> Result<(), ApiError> {
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or_default();

    match admin_token {
        Some(expected) if token_matches(presented, expected) => Ok(()),
        _ => Err(ApiError::Unauthorized("invalid admin token".to_string())),
    }
}

fn parse_order_id(id: &str) -> Result<OrderId, ApiError> {
    id.parse()
        .map_err(|_| ApiError::BadRequest(format!("Invalid order id: {id}")))
}

/// GET /admin/orders/{id} — order with its items and submission failures.
#[tracing::instrument(skip(state, headers))]
pub async fn get_order<S: OrderStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<OrderDetails>, ApiError> {
    authorize(&headers, state.admin_token.as_deref())?;
    let order_id = parse_order_id(&id)?;

    let details = state.lifecycle.details(order_id).await?;
    Ok(Json(details))
}

/// POST /admin/orders/{id}/resubmit — clear the attention flag and make one
/// submission attempt.
#[tracing::instrument(skip(state, headers))]
pub async fn resubmit<S: OrderStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<ResubmitResponse>, ApiError> {
    authorize(&headers, state.admin_token.as_deref())?;
    let order_id = parse_order_id(&id)?;

    let outcome = state.lifecycle.resubmit(order_id).await?;
    tracing::info!(?outcome, "operator resubmission");
    Ok(Json(outcome.into()))
}
