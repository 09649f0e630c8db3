//! Order lifecycle service: the guarded transitions plus the submission
//! step that talks to the fulfillment provider.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use common::OrderId;
use domain::{
    Order, OrderError, OrderItem, OrderStatus, PaymentConfirmation, SubmissionFailure,
    TrackingInfo,
};
use order_store::{OrderStore, StoreError};
use providers::FulfillmentProvider;
use serde::Serialize;
use tracing::Instrument;

use crate::error::{FulfillmentError, Result};

/// Lifecycle settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleConfig {
    /// Failed submissions after which an order is left for an operator.
    pub max_attempts: u32,
    /// Confirm provider drafts right after they are created.
    pub auto_confirm: bool,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            auto_confirm: false,
        }
    }
}

/// Result of one submission attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionOutcome {
    /// The provider accepted the order.
    Submitted { fulfillment_order_id: String },
    /// The order already carries a provider id; nothing was sent.
    AlreadySubmitted { fulfillment_order_id: String },
    /// The order is not in `Paid` (or another attempt holds the claim).
    NotEligible { status: OrderStatus },
    /// The breaker rejected the call; the order was left as it was.
    Deferred,
    /// The provider call failed and the failure was recorded.
    Failed {
        attempt: u32,
        retryable: bool,
        needs_attention: bool,
        error: String,
    },
}

/// An order with its items and failure history.
#[derive(Debug, Clone, Serialize)]
pub struct OrderDetails {
    pub order: Order,
    pub items: Vec<OrderItem>,
    pub failures: Vec<SubmissionFailure>,
}

fn transitioned(order: &Order) {
    metrics::counter!("order_transitions_total", "to" => order.status().as_str()).increment(1);
}

/// Drives orders through the fulfillment state machine.
///
/// Every mutation goes through [`OrderStore::modify_order`], so concurrent
/// webhook deliveries and retry passes see each other's writes and cannot
/// interleave on the same order.
pub struct OrderLifecycle<S: OrderStore> {
    store: S,
    fulfillment: Arc<dyn FulfillmentProvider>,
    config: LifecycleConfig,
}

impl<S: OrderStore + Clone> Clone for OrderLifecycle<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            fulfillment: Arc::clone(&self.fulfillment),
            config: self.config,
        }
    }
}

impl<S: OrderStore> OrderLifecycle<S> {
    /// Creates a new lifecycle service.
    pub fn new(store: S, fulfillment: Arc<dyn FulfillmentProvider>, config: LifecycleConfig) -> Self {
        Self {
            store,
            fulfillment,
            config,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Loads an order with its items and submission failures.
    pub async fn details(&self, order_id: OrderId) -> Result<OrderDetails> {
        let order = self
            .store
            .get_order(order_id)
            .await?
            .ok_or(FulfillmentError::OrderNotFound(order_id))?;
        let items = self.store.get_items(order_id).await?;
        let failures = self.store.submission_failures(order_id).await?;

        Ok(OrderDetails {
            order,
            items,
            failures,
        })
    }

    /// Marks an order paid. Returns the stored order and whether it changed.
    #[tracing::instrument(skip(self, confirmation), fields(session_id = %confirmation.session_id))]
    pub async fn mark_paid(
        &self,
        order_id: OrderId,
        confirmation: PaymentConfirmation,
    ) -> Result<(Order, bool)> {
        let (order, changed) = self
            .store
            .modify_order(order_id, |o| o.mark_paid(confirmation))
            .await?;

        if changed {
            transitioned(&order);
            tracing::info!("order paid");
        } else {
            tracing::debug!(status = %order.status(), "order already paid");
        }
        Ok((order, changed))
    }

    /// Marks an order's payment as failed.
    #[tracing::instrument(skip(self))]
    pub async fn mark_payment_failed(&self, order_id: OrderId) -> Result<(Order, bool)> {
        let (order, changed) = self
            .store
            .modify_order(order_id, |o| o.mark_payment_failed())
            .await?;

        if changed {
            transitioned(&order);
            tracing::info!("order payment failed");
        }
        Ok((order, changed))
    }

    /// Records the shipment and its tracking details.
    #[tracing::instrument(skip(self, tracking), fields(tracking_number = %tracking.number))]
    pub async fn mark_shipped(
        &self,
        order_id: OrderId,
        tracking: TrackingInfo,
    ) -> Result<(Order, bool)> {
        let (order, changed) = self
            .store
            .modify_order(order_id, |o| o.mark_shipped(tracking))
            .await?;

        if changed {
            transitioned(&order);
            tracing::info!("order fulfilled");
        } else {
            tracing::info!("order already fulfilled, shipment ignored");
        }
        Ok((order, changed))
    }

    /// Records a provider-side fulfillment failure.
    #[tracing::instrument(skip(self))]
    pub async fn mark_fulfillment_failed(&self, order_id: OrderId) -> Result<(Order, bool)> {
        let (order, changed) = self
            .store
            .modify_order(order_id, |o| o.mark_fulfillment_failed())
            .await?;

        if changed {
            transitioned(&order);
            tracing::warn!("order fulfillment failed at provider");
        }
        Ok((order, changed))
    }

    /// Returns an order whose claim is older than `claimed_before` to `Paid`.
    ///
    /// The age is checked inside the atomic section, so a claim renewed by
    /// another attempt since the caller looked is left alone (`Ok(false)`),
    /// as is an order no longer `Submitting`.
    #[tracing::instrument(skip(self))]
    pub async fn release_stale_claim(
        &self,
        order_id: OrderId,
        claimed_before: DateTime<Utc>,
    ) -> Result<bool> {
        match self
            .store
            .modify_order(order_id, |o| o.release_stale_submission(claimed_before))
            .await
        {
            Ok((_, released)) => {
                if released {
                    tracing::warn!("reclaimed abandoned submission");
                }
                Ok(released)
            }
            Err(StoreError::Order(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Claims the order (`Paid` ⇒ `Submitting`), calls the provider and
    /// records the result. Must run to completion once the claim is taken.
    async fn attempt_submission(&self, order_id: OrderId) -> Result<SubmissionOutcome> {
        let items = self.store.get_items(order_id).await?;

        let order = match self
            .store
            .modify_order(order_id, |o| o.claim_submission())
            .await
        {
            Ok((order, ())) => order,
            Err(StoreError::Order(OrderError::AlreadySubmitted {
                fulfillment_order_id,
            })) => {
                tracing::debug!(%fulfillment_order_id, "order already submitted");
                return Ok(SubmissionOutcome::AlreadySubmitted {
                    fulfillment_order_id,
                });
            }
            Err(StoreError::Order(OrderError::InvalidStateTransition { current_state, .. })) => {
                tracing::debug!(status = %current_state, "order not eligible for submission");
                return Ok(SubmissionOutcome::NotEligible {
                    status: current_state,
                });
            }
            Err(e) => return Err(e.into()),
        };

        let started = std::time::Instant::now();
        let result = self.fulfillment.submit_order(&order, &items).await;
        metrics::histogram!("fulfillment_submission_duration_seconds")
            .record(started.elapsed().as_secs_f64());

        match result {
            Ok(fulfillment_order_id) => {
                let (order, ()) = self
                    .store
                    .modify_order(order_id, |o| o.complete_submission(&fulfillment_order_id))
                    .await
                    .inspect_err(|e| {
                        tracing::error!(
                            %fulfillment_order_id,
                            error = %e,
                            "provider accepted order but it could not be stored"
                        );
                    })?;
                transitioned(&order);
                metrics::counter!("fulfillment_submissions_total", "outcome" => "submitted")
                    .increment(1);
                tracing::info!(%fulfillment_order_id, "order submitted for fulfillment");

                if self.config.auto_confirm {
                    self.confirm_quietly(&order).await;
                }

                Ok(SubmissionOutcome::Submitted {
                    fulfillment_order_id,
                })
            }
            Err(e) if e.is_rejection() => {
                self.store
                    .modify_order(order_id, |o| o.release_submission())
                    .await?;
                metrics::counter!("fulfillment_submissions_total", "outcome" => "deferred")
                    .increment(1);
                tracing::info!(reason = %e, "submission deferred by circuit breaker");
                Ok(SubmissionOutcome::Deferred)
            }
            Err(e) => {
                let error = e.to_string();
                let retryable = e.is_retryable();
                let (order, failure) = self
                    .store
                    .record_submission_failure(order_id, &error, retryable, self.config.max_attempts)
                    .await?;

                metrics::counter!("fulfillment_submissions_total", "outcome" => "failed")
                    .increment(1);
                if order.needs_attention() {
                    tracing::error!(
                        attempt = failure.attempt,
                        retryable,
                        %error,
                        "submission failed, order needs attention"
                    );
                } else {
                    tracing::warn!(attempt = failure.attempt, %error, "submission failed, will retry");
                }

                Ok(SubmissionOutcome::Failed {
                    attempt: failure.attempt,
                    retryable,
                    needs_attention: order.needs_attention(),
                    error,
                })
            }
        }
    }

    /// Confirms a submitted order's provider draft.
    ///
    /// Returns `Ok(false)` if the order was already confirmed or shipped.
    /// A provider error leaves the order `Submitted`.
    #[tracing::instrument(skip(self))]
    pub async fn confirm(&self, order_id: OrderId) -> Result<bool> {
        let order = self
            .store
            .get_order(order_id)
            .await?
            .ok_or(FulfillmentError::OrderNotFound(order_id))?;

        if matches!(order.status(), OrderStatus::Confirmed | OrderStatus::Fulfilled) {
            return Ok(false);
        }
        let fulfillment_order_id = match (order.status(), order.fulfillment_order_id()) {
            (OrderStatus::Submitted, Some(id)) => id.to_string(),
            (status, _) => {
                return Err(OrderError::InvalidStateTransition {
                    current_state: status,
                    action: "confirm",
                }
                .into());
            }
        };

        self.fulfillment.confirm_order(&fulfillment_order_id).await?;

        let (order, changed) = self.store.modify_order(order_id, |o| o.confirm()).await?;
        if changed {
            transitioned(&order);
            tracing::info!(%fulfillment_order_id, "order confirmed");
        }
        Ok(changed)
    }

    async fn confirm_quietly(&self, order: &Order) {
        if let Err(e) = self.confirm(order.id()).await {
            tracing::warn!(order_id = %order.id(), error = %e, "confirmation failed, order left submitted");
        }
    }

}

impl<S: OrderStore + Clone + 'static> OrderLifecycle<S> {
    /// Makes one attempt to submit a paid order to the fulfillment provider.
    ///
    /// The order is claimed (`Paid` ⇒ `Submitting`) before the provider is
    /// called, so at most one attempt per order is ever in flight. A breaker
    /// rejection gives the claim back untouched; any other provider error is
    /// recorded as a [`SubmissionFailure`] and the order returns to `Paid`.
    ///
    /// The attempt runs on its own task: a caller that stops waiting (a
    /// request cut off by its timeout) does not strand the order in
    /// `Submitting`.
    #[tracing::instrument(skip(self))]
    pub async fn submit_for_fulfillment(&self, order_id: OrderId) -> Result<SubmissionOutcome> {
        let lifecycle = self.clone();
        tokio::spawn(
            async move { lifecycle.attempt_submission(order_id).await }.in_current_span(),
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "submission task did not finish");
            FulfillmentError::Interrupted(e.to_string())
        })?
    }

    /// Clears the attention flag and makes one submission attempt.
    #[tracing::instrument(skip(self))]
    pub async fn resubmit(&self, order_id: OrderId) -> Result<SubmissionOutcome> {
        let (_, cleared) = self
            .store
            .modify_order(order_id, |o| Ok::<_, OrderError>(o.clear_attention()))
            .await?;
        if cleared {
            tracing::info!("attention flag cleared by operator");
        }
        self.submit_for_fulfillment(order_id).await
    }
}

#[cfg(test)]
mod tests {
    use domain::{CustomerContact, Money, NewOrderItem, ShippingAddress};
    use order_store::InMemoryOrderStore;
    use providers::{InMemoryFulfillmentProvider, ProviderError};

    use super::*;

    struct Harness {
        lifecycle: OrderLifecycle<InMemoryOrderStore>,
        store: InMemoryOrderStore,
        provider: InMemoryFulfillmentProvider,
    }

    fn harness(config: LifecycleConfig) -> Harness {
        let store = InMemoryOrderStore::new();
        let provider = InMemoryFulfillmentProvider::new();
        Harness {
            lifecycle: OrderLifecycle::new(store.clone(), Arc::new(provider.clone()), config),
            store,
            provider,
        }
    }

    async fn paid_order(store: &InMemoryOrderStore) -> OrderId {
        let (order, items) = Order::create(
            CustomerContact::new("buyer@example.com", "Jane Doe"),
            "usd",
            Some(ShippingAddress {
                name: "Jane Doe".into(),
                line1: "1 Main St".into(),
                line2: None,
                city: "Springfield".into(),
                state: Some("IL".into()),
                postal_code: "62701".into(),
                country: "US".into(),
            }),
            vec![NewOrderItem::new("Poster", "A2", 1, Money::from_minor(2500), "sv-1")],
        )
        .unwrap();
        store.insert_order(&order, &items).await.unwrap();
        store
            .modify_order(order.id(), |o| {
                o.mark_paid(PaymentConfirmation {
                    session_id: "cs_1".into(),
                    ..Default::default()
                })
            })
            .await
            .unwrap();
        order.id()
    }

    #[tokio::test]
    async fn test_submit_success() {
        let h = harness(LifecycleConfig::default());
        let id = paid_order(&h.store).await;

        let outcome = h.lifecycle.submit_for_fulfillment(id).await.unwrap();

        assert_eq!(
            outcome,
            SubmissionOutcome::Submitted {
                fulfillment_order_id: "D1".into()
            }
        );
        let order = h.store.get_order(id).await.unwrap().unwrap();
        assert_eq!(order.status(), OrderStatus::Submitted);
        assert_eq!(order.fulfillment_order_id(), Some("D1"));
    }

    #[tokio::test]
    async fn test_submit_twice_sends_once() {
        let h = harness(LifecycleConfig::default());
        let id = paid_order(&h.store).await;

        h.lifecycle.submit_for_fulfillment(id).await.unwrap();
        let second = h.lifecycle.submit_for_fulfillment(id).await.unwrap();

        assert_eq!(
            second,
            SubmissionOutcome::AlreadySubmitted {
                fulfillment_order_id: "D1".into()
            }
        );
        assert_eq!(h.provider.submit_calls().await, 1);
    }

    #[tokio::test]
    async fn test_transient_failure_returns_to_paid() {
        let h = harness(LifecycleConfig::default());
        let id = paid_order(&h.store).await;
        h.provider
            .fail_next_submit(ProviderError::Http {
                status: 503,
                message: "unavailable".into(),
            })
            .await;

        let outcome = h.lifecycle.submit_for_fulfillment(id).await.unwrap();

        assert!(matches!(
            outcome,
            SubmissionOutcome::Failed {
                attempt: 1,
                retryable: true,
                needs_attention: false,
                ..
            }
        ));
        let order = h.store.get_order(id).await.unwrap().unwrap();
        assert_eq!(order.status(), OrderStatus::Paid);
        assert_eq!(order.submission_attempts(), 1);
        assert_eq!(h.store.submission_failures(id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_flags_order() {
        let h = harness(LifecycleConfig::default());
        let id = paid_order(&h.store).await;
        h.provider
            .fail_next_submit(ProviderError::Http {
                status: 400,
                message: "Invalid variant".into(),
            })
            .await;

        let outcome = h.lifecycle.submit_for_fulfillment(id).await.unwrap();

        assert!(matches!(
            outcome,
            SubmissionOutcome::Failed {
                retryable: false,
                needs_attention: true,
                ..
            }
        ));
        let order = h.store.get_order(id).await.unwrap().unwrap();
        assert!(order.needs_attention());
        assert!(!order.is_retryable(5));
    }

    #[tokio::test]
    async fn test_breaker_rejection_leaves_order_untouched() {
        let h = harness(LifecycleConfig::default());
        let id = paid_order(&h.store).await;
        h.provider
            .fail_next_submit(ProviderError::CircuitOpen("fulfillment".into()))
            .await;

        let outcome = h.lifecycle.submit_for_fulfillment(id).await.unwrap();

        assert_eq!(outcome, SubmissionOutcome::Deferred);
        let order = h.store.get_order(id).await.unwrap().unwrap();
        assert_eq!(order.status(), OrderStatus::Paid);
        assert_eq!(order.submission_attempts(), 0);
        assert!(h.store.submission_failures(id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_submit_unpaid_order_is_not_eligible() {
        let h = harness(LifecycleConfig::default());
        let (order, items) = Order::create(
            CustomerContact::new("buyer@example.com", "Jane"),
            "usd",
            None,
            vec![NewOrderItem::new("Mug", "", 1, Money::from_minor(1200), "sv-2")],
        )
        .unwrap();
        h.store.insert_order(&order, &items).await.unwrap();

        let outcome = h.lifecycle.submit_for_fulfillment(order.id()).await.unwrap();

        assert_eq!(
            outcome,
            SubmissionOutcome::NotEligible {
                status: OrderStatus::Created
            }
        );
        assert_eq!(h.provider.submit_calls().await, 0);
    }

    #[tokio::test]
    async fn test_auto_confirm_after_submission() {
        let h = harness(LifecycleConfig {
            auto_confirm: true,
            ..LifecycleConfig::default()
        });
        let id = paid_order(&h.store).await;

        h.lifecycle.submit_for_fulfillment(id).await.unwrap();

        let order = h.store.get_order(id).await.unwrap().unwrap();
        assert_eq!(order.status(), OrderStatus::Confirmed);
        assert_eq!(h.provider.confirmed().await, vec!["D1".to_string()]);
    }

    #[tokio::test]
    async fn test_confirm_failure_leaves_submitted() {
        let h = harness(LifecycleConfig {
            auto_confirm: true,
            ..LifecycleConfig::default()
        });
        let id = paid_order(&h.store).await;
        h.provider.fail_next_confirm(ProviderError::Timeout).await;

        let outcome = h.lifecycle.submit_for_fulfillment(id).await.unwrap();

        assert!(matches!(outcome, SubmissionOutcome::Submitted { .. }));
        let order = h.store.get_order(id).await.unwrap().unwrap();
        assert_eq!(order.status(), OrderStatus::Submitted);
    }

    #[tokio::test]
    async fn test_resubmit_clears_attention() {
        let h = harness(LifecycleConfig::default());
        let id = paid_order(&h.store).await;
        h.provider
            .fail_next_submit(ProviderError::Http {
                status: 422,
                message: "bad address".into(),
            })
            .await;
        h.lifecycle.submit_for_fulfillment(id).await.unwrap();

        let outcome = h.lifecycle.resubmit(id).await.unwrap();

        assert!(matches!(outcome, SubmissionOutcome::Submitted { .. }));
        let details = h.lifecycle.details(id).await.unwrap();
        assert!(!details.order.needs_attention());
        assert_eq!(details.failures.len(), 1);
        assert_eq!(details.items.len(), 1);
    }

    #[tokio::test]
    async fn test_details_for_missing_order() {
        let h = harness(LifecycleConfig::default());
        let result = h.lifecycle.details(OrderId::new()).await;
        assert!(matches!(result, Err(FulfillmentError::OrderNotFound(_))));
    }
}
