//! Background worker that re-drives paid orders the webhook path could not
//! get to the fulfillment provider.

use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use domain::OrderStatus;
use order_store::OrderStore;

use crate::error::Result;
use crate::lifecycle::{OrderLifecycle, SubmissionOutcome};

/// Retry worker settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Time between passes.
    pub interval: Duration,
    /// Orders examined per pass.
    pub batch_size: usize,
    /// A `Submitting` claim older than this is assumed abandoned.
    pub stale_submission_after: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            batch_size: 50,
            stale_submission_after: Duration::from_secs(600),
        }
    }
}

/// What one pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetrySummary {
    /// Abandoned claims returned to `Paid`.
    pub reclaimed: usize,
    /// Orders the provider accepted.
    pub submitted: usize,
    /// Attempts that failed and were recorded.
    pub failed: usize,
    /// Orders another writer got to first.
    pub skipped: usize,
    /// Submitted drafts confirmed.
    pub confirmed: usize,
    /// True if the breaker cut the pass short.
    pub deferred: bool,
    /// Orders whose attempt ended in an unexpected error.
    pub errors: usize,
}

/// Periodically submits retryable orders.
pub struct RetryWorker<S: OrderStore> {
    lifecycle: OrderLifecycle<S>,
    config: RetryConfig,
}

impl<S: OrderStore + Clone + 'static> RetryWorker<S> {
    /// Creates a new retry worker.
    pub fn new(lifecycle: OrderLifecycle<S>, config: RetryConfig) -> Self {
        Self { lifecycle, config }
    }

    /// Runs passes every `interval` until `shutdown` resolves.
    pub async fn run(self, shutdown: impl Future<Output = ()>) {
        tracing::info!(
            interval_secs = self.config.interval.as_secs(),
            batch_size = self.config.batch_size,
            "retry worker started"
        );
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        tracing::error!(error = %e, "retry pass failed");
                    }
                }
            }
        }
        tracing::info!("retry worker stopped");
    }

    /// Makes one pass: reclaims abandoned submissions, retries paid orders
    /// and, with auto-confirm on, confirms submitted drafts.
    ///
    /// A breaker rejection ends the pass early; the remaining orders wait
    /// for the next one.
    #[tracing::instrument(name = "retry_pass", skip(self))]
    pub async fn run_once(&self) -> Result<RetrySummary> {
        let mut summary = RetrySummary::default();
        let store = self.lifecycle.store();
        let max_attempts = self.lifecycle.config().max_attempts;

        summary.reclaimed = self.reclaim_stale().await?;

        for order in store.find_retryable(max_attempts, self.config.batch_size).await? {
            match self.lifecycle.submit_for_fulfillment(order.id()).await {
                Ok(SubmissionOutcome::Submitted { .. }) => summary.submitted += 1,
                Ok(SubmissionOutcome::Failed { .. }) => summary.failed += 1,
                Ok(SubmissionOutcome::AlreadySubmitted { .. } | SubmissionOutcome::NotEligible { .. }) => {
                    summary.skipped += 1
                }
                Ok(SubmissionOutcome::Deferred) => {
                    summary.deferred = true;
                    break;
                }
                Err(e) => {
                    summary.errors += 1;
                    tracing::error!(order_id = %order.id(), error = %e, "retry attempt errored");
                }
            }
        }

        if self.lifecycle.config().auto_confirm && !summary.deferred {
            let submitted = store
                .find_by_status(OrderStatus::Submitted, None, self.config.batch_size)
                .await?;
            for order in submitted {
                match self.lifecycle.confirm(order.id()).await {
                    Ok(true) => summary.confirmed += 1,
                    Ok(false) => {}
                    Err(e) => {
                        summary.errors += 1;
                        tracing::warn!(order_id = %order.id(), error = %e, "confirmation retry failed");
                    }
                }
            }
        }

        metrics::counter!("retry_passes_total").increment(1);
        metrics::counter!("retry_submissions_total", "outcome" => "submitted")
            .increment(summary.submitted as u64);
        metrics::counter!("retry_submissions_total", "outcome" => "failed")
            .increment(summary.failed as u64);
        if summary != RetrySummary::default() {
            tracing::info!(?summary, "retry pass finished");
        }
        Ok(summary)
    }

    /// Returns claims left in `Submitting` by a crashed attempt to `Paid`.
    ///
    /// Such an attempt may have reached the provider; a later submission can
    /// then create a second draft, which the operator reconciles.
    async fn reclaim_stale(&self) -> Result<usize> {
        let stale_after = chrono::Duration::from_std(self.config.stale_submission_after)
            .unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(stale_after)
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);

        let stale = self
            .lifecycle
            .store()
            .find_by_status(OrderStatus::Submitting, Some(cutoff), self.config.batch_size)
            .await?;
        let mut reclaimed = 0;
        for order in stale {
            if self.lifecycle.release_stale_claim(order.id(), cutoff).await? {
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }
}
