//! Circuit breaker guarding calls to an external dependency.
//!
//! # States
//! - Closed: calls pass through; consecutive failures are counted
//! - Open: calls are rejected without running until the reset timeout
//!   has elapsed since the last failure
//! - HalfOpen: a bounded number of trial calls run; one success closes,
//!   one failure reopens
//!
//! All bookkeeping happens under one mutex per breaker. The lock is taken
//! before and after the wrapped operation, never across its `.await`.

use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Breaker thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    pub max_failures: u32,
    /// How long the circuit stays open after the last failure.
    pub reset_timeout: Duration,
    /// Trial calls allowed concurrently while half-open.
    pub half_open_max_requests: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            reset_timeout: Duration::from_secs(60),
            half_open_max_requests: 1,
        }
    }
}

/// Error returned by [`CircuitBreaker::execute`].
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// The circuit is open; the operation was not attempted.
    #[error("circuit breaker '{0}' is open")]
    Open(String),

    /// The half-open trial quota is in use; the operation was not attempted.
    #[error("circuit breaker '{0}' is half-open and its trial quota is in use")]
    TooManyRequests(String),

    /// The operation ran and failed.
    #[error("{0}")]
    Inner(E),
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    half_open_in_flight: u32,
    /// Bumped on every state change so results of calls admitted under an
    /// earlier state are not counted against the current one.
    generation: u64,
}

impl Default for BreakerState {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure: None,
            half_open_in_flight: 0,
            generation: 0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Admission {
    generation: u64,
}

/// A circuit breaker instance for one named dependency.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Returns the current state.
    ///
    /// An open breaker reports `Open` until a call arrives after the reset
    /// timeout and moves it to `HalfOpen`.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Returns the current consecutive failure count.
    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// Runs `operation` if the breaker admits it and records the outcome.
    ///
    /// A call dropped before completing counts as a failure.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let admission = self.admit()?;
        let mut guard = OutcomeGuard {
            breaker: self,
            admission,
            armed: true,
        };

        let result = operation().await;
        guard.armed = false;
        self.record(admission, result.is_ok());

        result.map_err(BreakerError::Inner)
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn admit<E>(&self) -> Result<Admission, BreakerError<E>> {
        let mut inner = self.lock();

        match inner.state {
            CircuitState::Closed => {}
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure
                    .map(|at| at.elapsed())
                    .unwrap_or(self.config.reset_timeout);
                if elapsed < self.config.reset_timeout {
                    drop(inner);
                    self.rejected("open");
                    return Err(BreakerError::Open(self.name.clone()));
                }
                self.transition(&mut inner, CircuitState::HalfOpen);
                inner.half_open_in_flight = 1;
            }
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight >= self.config.half_open_max_requests {
                    drop(inner);
                    self.rejected("too_many_requests");
                    return Err(BreakerError::TooManyRequests(self.name.clone()));
                }
                inner.half_open_in_flight += 1;
            }
        }

        Ok(Admission {
            generation: inner.generation,
        })
    }

    fn record(&self, admission: Admission, success: bool) {
        let mut inner = self.lock();
        if inner.generation != admission.generation {
            return;
        }

        match (inner.state, success) {
            (CircuitState::Closed, true) => {
                inner.consecutive_failures = 0;
            }
            (CircuitState::Closed, false) => {
                inner.consecutive_failures += 1;
                inner.last_failure = Some(Instant::now());
                if inner.consecutive_failures >= self.config.max_failures {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            (CircuitState::HalfOpen, true) => {
                inner.consecutive_failures = 0;
                inner.half_open_in_flight = 0;
                self.transition(&mut inner, CircuitState::Closed);
            }
            (CircuitState::HalfOpen, false) => {
                inner.consecutive_failures += 1;
                inner.half_open_in_flight = 0;
                inner.last_failure = Some(Instant::now());
                self.transition(&mut inner, CircuitState::Open);
            }
            (CircuitState::Open, _) => {}
        }
    }

    fn transition(&self, inner: &mut BreakerState, to: CircuitState) {
        let from = inner.state;
        inner.state = to;
        inner.generation += 1;

        match to {
            CircuitState::Open => tracing::warn!(
                breaker = %self.name,
                %from,
                %to,
                failures = inner.consecutive_failures,
                "circuit breaker opened"
            ),
            _ => tracing::info!(breaker = %self.name, %from, %to, "circuit breaker state changed"),
        }
        metrics::counter!(
            "circuit_breaker_transitions_total",
            "breaker" => self.name.clone(),
            "to" => to.as_str()
        )
        .increment(1);
    }

    fn rejected(&self, reason: &'static str) {
        tracing::debug!(breaker = %self.name, reason, "call rejected by circuit breaker");
        metrics::counter!(
            "circuit_breaker_rejections_total",
            "breaker" => self.name.clone(),
            "reason" => reason
        )
        .increment(1);
    }
}

struct OutcomeGuard<'a> {
    breaker: &'a CircuitBreaker,
    admission: Admission,
    armed: bool,
}

impl Drop for OutcomeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.record(self.admission, false);
        }
    }
}
