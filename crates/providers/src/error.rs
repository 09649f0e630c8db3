//! Provider error types and their retry classification.

use thiserror::Error;

use crate::breaker::BreakerError;

/// Errors returned by the payment and fulfillment clients.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// The provider's breaker is open; no request was sent.
    #[error("Circuit open: {0}")]
    CircuitOpen(String),

    /// The provider's breaker is half-open with its trial quota in use.
    #[error("Too many requests: {0}")]
    TooManyRequests(String),

    /// The request did not complete within the client timeout.
    #[error("Request timed out")]
    Timeout,

    /// Connection-level failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The provider answered with a non-success status.
    #[error("Provider returned {status}: {message}")]
    Http { status: u16, message: String },

    /// The provider answered 2xx with a body we could not understand.
    #[error("Malformed provider response: {0}")]
    Decode(String),

    /// The request was not sent because it could not be built from the order.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl ProviderError {
    /// Returns true for synthetic breaker rejections.
    ///
    /// A rejection says nothing about the order itself and must not count
    /// as a submission attempt.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            ProviderError::CircuitOpen(_) | ProviderError::TooManyRequests(_)
        )
    }

    /// Returns true if the same request may succeed later.
    ///
    /// Timeouts, transport failures, 5xx, 408 and 429 are transient; other
    /// 4xx responses and requests we refused to build are permanent.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::CircuitOpen(_)
            | ProviderError::TooManyRequests(_)
            | ProviderError::Timeout
            | ProviderError::Transport(_)
            | ProviderError::Decode(_) => true,
            ProviderError::Http { status, .. } => {
                *status >= 500 || *status == 408 || *status == 429
            }
            ProviderError::InvalidRequest(_) => false,
        }
    }
}

impl From<BreakerError<ProviderError>> for ProviderError {
    fn from(err: BreakerError<ProviderError>) -> Self {
        match err {
            BreakerError::Open(name) => ProviderError::CircuitOpen(name),
            BreakerError::TooManyRequests(name) => ProviderError::TooManyRequests(name),
            BreakerError::Inner(inner) => inner,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout
        } else if err.is_decode() {
            ProviderError::Decode(err.to_string())
        } else {
            ProviderError::Transport(err.to_string())
        }
    }
}

/// Convenience type alias for provider results.
pub type Result<T> = std::result::Result<T, ProviderError>;
