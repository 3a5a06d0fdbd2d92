use std::fmt;

use thiserror::Error;

/// Crate-level result alias.
pub type Result<T> = std::result::Result<T, WebhookError>;

/// Errors produced by the webhook subsystem.
///
/// Only the delivery-side variants count against the delivery retry
/// budget. Carrier failures are absorbed into the registration's
/// `last_error` and the periodic schedule is the retry.
#[derive(Debug, Error)]
pub enum WebhookError {
    /// Validation failure in `register`. Surfaced to the API caller verbatim.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Registration missing in an update path. Terminates the job
    /// without retry.
    #[error("not found: {0}")]
    NotFound(String),

    /// Carrier id not present in the registry.
    #[error("carrier not found: {0}")]
    CarrierUnknown(String),

    /// The upstream tracking API failed or timed out.
    #[error("tracking API error: {0}")]
    CarrierFailure(String),

    /// 5xx / network / timeout outcome; the queue schedules the next
    /// attempt with back-off.
    #[error("delivery attempt {attempt} failed: {message}")]
    DeliveryTransient { attempt: u32, message: String },

    /// Non-retryable HTTP outcome, or retries exhausted; the
    /// registration is deactivated.
    #[error("delivery failed after {attempt} attempts: {message}")]
    DeliveryPermanent { attempt: u32, message: String },

    /// Unexpected store/queue failure; propagated so the driving job
    /// retries.
    #[error("internal error: {0}")]
    Internal(String),
}

impl WebhookError {
    /// Wrap an arbitrary backend failure.
    pub fn internal(err: impl fmt::Display) -> Self {
        Self::Internal(err.to_string())
    }

    /// Whether the queue should re-run the job that returned this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::DeliveryTransient { .. } | Self::Internal(_)
        )
    }
}
