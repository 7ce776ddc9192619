use reqwest::StatusCode;
use thiserror::Error;

use linkwatch_common::error::AppError;
use linkwatch_common::types::TransportKind;

/// Outcome of a failed transport call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Network or server-side trouble. Retried and counted by the breaker.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The event itself was rejected. Never retried, never counted by the breaker.
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// The breaker short-circuited the call without touching the transport.
    #[error("circuit breaker open for {0} transport")]
    BreakerOpen(TransportKind),
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Transient(_))
    }

    /// Whether this outcome is evidence of a transport outage.
    pub fn counts_against_breaker(&self) -> bool {
        matches!(self, TransportError::Transient(_))
    }

    /// Classify a non-success HTTP status.
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let message = if body.is_empty() {
            format!("HTTP {}", status)
        } else {
            format!("HTTP {}: {}", status, body)
        };

        match status.as_u16() {
            429 | 500 | 502 | 503 | 504 => TransportError::Transient(message),
            _ => TransportError::Permanent(message),
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            return TransportError::from_status(status, "");
        }
        if e.is_builder() || e.is_decode() {
            TransportError::Permanent(e.to_string())
        } else {
            TransportError::Transient(e.to_string())
        }
    }
}

impl From<AppError> for TransportError {
    fn from(e: AppError) -> Self {
        if e.is_transient() {
            TransportError::Transient(e.to_string())
        } else {
            TransportError::Permanent(e.to_string())
        }
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(e: serde_json::Error) -> Self {
        TransportError::Permanent(format!("unserializable event: {}", e))
    }
}

/// Both transports failed for one event.
#[derive(Debug, Clone, Error)]
#[error("delivery failed: primary ({primary_kind}): {primary}; secondary ({secondary_kind}): {secondary}")]
pub struct DeliveryFailed {
    pub primary_kind: TransportKind,
    pub primary: TransportError,
    pub secondary_kind: TransportKind,
    pub secondary: TransportError,
}

impl DeliveryFailed {
    /// True when both transports rejected the event itself rather than failing.
    pub fn is_permanent(&self) -> bool {
        matches!(self.primary, TransportError::Permanent(_))
            && matches!(self.secondary, TransportError::Permanent(_))
    }
}
