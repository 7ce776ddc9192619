//! Bounded retry with linear backoff for transport calls.
//!
//! Only `TransportError::Transient` outcomes are retried. Attempt `n` that fails
//! transiently is followed by a pause of `backoff_base * n` before attempt `n + 1`.

use std::future::Future;
use std::time::Duration;

use linkwatch_common::types::TransportKind;

use crate::error::TransportError;

/// Result of one attempt within a dispatch call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Delivered,
    Failed(TransportError),
    /// The breaker rejected the call before the transport was touched.
    ShortCircuited,
}

/// Bookkeeping for a single attempt. Lives only as long as the dispatch call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryAttempt {
    pub transport: TransportKind,
    pub attempt: u32,
    pub outcome: AttemptOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff_base: Duration,
}

impl RetryPolicy {
    /// `max_attempts` includes the first try and is clamped to at least 1.
    pub fn new(max_attempts: u32, backoff_base: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff_base,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Pause after failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_base * attempt
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// Every attempt is appended to `journal`.
    pub async fn run<T, F, Fut>(
        &self,
        transport: TransportKind,
        journal: &mut Vec<DeliveryAttempt>,
        mut op: F,
    ) -> Result<T, TransportError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => {
                    journal.push(DeliveryAttempt {
                        transport,
                        attempt,
                        outcome: AttemptOutcome::Delivered,
                    });
                    return Ok(value);
                }
                Err(e) => {
                    journal.push(DeliveryAttempt {
                        transport,
                        attempt,
                        outcome: AttemptOutcome::Failed(e.clone()),
                    });

                    if !e.is_retryable() {
                        tracing::warn!(
                            %transport,
                            attempt,
                            error = %e,
                            "Non-retryable transport failure"
                        );
                        return Err(e);
                    }
                    if attempt >= self.max_attempts {
                        tracing::warn!(
                            %transport,
                            attempts = attempt,
                            error = %e,
                            "Retries exhausted"
                        );
                        return Err(e);
                    }

                    let delay = self.backoff(attempt);
                    tracing::debug!(
                        %transport,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient transport failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(300))
    }
}
