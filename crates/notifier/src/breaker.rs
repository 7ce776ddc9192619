//! Per-transport circuit breaker.
//!
//! ```text
//!  Closed --(fail_threshold consecutive failures)--> Open
//!  Open   --(reset_timeout elapsed, next call)-----> HalfOpen (one trial)
//!  HalfOpen --trial ok--> Closed
//!  HalfOpen --trial failed--> Open (fresh opened_at)
//! ```
//!
//! State lives behind a mutex so concurrent dispatch calls agree on a single
//! `opened_at`. Only `TransportError::Transient` outcomes count as failures.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use linkwatch_common::types::TransportKind;

use crate::error::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the breaker. Clamped to at least 1.
    pub fail_threshold: u32,
    /// How long the breaker stays open before admitting a trial call.
    pub reset_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            fail_threshold: 3,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

impl Inner {
    /// Move Open -> HalfOpen once the cool-down has elapsed.
    fn refresh(&mut self, reset_timeout: Duration, transport: TransportKind) {
        if self.state != CircuitState::Open {
            return;
        }
        if let Some(opened_at) = self.opened_at {
            if opened_at.elapsed() >= reset_timeout {
                self.state = CircuitState::HalfOpen;
                self.trial_in_flight = false;
                tracing::info!(%transport, "Circuit breaker half-open, admitting one trial call");
            }
        }
    }
}

pub struct CircuitBreaker {
    transport: TransportKind,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(transport: TransportKind, config: BreakerConfig) -> Self {
        Self {
            transport,
            config: BreakerConfig {
                fail_threshold: config.fail_threshold.max(1),
                ..config
            },
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        inner.refresh(self.config.reset_timeout, self.transport);
        inner.state
    }

    pub fn failures(&self) -> u32 {
        self.inner.lock().failures
    }

    pub fn opened_at(&self) -> Option<Instant> {
        self.inner.lock().opened_at
    }

    /// Ask permission to call the transport.
    ///
    /// Fails fast with `BreakerOpen` while open, or while a half-open trial is
    /// already in flight.
    pub fn try_acquire(&self) -> Result<Permit<'_>, TransportError> {
        let mut inner = self.inner.lock();
        inner.refresh(self.config.reset_timeout, self.transport);

        match inner.state {
            CircuitState::Closed => Ok(Permit {
                breaker: self,
                trial: false,
                settled: false,
            }),
            CircuitState::HalfOpen if !inner.trial_in_flight => {
                inner.trial_in_flight = true;
                Ok(Permit {
                    breaker: self,
                    trial: true,
                    settled: false,
                })
            }
            CircuitState::HalfOpen | CircuitState::Open => {
                Err(TransportError::BreakerOpen(self.transport))
            }
        }
    }

    /// Run `op` under the breaker and record its outcome.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T, TransportError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let permit = self.try_acquire()?;
        let result = op().await;
        permit.record(&result);
        result
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Closed {
            tracing::info!(transport = %self.transport, "Circuit breaker closed");
        }
        inner.state = CircuitState::Closed;
        inner.failures = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }

    fn on_failure(&self, trial: bool) {
        let mut inner = self.inner.lock();
        inner.failures = inner.failures.saturating_add(1);

        match inner.state {
            CircuitState::HalfOpen if trial => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.trial_in_flight = false;
                tracing::warn!(
                    transport = %self.transport,
                    "Trial call failed, circuit breaker re-opened"
                );
            }
            CircuitState::Closed if inner.failures >= self.config.fail_threshold => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                tracing::warn!(
                    transport = %self.transport,
                    failures = inner.failures,
                    "Circuit breaker opened"
                );
            }
            // Already open: keep the first caller's opened_at.
            _ => {}
        }
    }

    fn on_ignored(&self, trial: bool) {
        if trial {
            self.inner.lock().trial_in_flight = false;
        }
    }
}

/// Admission to call the transport once. Dropping it unrecorded frees a half-open trial slot.
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl Permit<'_> {
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn record<T>(mut self, result: &Result<T, TransportError>) {
        self.settled = true;
        match result {
            Ok(_) => self.breaker.on_success(),
            Err(e) if e.counts_against_breaker() => self.breaker.on_failure(self.trial),
            Err(_) => self.breaker.on_ignored(self.trial),
        }
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.on_ignored(self.trial);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn breaker(threshold: u32, reset: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            TransportKind::Http,
            BreakerConfig {
                fail_threshold: threshold,
                reset_timeout: reset,
            },
        )
    }

    async fn fail(b: &CircuitBreaker, calls: &AtomicU32) -> Result<(), TransportError> {
        b.call(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(TransportError::Transient("503".into()))
        })
        .await
    }

    async fn succeed(b: &CircuitBreaker, calls: &AtomicU32) -> Result<(), TransportError> {
        b.call(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_and_fails_fast() {
        let b = breaker(3, Duration::from_secs(10));
        let calls = AtomicU32::new(0);

        for _ in 0..3 {
            assert!(fail(&b, &calls).await.is_err());
        }
        assert_eq!(b.state(), CircuitState::Open);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let started = Instant::now();
        let result = succeed(&b, &calls).await;
        assert_eq!(result, Err(TransportError::BreakerOpen(TransportKind::Http)));
        assert_eq!(calls.load(Ordering::SeqCst), 3, "transport must not be touched");
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_consecutive_count() {
        let b = breaker(2, Duration::from_secs(10));
        let calls = AtomicU32::new(0);

        fail(&b, &calls).await.ok();
        succeed(&b, &calls).await.unwrap();
        fail(&b, &calls).await.ok();
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.failures(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_after_reset_timeout() {
        let b = breaker(1, Duration::from_secs(5));
        let calls = AtomicU32::new(0);

        fail(&b, &calls).await.ok();
        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(b.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(b.state(), CircuitState::HalfOpen);

        succeed(&b, &calls).await.unwrap();
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.failures(), 0);
        assert!(b.opened_at().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_exactly_one_trial() {
        let b = breaker(1, Duration::from_secs(5));
        let calls = AtomicU32::new(0);
        fail(&b, &calls).await.ok();
        tokio::time::advance(Duration::from_secs(5)).await;

        let trial = b.try_acquire().unwrap();
        assert!(trial.is_trial());
        assert!(matches!(
            b.try_acquire(),
            Err(TransportError::BreakerOpen(TransportKind::Http))
        ));

        trial.record::<()>(&Ok(()));
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens_with_fresh_opened_at() {
        let b = breaker(1, Duration::from_secs(5));
        let calls = AtomicU32::new(0);
        fail(&b, &calls).await.ok();
        let first_opened = b.opened_at().unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        fail(&b, &calls).await.ok();

        assert_eq!(b.state(), CircuitState::Open);
        let reopened = b.opened_at().unwrap();
        assert!(reopened > first_opened);
        assert_eq!(reopened.duration_since(first_opened), Duration::from_secs(6));

        // The new cool-down is measured from the re-open.
        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_errors_do_not_trip() {
        let b = breaker(1, Duration::from_secs(5));
        for _ in 0..5 {
            let result: Result<(), _> = b
                .call(|| async { Err(TransportError::Permanent("bad payload".into())) })
                .await;
            assert!(matches!(result, Err(TransportError::Permanent(_))));
        }
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trial_frees_slot() {
        let b = breaker(1, Duration::from_secs(1));
        let calls = AtomicU32::new(0);
        fail(&b, &calls).await.ok();
        tokio::time::advance(Duration::from_secs(1)).await;

        drop(b.try_acquire().unwrap());
        assert_eq!(b.state(), CircuitState::HalfOpen);
        assert!(b.try_acquire().unwrap().is_trial());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_failures_keep_single_opened_at() {
        let b = breaker(1, Duration::from_secs(30));
        let p1 = b.try_acquire().unwrap();
        let p2 = b.try_acquire().unwrap();

        p1.record::<()>(&Err(TransportError::Transient("a".into())));
        let opened = b.opened_at().unwrap();
        tokio::time::advance(Duration::from_secs(1)).await;
        p2.record::<()>(&Err(TransportError::Transient("b".into())));

        assert_eq!(b.opened_at(), Some(opened));
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_minimum_is_one() {
        let b = breaker(0, Duration::from_secs(1));
        let permit = b.try_acquire().unwrap();
        permit.record::<()>(&Err(TransportError::Transient("x".into())));
        assert_eq!(b.state(), CircuitState::Open);
    }
}
