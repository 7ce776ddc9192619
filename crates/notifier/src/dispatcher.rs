//! Primary/secondary delivery of change events.
//!
//! Each route is a transport guarded by its own circuit breaker. A send is a
//! full retry sequence under one breaker permit, so an exhausted retry counts
//! as a single failure observation. When the primary route fails for any
//! reason the event is handed to the secondary route exactly once.

use std::sync::Arc;

use async_trait::async_trait;

use linkwatch_common::types::{ChangeEvent, TransportKind};

use crate::breaker::{BreakerConfig, CircuitBreaker};
use crate::error::{DeliveryFailed, TransportError};
use crate::metrics::{DeliveryMetrics, DeliveryOutcome};
use crate::retry::{AttemptOutcome, DeliveryAttempt, RetryPolicy};
use crate::transport::Transport;

/// Successful hand-off. Carries no information about which route was used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack;

/// The one operation the poller needs from the notification side.
#[async_trait]
pub trait Deliver: Send + Sync {
    async fn deliver(&self, event: &ChangeEvent) -> Result<Ack, DeliveryFailed>;

    /// Running totals since startup.
    fn stats(&self) -> DeliveryStats;
}

pub use crate::metrics::DeliveryStats;

struct Route {
    transport: Arc<dyn Transport>,
    breaker: CircuitBreaker,
}

pub struct NotificationDispatcher {
    primary: Route,
    secondary: Route,
    retry: RetryPolicy,
    metrics: DeliveryMetrics,
}

impl NotificationDispatcher {
    pub fn new(
        primary: Arc<dyn Transport>,
        secondary: Arc<dyn Transport>,
        retry: RetryPolicy,
        breaker: BreakerConfig,
        metrics: DeliveryMetrics,
    ) -> Self {
        let route = |transport: Arc<dyn Transport>| Route {
            breaker: CircuitBreaker::new(transport.kind(), breaker),
            transport,
        };

        Self {
            primary: route(primary),
            secondary: route(secondary),
            retry,
            metrics,
        }
    }

    pub fn primary_kind(&self) -> TransportKind {
        self.primary.transport.kind()
    }

    pub fn secondary_kind(&self) -> TransportKind {
        self.secondary.transport.kind()
    }

    /// Breaker guarding the route for `kind`, if the dispatcher has one.
    pub fn breaker(&self, kind: TransportKind) -> Option<&CircuitBreaker> {
        [&self.primary, &self.secondary]
            .into_iter()
            .find(|route| route.transport.kind() == kind)
            .map(|route| &route.breaker)
    }

    pub fn stats(&self) -> DeliveryStats {
        self.metrics.stats()
    }

    /// Deliver an event, returning the attempt journal along with the outcome.
    pub async fn deliver_with_journal(
        &self,
        event: &ChangeEvent,
    ) -> (Result<Ack, DeliveryFailed>, Vec<DeliveryAttempt>) {
        let mut journal = Vec::new();

        let primary = match self.send(&self.primary, event, &mut journal).await {
            Ok(()) => {
                self.metrics.record(DeliveryOutcome::Primary);
                return (Ok(Ack), journal);
            }
            Err(e) => e,
        };

        tracing::warn!(
            resource_id = %event.resource_id,
            primary = %self.primary_kind(),
            secondary = %self.secondary_kind(),
            error = %primary,
            "Primary transport failed, falling back"
        );

        let secondary = match self.send(&self.secondary, event, &mut journal).await {
            Ok(()) => {
                self.metrics.record(DeliveryOutcome::Secondary);
                return (Ok(Ack), journal);
            }
            Err(e) => e,
        };

        self.metrics.record(DeliveryOutcome::Failed);
        let failed = DeliveryFailed {
            primary_kind: self.primary_kind(),
            primary,
            secondary_kind: self.secondary_kind(),
            secondary,
        };
        tracing::error!(
            resource_id = %event.resource_id,
            attempts = journal.len(),
            error = %failed,
            "Both transports failed"
        );
        (Err(failed), journal)
    }

    async fn send(
        &self,
        route: &Route,
        event: &ChangeEvent,
        journal: &mut Vec<DeliveryAttempt>,
    ) -> Result<(), TransportError> {
        let kind = route.transport.kind();

        let attempts = &mut *journal;
        let result = route
            .breaker
            .call(move || {
                self.retry
                    .run(kind, attempts, move |_| route.transport.send(event))
            })
            .await;

        if let Err(TransportError::BreakerOpen(_)) = &result {
            journal.push(DeliveryAttempt {
                transport: kind,
                attempt: 0,
                outcome: AttemptOutcome::ShortCircuited,
            });
        }
        result
    }
}

#[async_trait]
impl Deliver for NotificationDispatcher {
    async fn deliver(&self, event: &ChangeEvent) -> Result<Ack, DeliveryFailed> {
        let (result, journal) = self.deliver_with_journal(event).await;
        if let Some(last) = journal.last() {
            tracing::debug!(
                resource_id = %event.resource_id,
                transport = %last.transport,
                attempts = journal.len(),
                "Dispatch finished"
            );
        }
        result
    }

    fn stats(&self) -> DeliveryStats {
        NotificationDispatcher::stats(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    use chrono::{TimeZone, Utc};
    use parking_lot::Mutex;
    use prometheus::Registry;
    use uuid::Uuid;

    use crate::breaker::CircuitState;
    use crate::stream::MemoryStream;
    use crate::transport::QueueTransport;

    /// Transport that replays scripted outcomes, then succeeds.
    struct ScriptedTransport {
        kind: TransportKind,
        script: Mutex<VecDeque<Result<(), TransportError>>>,
        calls: AtomicU64,
    }

    impl ScriptedTransport {
        fn new(kind: TransportKind, script: Vec<Result<(), TransportError>>) -> Arc<Self> {
            Arc::new(Self {
                kind,
                script: Mutex::new(script.into()),
                calls: AtomicU64::new(0),
            })
        }

        fn failing(kind: TransportKind, error: TransportError) -> Arc<Self> {
            Self::new(kind, vec![Err(error); 64])
        }

        fn calls(&self) -> u64 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        fn kind(&self) -> TransportKind {
            self.kind
        }

        async fn send(&self, _event: &ChangeEvent) -> Result<(), TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script.lock().pop_front().unwrap_or(Ok(()))
        }
    }

    fn event() -> ChangeEvent {
        ChangeEvent {
            resource_id: Uuid::new_v4(),
            url: "https://github.com/rust-lang/rust".to_string(),
            last_update: Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
            title: Some("Bug fix".to_string()),
            user_name: Some("alice".to_string()),
            preview: Some("Fixed the crash".to_string()),
        }
    }

    fn unavailable() -> TransportError {
        TransportError::Transient("HTTP 503 Service Unavailable".into())
    }

    fn dispatcher(
        primary: Arc<dyn Transport>,
        secondary: Arc<dyn Transport>,
        fail_threshold: u32,
    ) -> NotificationDispatcher {
        NotificationDispatcher::new(
            primary,
            secondary,
            RetryPolicy::new(3, Duration::from_millis(100)),
            BreakerConfig {
                fail_threshold,
                reset_timeout: Duration::from_secs(30),
            },
            DeliveryMetrics::new(&Registry::new()).unwrap(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_primary_success_skips_secondary() {
        let primary = ScriptedTransport::new(TransportKind::Http, vec![]);
        let secondary = ScriptedTransport::new(TransportKind::Queue, vec![]);
        let d = dispatcher(primary.clone(), secondary.clone(), 3);

        assert_eq!(d.deliver(&event()).await.unwrap(), Ack);
        assert_eq!(primary.calls(), 1);
        assert_eq!(secondary.calls(), 0);
        assert_eq!(d.stats().via_primary, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_http_503_falls_back_to_queue() {
        let primary = ScriptedTransport::failing(TransportKind::Http, unavailable());
        let stream = Arc::new(MemoryStream::new("link_updates"));
        let secondary = Arc::new(QueueTransport::new(stream.clone()));
        let d = dispatcher(primary.clone(), secondary, 1);

        let (result, journal) = d.deliver_with_journal(&event()).await;

        assert_eq!(result.unwrap(), Ack);
        assert_eq!(primary.calls(), 3);
        assert_eq!(stream.published().len(), 1);

        let published: ChangeEvent = serde_json::from_slice(&stream.published()[0]).unwrap();
        assert_eq!(published, event_with_id(published.resource_id));

        // three failed HTTP attempts then one queue delivery
        assert_eq!(journal.len(), 4);
        assert!(journal[..3].iter().all(|a| a.transport == TransportKind::Http));
        assert_eq!(journal[3].transport, TransportKind::Queue);
        assert_eq!(journal[3].outcome, AttemptOutcome::Delivered);

        let http = d.breaker(TransportKind::Http).unwrap();
        assert_eq!(http.state(), CircuitState::Open);
        assert_eq!(http.failures(), 1);
        assert_eq!(
            d.breaker(TransportKind::Queue).unwrap().state(),
            CircuitState::Closed
        );
        assert_eq!(d.stats().via_secondary, 1);
    }

    fn event_with_id(id: Uuid) -> ChangeEvent {
        ChangeEvent {
            resource_id: id,
            ..event()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_opens_only_at_threshold() {
        let primary = ScriptedTransport::failing(TransportKind::Http, unavailable());
        let secondary = ScriptedTransport::new(TransportKind::Queue, vec![]);
        let d = dispatcher(primary.clone(), secondary, 2);

        d.deliver(&event()).await.unwrap();
        assert_eq!(
            d.breaker(TransportKind::Http).unwrap().state(),
            CircuitState::Closed
        );

        d.deliver(&event()).await.unwrap();
        assert_eq!(
            d.breaker(TransportKind::Http).unwrap().state(),
            CircuitState::Open
        );
        assert_eq!(primary.calls(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_skips_primary_without_waiting() {
        let primary = ScriptedTransport::failing(TransportKind::Http, unavailable());
        let secondary = ScriptedTransport::new(TransportKind::Queue, vec![]);
        let d = dispatcher(primary.clone(), secondary.clone(), 1);

        d.deliver(&event()).await.unwrap();
        assert_eq!(primary.calls(), 3);

        let started = tokio::time::Instant::now();
        let (result, journal) = d.deliver_with_journal(&event()).await;

        assert!(result.is_ok());
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(primary.calls(), 3);
        assert_eq!(secondary.calls(), 2);
        assert_eq!(journal[0].outcome, AttemptOutcome::ShortCircuited);
    }

    #[tokio::test(start_paused = true)]
    async fn test_both_fail_returns_both_errors() {
        let primary = ScriptedTransport::failing(TransportKind::Http, unavailable());
        let secondary = ScriptedTransport::failing(
            TransportKind::Queue,
            TransportError::Transient("connection refused".into()),
        );
        let d = dispatcher(primary.clone(), secondary.clone(), 3);

        let err = d.deliver(&event()).await.unwrap_err();

        assert_eq!(err.primary_kind, TransportKind::Http);
        assert_eq!(err.secondary_kind, TransportKind::Queue);
        assert_eq!(err.primary, unavailable());
        assert!(matches!(err.secondary, TransportError::Transient(_)));
        assert!(!err.is_permanent());
        // one-shot fallback: no second pass over the primary
        assert_eq!(primary.calls(), 3);
        assert_eq!(secondary.calls(), 3);
        assert_eq!(d.stats().failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_falls_back_without_retry_or_trip() {
        let primary = ScriptedTransport::failing(
            TransportKind::Http,
            TransportError::Permanent("HTTP 422".into()),
        );
        let secondary = ScriptedTransport::new(TransportKind::Queue, vec![]);
        let d = dispatcher(primary.clone(), secondary.clone(), 1);

        d.deliver(&event()).await.unwrap();

        assert_eq!(primary.calls(), 1);
        assert_eq!(secondary.calls(), 1);
        let http = d.breaker(TransportKind::Http).unwrap();
        assert_eq!(http.state(), CircuitState::Closed);
        assert_eq!(http.failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_as_primary() {
        let primary = ScriptedTransport::new(TransportKind::Queue, vec![]);
        let secondary = ScriptedTransport::new(TransportKind::Http, vec![]);
        let d = dispatcher(primary.clone(), secondary.clone(), 3);

        d.deliver(&event()).await.unwrap();
        assert_eq!(d.primary_kind(), TransportKind::Queue);
        assert_eq!(primary.calls(), 1);
        assert_eq!(secondary.calls(), 0);
    }
}
