//! End-to-end tests for the poll → dispatch → consume pipeline.
//!
//! The pipeline tests run entirely in memory. The store tests at the bottom
//! require a running PostgreSQL database and the `DATABASE_URL` environment
//! variable. Run those with:
//!
//! ```bash
//! DATABASE_URL="postgresql://..." cargo test -p linkwatch-poller --test integration -- --ignored --nocapture
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use prometheus::Registry;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use linkwatch_checker::{Activity, ActivitySource, CheckError, ResourceChangeChecker};
use linkwatch_common::types::{
    ChangeEvent, ResourceKind, ResourceRef, TrackedResource, TransportKind,
};
use linkwatch_notifier::breaker::{BreakerConfig, CircuitState};
use linkwatch_notifier::consumer::UpdateConsumer;
use linkwatch_notifier::dead_letter::DeadLetterRouter;
use linkwatch_notifier::dispatcher::NotificationDispatcher;
use linkwatch_notifier::error::TransportError;
use linkwatch_notifier::metrics::DeliveryMetrics;
use linkwatch_notifier::recipient::{Recipient, RecipientError};
use linkwatch_notifier::retry::RetryPolicy;
use linkwatch_notifier::stream::MemoryStream;
use linkwatch_notifier::transport::{QueueTransport, Transport};
use linkwatch_poller::poller::Poller;
use linkwatch_poller::store::{InMemoryStore, PgSubscriptionStore, SubscriptionStore};

fn utc(day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap()
}

/// Repository source whose latest activity is fixed.
struct FixedRepository(Activity);

#[async_trait]
impl ActivitySource for FixedRepository {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Repository
    }

    async fn fetch_latest_activity(
        &self,
        _resource: &ResourceRef,
    ) -> Result<Option<Activity>, CheckError> {
        Ok(Some(self.0.clone()))
    }

    fn name(&self) -> &'static str {
        "fixed"
    }
}

/// HTTP endpoint that always answers 503.
#[derive(Default)]
struct UnavailableEndpoint {
    calls: AtomicU32,
}

#[async_trait]
impl Transport for UnavailableEndpoint {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    async fn send(&self, _event: &ChangeEvent) -> Result<(), TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(TransportError::Transient("HTTP 503 Service Unavailable".into()))
    }
}

#[derive(Default)]
struct Inbox {
    messages: Mutex<Vec<String>>,
}

#[async_trait]
impl Recipient for Inbox {
    async fn forward(&self, text: &str) -> Result<(), RecipientError> {
        self.messages.lock().push(text.to_string());
        Ok(())
    }
}

fn metrics() -> DeliveryMetrics {
    DeliveryMetrics::new(&Registry::new()).unwrap()
}

fn bug_fix_checker() -> ResourceChangeChecker {
    ResourceChangeChecker::new().with_source(Arc::new(FixedRepository(Activity {
        updated_at: utc(2),
        title: Some("Bug fix".into()),
        author: Some("alice".into()),
        body: Some("Fixed the crash".into()),
    })))
}

#[tokio::test(start_paused = true)]
async fn test_change_falls_back_to_queue_and_reaches_recipient() {
    let store = Arc::new(InMemoryStore::new());
    let resource =
        TrackedResource::from_url(Uuid::new_v4(), "https://github.com/acme/widgets", utc(1))
            .unwrap();
    store.insert(resource.clone());

    let http = Arc::new(UnavailableEndpoint::default());
    let updates = Arc::new(MemoryStream::new("link_updates"));
    let dispatcher = Arc::new(NotificationDispatcher::new(
        http.clone(),
        Arc::new(QueueTransport::new(updates.clone())),
        RetryPolicy::new(3, Duration::from_millis(300)),
        BreakerConfig {
            fail_threshold: 1,
            reset_timeout: Duration::from_secs(30),
        },
        metrics(),
    ));
    let poller = Poller::new(
        store.clone(),
        bug_fix_checker(),
        dispatcher.clone(),
        500,
        Duration::from_secs(60),
    );

    let before = Utc::now();
    let report = poller.run_cycle(&CancellationToken::new()).await.unwrap();

    assert_eq!(report.changed, 1);
    assert_eq!(report.delivered, 1);
    assert_eq!(http.calls.load(Ordering::SeqCst), 3);
    assert_eq!(
        dispatcher.breaker(TransportKind::Http).unwrap().state(),
        CircuitState::Open
    );
    assert_eq!(dispatcher.stats().via_secondary, 1);

    // the event on the queue is exactly what the checker observed
    let published = updates.published();
    assert_eq!(published.len(), 1);
    let json: serde_json::Value = serde_json::from_slice(&published[0]).unwrap();
    assert_eq!(
        json,
        serde_json::json!({
            "resourceId": resource.id.to_string(),
            "url": "https://github.com/acme/widgets",
            "lastUpdate": "2024-01-02T00:00:00Z",
            "title": "Bug fix",
            "userName": "alice",
            "preview": "Fixed the crash",
        })
    );

    // checkpoint advanced to the poll time
    assert!(store.get(resource.id).unwrap().last_checked_at >= before);

    // the queue consumer renders it for the recipient
    let inbox = Arc::new(Inbox::default());
    let dlq = Arc::new(MemoryStream::new("dead-letter-topic"));
    let consumer = UpdateConsumer::new(
        updates.clone(),
        inbox.clone(),
        DeadLetterRouter::new(dlq.clone()),
    );
    let shutdown = CancellationToken::new();
    let handle = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { consumer.run(shutdown).await })
    };
    while inbox.messages.lock().is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    shutdown.cancel();
    handle.await.unwrap();

    let messages = inbox.messages.lock().clone();
    assert_eq!(messages.len(), 1);
    assert!(messages[0].starts_with("Update: Bug fix\nUser: alice\n"));
    assert!(dlq.published().is_empty());
    assert!(updates.pending().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_second_cycle_reports_nothing_new() {
    let store = Arc::new(InMemoryStore::new());
    store.insert(
        TrackedResource::from_url(Uuid::new_v4(), "https://github.com/acme/widgets", utc(1))
            .unwrap(),
    );
    let updates = Arc::new(MemoryStream::new("link_updates"));
    let dispatcher = Arc::new(NotificationDispatcher::new(
        Arc::new(QueueTransport::new(updates.clone())),
        Arc::new(UnavailableEndpoint::default()),
        RetryPolicy::default(),
        BreakerConfig::default(),
        metrics(),
    ));
    let poller = Poller::new(
        store,
        bug_fix_checker(),
        dispatcher,
        10,
        Duration::from_secs(60),
    );

    let first = poller.run_cycle(&CancellationToken::new()).await.unwrap();
    let second = poller.run_cycle(&CancellationToken::new()).await.unwrap();

    assert_eq!(first.changed, 1);
    assert_eq!(second.checked, 1);
    assert_eq!(second.changed, 0);
    assert_eq!(updates.published().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_both_transports_down_dead_letters_event() {
    let store = Arc::new(InMemoryStore::new());
    let resource =
        TrackedResource::from_url(Uuid::new_v4(), "https://github.com/acme/widgets", utc(1))
            .unwrap();
    store.insert(resource.clone());

    let updates = Arc::new(MemoryStream::new("link_updates"));
    updates.fail_publishes(true);
    let dlq = Arc::new(MemoryStream::new("dead-letter-topic"));
    let dispatcher = Arc::new(NotificationDispatcher::new(
        Arc::new(UnavailableEndpoint::default()),
        Arc::new(QueueTransport::new(updates.clone())),
        RetryPolicy::new(2, Duration::from_millis(10)),
        BreakerConfig::default(),
        metrics(),
    ));
    let poller = Poller::new(
        store.clone(),
        bug_fix_checker(),
        dispatcher.clone(),
        10,
        Duration::from_secs(60),
    )
    .with_dead_letters(DeadLetterRouter::new(dlq.clone()));

    let report = poller.run_cycle(&CancellationToken::new()).await.unwrap();

    assert_eq!(report.delivery_failures, 1);
    assert_eq!(dispatcher.stats().failed, 1);
    assert!(store.get(resource.id).unwrap().last_checked_at > utc(1));

    let dead: ChangeEvent = serde_json::from_slice(&dlq.published()[0]).unwrap();
    assert_eq!(dead.resource_id, resource.id);
    assert_eq!(dead.title.as_deref(), Some("Bug fix"));
}

// ---------------------------------------------------------------------------
// PostgreSQL store
// ---------------------------------------------------------------------------

async fn setup(pool: &PgPool) -> PgSubscriptionStore {
    sqlx::migrate!("../../migrations").run(pool).await.unwrap();
    sqlx::query("DELETE FROM tracked_resources")
        .execute(pool)
        .await
        .unwrap();
    PgSubscriptionStore::new(pool.clone())
}

#[sqlx::test]
#[ignore] // Requires DATABASE_URL, run explicitly with --ignored
async fn test_track_is_idempotent(pool: PgPool) {
    let store = setup(&pool).await;

    let first = store.track("https://stackoverflow.com/questions/42").await.unwrap();
    let again = store.track("https://stackoverflow.com/questions/42").await.unwrap();

    assert_eq!(first.id, again.id);
    assert_eq!(first.kind, ResourceKind::Question);
    assert!(store.track("https://example.com/x").await.is_err());
}

#[sqlx::test]
#[ignore]
async fn test_pages_ordered_by_checkpoint(pool: PgPool) {
    let store = setup(&pool).await;

    let a = store.track("https://github.com/a/one").await.unwrap();
    let b = store.track("https://github.com/a/two").await.unwrap();
    store.advance_checkpoint(a.id, Utc::now() + chrono::Duration::hours(1)).await.unwrap();

    let page = store.list_resources(0, 1).await.unwrap();
    assert_eq!(page[0].id, b.id);
    let page = store.list_resources(1, 10).await.unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].id, a.id);
}

#[sqlx::test]
#[ignore]
async fn test_checkpoint_is_monotonic_utc(pool: PgPool) {
    let store = setup(&pool).await;
    let r = store.track("https://github.com/a/b").await.unwrap();

    let later = Utc.with_ymd_and_hms(2030, 6, 1, 12, 0, 0).unwrap();
    store.advance_checkpoint(r.id, later).await.unwrap();
    assert_eq!(store.get(r.id).await.unwrap().last_checked_at, later);

    store.advance_checkpoint(r.id, utc(1)).await.unwrap();
    assert_eq!(store.get(r.id).await.unwrap().last_checked_at, later);

    assert!(store.advance_checkpoint(Uuid::new_v4(), later).await.is_err());
}
