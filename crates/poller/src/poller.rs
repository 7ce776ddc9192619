use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use linkwatch_checker::ResourceChangeChecker;
use linkwatch_common::error::AppError;
use linkwatch_common::types::{ChangeEvent, TrackedResource};
use linkwatch_notifier::dead_letter::DeadLetterRouter;
use linkwatch_notifier::dispatcher::Deliver;
use linkwatch_notifier::error::DeliveryFailed;

use crate::store::SubscriptionStore;

/// Totals for one pass over the tracked resources.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub checked: u64,
    pub changed: u64,
    pub delivered: u64,
    pub delivery_failures: u64,
    pub check_errors: u64,
    pub store_errors: u64,
}

/// Periodically checks every tracked resource and dispatches change events.
pub struct Poller {
    store: Arc<dyn SubscriptionStore>,
    checker: ResourceChangeChecker,
    dispatcher: Arc<dyn Deliver>,
    dead_letters: Option<DeadLetterRouter>,
    batch_size: u32,
    interval: Duration,
}

impl Poller {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        checker: ResourceChangeChecker,
        dispatcher: Arc<dyn Deliver>,
        batch_size: u32,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            checker,
            dispatcher,
            dead_letters: None,
            batch_size: batch_size.max(1),
            interval,
        }
    }

    /// Route events that neither transport accepted to a dead-letter topic.
    pub fn with_dead_letters(mut self, router: DeadLetterRouter) -> Self {
        self.dead_letters = Some(router);
        self
    }

    /// Run cycles until `shutdown` fires. The resource being processed when
    /// shutdown is requested is finished first.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(
            batch_size = self.batch_size,
            interval_secs = self.interval.as_secs(),
            "Poller started"
        );

        while !shutdown.is_cancelled() {
            match self.run_cycle(&shutdown).await {
                Ok(report) => {
                    let stats = self.dispatcher.stats();
                    tracing::info!(
                        checked = report.checked,
                        changed = report.changed,
                        delivered = report.delivered,
                        delivery_failures = report.delivery_failures,
                        check_errors = report.check_errors,
                        store_errors = report.store_errors,
                        total_via_primary = stats.via_primary,
                        total_via_secondary = stats.via_secondary,
                        total_failed = stats.failed,
                        "Poll cycle finished"
                    );
                }
                Err(e) => {
                    tracing::error!(error = %e, "Poll cycle aborted");
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        tracing::info!("Poller stopped");
    }

    /// One pass over every tracked resource, oldest checkpoint first.
    ///
    /// Advancing a checkpoint moves that resource to the end of the ordering,
    /// so the page offset only grows by the resources left in place, and
    /// resources already seen this cycle are skipped.
    pub async fn run_cycle(&self, shutdown: &CancellationToken) -> Result<CycleReport, AppError> {
        let mut report = CycleReport::default();
        let mut visited: HashSet<Uuid> = HashSet::new();
        let mut offset: u64 = 0;

        'pages: loop {
            let batch = self.store.list_resources(offset, self.batch_size).await?;
            if batch.is_empty() {
                break;
            }

            let mut fresh = 0usize;
            let mut advanced = 0usize;
            for resource in &batch {
                if shutdown.is_cancelled() {
                    tracing::info!("Shutdown requested, ending cycle early");
                    break 'pages;
                }
                if !visited.insert(resource.id) {
                    continue;
                }
                fresh += 1;
                if self.process(resource, &mut report).await {
                    advanced += 1;
                }
            }

            if fresh == 0 || batch.len() < self.batch_size as usize {
                break;
            }
            offset += (batch.len() - advanced) as u64;
        }

        Ok(report)
    }

    /// Check one resource. Returns whether its checkpoint moved.
    async fn process(&self, resource: &TrackedResource, report: &mut CycleReport) -> bool {
        // Taken before the check so activity during the check is seen next cycle.
        let checked_at = Utc::now();
        report.checked += 1;

        let event = match self.checker.try_check(resource).await {
            Ok(event) => event,
            Err(e) => {
                report.check_errors += 1;
                tracing::warn!(
                    resource_id = %resource.id,
                    url = %resource.url,
                    error = %e,
                    "Resource check failed, will retry next cycle"
                );
                return false;
            }
        };

        if let Some(event) = event {
            report.changed += 1;
            match self.dispatcher.deliver(&event).await {
                Ok(_) => report.delivered += 1,
                Err(failed) => {
                    report.delivery_failures += 1;
                    self.dead_letter(&event, &failed).await;
                }
            }
        }

        match self.store.advance_checkpoint(resource.id, checked_at).await {
            Ok(()) => true,
            Err(e) => {
                report.store_errors += 1;
                tracing::error!(
                    resource_id = %resource.id,
                    error = %e,
                    "Failed to advance checkpoint"
                );
                false
            }
        }
    }

    async fn dead_letter(&self, event: &ChangeEvent, failed: &DeliveryFailed) {
        let Some(router) = &self.dead_letters else {
            tracing::error!(
                resource_id = %event.resource_id,
                error = %failed,
                "Event undeliverable and no dead-letter topic configured"
            );
            return;
        };

        let payload = match serde_json::to_vec(event) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(
                    resource_id = %event.resource_id,
                    error = %e,
                    "Failed to encode event"
                );
                return;
            }
        };

        if let Err(e) = router.route(&payload, &failed.to_string()).await {
            tracing::error!(
                resource_id = %event.resource_id,
                error = %e,
                "Failed to dead-letter undeliverable event"
            );
        }
    }
}
