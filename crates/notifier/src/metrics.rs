//! Prometheus counters for notification delivery.

use prometheus::{IntCounterVec, Opts, Registry};

pub const NOTIFICATIONS_TOTAL: &str = "linkwatch_notifications_total";

/// Where a dispatched event ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Primary,
    Secondary,
    Failed,
}

impl DeliveryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryOutcome::Primary => "primary",
            DeliveryOutcome::Secondary => "secondary",
            DeliveryOutcome::Failed => "failed",
        }
    }
}

/// Snapshot of the delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    pub via_primary: u64,
    pub via_secondary: u64,
    pub failed: u64,
}

/// Delivery counters, labelled by outcome.
#[derive(Clone)]
pub struct DeliveryMetrics {
    notifications: IntCounterVec,
}

impl DeliveryMetrics {
    /// Create the counters and register them with `registry`.
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let notifications = IntCounterVec::new(
            Opts::new(
                NOTIFICATIONS_TOTAL,
                "Change events dispatched, by delivery outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(notifications.clone()))?;

        Ok(Self { notifications })
    }

    pub fn record(&self, outcome: DeliveryOutcome) {
        self.notifications
            .with_label_values(&[outcome.as_str()])
            .inc();
    }

    fn count(&self, outcome: DeliveryOutcome) -> u64 {
        self.notifications.with_label_values(&[outcome.as_str()]).get()
    }

    pub fn stats(&self) -> DeliveryStats {
        DeliveryStats {
            via_primary: self.count(DeliveryOutcome::Primary),
            via_secondary: self.count(DeliveryOutcome::Secondary),
            failed: self.count(DeliveryOutcome::Failed),
        }
    }
}
