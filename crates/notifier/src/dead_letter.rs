use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use linkwatch_common::error::AppError;

use crate::stream::{MessageStream, Publisher, QueueMessage};

/// Pause after a failed read before trying again.
pub(crate) const READ_ERROR_PAUSE: Duration = Duration::from_secs(5);

/// Write side of the dead-letter topic.
pub struct DeadLetterRouter {
    publisher: Arc<dyn Publisher>,
}

impl DeadLetterRouter {
    pub fn new(publisher: Arc<dyn Publisher>) -> Self {
        Self { publisher }
    }

    pub fn topic(&self) -> &str {
        self.publisher.topic()
    }

    /// Publish `payload` byte-for-byte. Returns the dead-letter entry id.
    pub async fn route(&self, payload: &[u8], reason: &str) -> Result<String, AppError> {
        let id = self.publisher.publish(payload).await?;
        tracing::warn!(
            topic = self.publisher.topic(),
            entry_id = %id,
            reason,
            "Message routed to dead-letter topic"
        );
        Ok(id)
    }
}

/// Drains the dead-letter topic for observability. Never re-delivers.
pub struct DeadLetterMonitor {
    stream: Arc<dyn MessageStream>,
}

impl DeadLetterMonitor {
    pub fn new(stream: Arc<dyn MessageStream>) -> Self {
        Self { stream }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(topic = self.stream.topic(), "Dead-letter monitor started");

        match self.stream.read_pending().await {
            Ok(pending) => {
                for message in pending {
                    self.inspect(&message).await;
                }
            }
            Err(e) => tracing::error!(error = %e, "Failed to read pending dead letters"),
        }

        while !shutdown.is_cancelled() {
            let batch = match self.stream.read_batch().await {
                Ok(batch) => batch,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to read dead-letter topic");
                    pause(&shutdown, READ_ERROR_PAUSE).await;
                    continue;
                }
            };

            for message in batch {
                self.inspect(&message).await;
            }
        }

        tracing::info!("Dead-letter monitor stopped");
    }

    async fn inspect(&self, message: &QueueMessage) {
        tracing::warn!(
            entry_id = %message.id,
            payload = %String::from_utf8_lossy(&message.payload),
            "Dead-lettered message"
        );
        if let Err(e) = self.stream.ack(&message.id).await {
            tracing::error!(
                entry_id = %message.id,
                error = %e,
                "Failed to ack dead-lettered message"
            );
        }
    }
}

/// Sleep for `duration` unless shutdown is requested first.
pub(crate) async fn pause(shutdown: &CancellationToken, duration: Duration) {
    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = tokio::time::sleep(duration) => {}
    }
}
