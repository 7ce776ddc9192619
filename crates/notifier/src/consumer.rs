//! Reads change events off the updates topic and forwards them to the recipient.
//!
//! A message is acknowledged once it has either been forwarded or been copied
//! to the dead-letter topic. If neither succeeds it stays pending on the
//! stream. Pending entries are re-read when the consumer starts and claimed
//! again once they have been idle for a while, which keeps delivery
//! at-least-once.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use linkwatch_common::types::{ChangeEvent, PREVIEW_LENGTH, truncate_chars};

use crate::dead_letter::{DeadLetterRouter, READ_ERROR_PAUSE, pause};
use crate::recipient::{Recipient, RecipientError};
use crate::stream::{MessageStream, QueueMessage};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("undecodable event: {0}")]
    Decode(#[from] serde_json::Error),

    #[error(transparent)]
    Recipient(#[from] RecipientError),
}

/// User-facing text for one change event.
pub fn render_message(event: &ChangeEvent) -> String {
    let preview = event
        .preview
        .as_deref()
        .map(|p| truncate_chars(p, PREVIEW_LENGTH))
        .unwrap_or_default();

    format!(
        "Update: {}\nUser: {}\nDate: {}\nPreview: {}...\n{}",
        event.title.as_deref().unwrap_or("(untitled)"),
        event.user_name.as_deref().unwrap_or("unknown"),
        event.last_update.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        preview,
        event.url,
    )
}

/// How long an entry may sit unacknowledged before it is claimed again.
pub const DEFAULT_CLAIM_MIN_IDLE: Duration = Duration::from_secs(60);

pub struct UpdateConsumer {
    stream: Arc<dyn MessageStream>,
    recipient: Arc<dyn Recipient>,
    dead_letters: DeadLetterRouter,
    claim_min_idle: Duration,
}

impl UpdateConsumer {
    pub fn new(
        stream: Arc<dyn MessageStream>,
        recipient: Arc<dyn Recipient>,
        dead_letters: DeadLetterRouter,
    ) -> Self {
        Self {
            stream,
            recipient,
            dead_letters,
            claim_min_idle: DEFAULT_CLAIM_MIN_IDLE,
        }
    }

    pub fn with_claim_min_idle(mut self, min_idle: Duration) -> Self {
        self.claim_min_idle = min_idle;
        self
    }

    /// Consume until `shutdown` fires. Entries left pending by an earlier run
    /// are handled first. A read in progress is allowed to finish so no entry
    /// is lost between being read and being handled.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(
            topic = self.stream.topic(),
            dead_letter_topic = self.dead_letters.topic(),
            "Update consumer started"
        );

        match self.stream.read_pending().await {
            Ok(pending) => {
                for message in pending {
                    self.process(message).await;
                }
            }
            Err(e) => tracing::error!(error = %e, "Failed to read pending updates"),
        }

        let mut last_claim = Instant::now();
        while !shutdown.is_cancelled() {
            if last_claim.elapsed() >= self.claim_min_idle {
                last_claim = Instant::now();
                match self.stream.claim_idle(self.claim_min_idle).await {
                    Ok(claimed) => {
                        for message in claimed {
                            self.process(message).await;
                        }
                    }
                    Err(e) => tracing::error!(error = %e, "Failed to claim idle updates"),
                }
            }

            let batch = match self.stream.read_batch().await {
                Ok(batch) => batch,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to read updates topic");
                    pause(&shutdown, READ_ERROR_PAUSE).await;
                    continue;
                }
            };

            for message in batch {
                self.process(message).await;
            }
        }

        tracing::info!("Update consumer stopped");
    }

    /// Decode, render and forward one message.
    pub async fn handle(&self, message: &QueueMessage) -> Result<(), QueueError> {
        let event: ChangeEvent = serde_json::from_slice(&message.payload)?;
        self.recipient.forward(&render_message(&event)).await?;

        tracing::info!(
            entry_id = %message.id,
            resource_id = %event.resource_id,
            url = %event.url,
            "Update forwarded"
        );
        Ok(())
    }

    async fn process(&self, message: QueueMessage) {
        if let Err(e) = self.handle(&message).await {
            tracing::error!(entry_id = %message.id, error = %e, "Failed to process message");

            let routed = self.dead_letters.route(&message.payload, &e.to_string()).await;
            if let Err(dlq_error) = routed {
                tracing::error!(
                    entry_id = %message.id,
                    error = %dlq_error,
                    "Dead-letter publish failed, leaving message pending"
                );
                return;
            }
        }

        if let Err(e) = self.stream.ack(&message.id).await {
            tracing::error!(entry_id = %message.id, error = %e, "Failed to ack message");
        }
    }
}
