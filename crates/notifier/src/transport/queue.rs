use std::sync::Arc;

use async_trait::async_trait;

use linkwatch_common::types::{ChangeEvent, TransportKind};

use super::Transport;
use crate::error::TransportError;
use crate::stream::Publisher;

/// Durable delivery: append the event JSON to the updates stream.
pub struct QueueTransport {
    publisher: Arc<dyn Publisher>,
}

impl QueueTransport {
    pub fn new(publisher: Arc<dyn Publisher>) -> Self {
        Self { publisher }
    }
}

#[async_trait]
impl Transport for QueueTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Queue
    }

    async fn send(&self, event: &ChangeEvent) -> Result<(), TransportError> {
        let payload = serde_json::to_vec(event)?;
        let entry_id = self.publisher.publish(&payload).await?;

        tracing::debug!(
            resource_id = %event.resource_id,
            topic = self.publisher.topic(),
            entry_id = %entry_id,
            "Event published"
        );
        Ok(())
    }
}
