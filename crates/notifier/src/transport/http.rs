use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use linkwatch_common::types::{ChangeEvent, TransportKind};

use super::Transport;
use crate::error::TransportError;

/// Point-to-point delivery: `POST {endpoint}` with the event as JSON. Success is any 2xx.
pub struct HttpTransport {
    client: Client,
    endpoint: String,
}

impl HttpTransport {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> reqwest::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, endpoint))
    }

    pub fn with_client(client: Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    async fn send(&self, event: &ChangeEvent) -> Result<(), TransportError> {
        let response = self.client.post(&self.endpoint).json(event).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::from_status(status, &body));
        }

        tracing::debug!(
            resource_id = %event.resource_id,
            status = status.as_u16(),
            "Event posted"
        );
        Ok(())
    }
}
