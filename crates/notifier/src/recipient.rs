//! End recipients of rendered update messages.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use thiserror::Error;

use linkwatch_common::types::truncate_chars;

/// Telegram `sendMessage` text limit (characters).
const TELEGRAM_MESSAGE_LIMIT: usize = 4096;

pub const TELEGRAM_API_URL: &str = "https://api.telegram.org";

#[derive(Debug, Error)]
pub enum RecipientError {
    /// Carries no request URL, which embeds the bot token.
    #[error("recipient request failed: {0}")]
    Http(reqwest::Error),

    #[error("recipient rejected message: HTTP {status}: {body}")]
    Rejected { status: u16, body: String },
}

#[async_trait]
pub trait Recipient: Send + Sync {
    async fn forward(&self, text: &str) -> Result<(), RecipientError>;
}

/// Posts messages to one Telegram chat through the Bot API.
pub struct TelegramRecipient {
    client: Client,
    api_url: String,
    bot_token: String,
    chat_id: String,
}

impl TelegramRecipient {
    pub fn new(client: Client, bot_token: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self {
            client,
            api_url: TELEGRAM_API_URL.to_string(),
            bot_token: bot_token.into(),
            chat_id: chat_id.into(),
        }
    }

    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    fn send_message_url(&self) -> String {
        format!(
            "{}/bot{}/sendMessage",
            self.api_url.trim_end_matches('/'),
            self.bot_token
        )
    }
}

#[async_trait]
impl Recipient for TelegramRecipient {
    async fn forward(&self, text: &str) -> Result<(), RecipientError> {
        let payload = json!({
            "chat_id": self.chat_id,
            "text": truncate_chars(text, TELEGRAM_MESSAGE_LIMIT),
        });

        let response = self
            .client
            .post(self.send_message_url())
            .json(&payload)
            .send()
            .await
            .map_err(|e| RecipientError::Http(e.without_url()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(status = status.as_u16(), body = %body, "Telegram sendMessage failed");
            return Err(RecipientError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

/// Writes messages to the log. Used when no chat is configured.
#[derive(Debug, Default)]
pub struct LogRecipient;

#[async_trait]
impl Recipient for LogRecipient {
    async fn forward(&self, text: &str) -> Result<(), RecipientError> {
        tracing::info!(message = %text, "Update notification");
        Ok(())
    }
}
