//! Stack Exchange API client for tracked Stack Overflow questions.
//!
//! A question's `last_activity_date` moves on every edit, answer and comment,
//! so it is the single timestamp the checker compares against.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::Client;
use serde::Deserialize;

use linkwatch_common::types::{ResourceKind, ResourceRef};

use crate::{Activity, ActivitySource, CheckError};

pub const DEFAULT_API_URL: &str = "https://api.stackexchange.com/2.3";

#[derive(Debug, Deserialize)]
struct QuestionsResponse {
    #[serde(default)]
    items: Vec<Question>,
}

#[derive(Debug, Deserialize)]
struct Question {
    last_activity_date: Option<i64>,
    title: Option<String>,
    owner: Option<Owner>,
    body: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Owner {
    display_name: Option<String>,
}

impl Question {
    fn into_activity(self) -> Option<Activity> {
        let updated_at: DateTime<Utc> = Utc
            .timestamp_opt(self.last_activity_date?, 0)
            .single()?;

        Some(Activity {
            updated_at,
            title: self.title,
            author: self.owner.and_then(|o| o.display_name),
            body: self.body,
        })
    }
}

/// Client for the `/questions/{id}` endpoint.
pub struct StackOverflowClient {
    client: Client,
    api_url: String,
    api_key: Option<String>,
}

impl StackOverflowClient {
    pub fn new(client: Client, api_key: Option<String>) -> Self {
        Self {
            client,
            api_url: DEFAULT_API_URL.to_string(),
            api_key,
        }
    }

    /// Point the client at a different API root (used by tests and mirrors).
    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    fn question_url(&self, question_id: u64) -> String {
        format!(
            "{}/questions/{}",
            self.api_url.trim_end_matches('/'),
            question_id
        )
    }

    async fn get_question(&self, question_id: u64) -> Result<Option<Question>, CheckError> {
        let url = self.question_url(question_id);
        let mut query = vec![("site", "stackoverflow"), ("filter", "withbody")];
        if let Some(key) = &self.api_key {
            query.push(("key", key.as_str()));
        }

        let response = self.client.get(&url).query(&query).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(CheckError::Status {
                status: status.as_u16(),
                url,
            });
        }

        let data: QuestionsResponse = response.json().await?;
        if data.items.is_empty() {
            tracing::warn!(question_id, "No data found for question");
        }
        Ok(data.items.into_iter().next())
    }
}

#[async_trait]
impl ActivitySource for StackOverflowClient {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Question
    }

    async fn fetch_latest_activity(
        &self,
        resource: &ResourceRef,
    ) -> Result<Option<Activity>, CheckError> {
        let ResourceRef::Question { id } = resource else {
            return Err(CheckError::KindMismatch {
                url: resource.to_string(),
                registered: ResourceKind::Question,
                actual: resource.kind(),
            });
        };

        let activity = self
            .get_question(*id)
            .await?
            .and_then(Question::into_activity);

        if activity.is_none() {
            tracing::warn!(question_id = id, "Question has no last_activity_date");
        }
        Ok(activity)
    }

    fn name(&self) -> &'static str {
        "Stack Overflow"
    }
}
