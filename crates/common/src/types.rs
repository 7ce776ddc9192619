use std::sync::LazyLock;

use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum number of characters kept in an event preview.
pub const PREVIEW_LENGTH: usize = 200;

static QUESTION_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^https://stackoverflow\.com/questions/(\d+)").expect("question regex is valid")
});

static REPOSITORY_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^https://github\.com/([^/]+)/([^/]+?)/?$").expect("repository regex is valid")
});

/// Kinds of external resources that can be tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    /// A Stack Overflow question.
    Question,
    /// A GitHub repository (issue and pull request activity).
    Repository,
}

impl ResourceKind {
    /// Classify a canonical URL. Returns `None` for unsupported URLs.
    pub fn classify(url: &str) -> Option<Self> {
        ResourceRef::parse(url).map(|r| r.kind())
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Question => write!(f, "question"),
            ResourceKind::Repository => write!(f, "repository"),
        }
    }
}

impl std::str::FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "question" => Ok(ResourceKind::Question),
            "repository" => Ok(ResourceKind::Repository),
            other => Err(format!("unknown resource kind '{}'", other)),
        }
    }
}

/// The API-level identity of a resource, extracted from its canonical URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceRef {
    Question { id: u64 },
    Repository { owner: String, name: String },
}

impl ResourceRef {
    /// Parse a canonical URL into the reference the resource APIs understand.
    ///
    /// This is the single place where URLs are mapped to resource kinds.
    pub fn parse(url: &str) -> Option<Self> {
        if let Some(caps) = QUESTION_URL.captures(url) {
            let id = caps.get(1)?.as_str().parse().ok()?;
            return Some(ResourceRef::Question { id });
        }

        if let Some(caps) = REPOSITORY_URL.captures(url) {
            return Some(ResourceRef::Repository {
                owner: caps.get(1)?.as_str().to_string(),
                name: caps.get(2)?.as_str().to_string(),
            });
        }

        None
    }

    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceRef::Question { .. } => ResourceKind::Question,
            ResourceRef::Repository { .. } => ResourceKind::Repository,
        }
    }
}

impl std::fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceRef::Question { id } => write!(f, "question #{}", id),
            ResourceRef::Repository { owner, name } => write!(f, "{}/{}", owner, name),
        }
    }
}

/// A resource tracked on behalf of one or more users.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedResource {
    pub id: Uuid,
    pub url: String,
    pub kind: ResourceKind,
    /// Checkpoint of the last completed poll. Only ever moves forward.
    pub last_checked_at: DateTime<Utc>,
}

impl TrackedResource {
    /// Build a resource from a URL, classifying its kind.
    pub fn from_url(
        id: Uuid,
        url: impl Into<String>,
        last_checked_at: DateTime<Utc>,
    ) -> Option<Self> {
        let url = url.into();
        let kind = ResourceKind::classify(&url)?;
        Some(Self {
            id,
            url,
            kind,
            last_checked_at,
        })
    }
}

/// Interpret a checkpoint stored without an offset as UTC.
pub fn checkpoint_from_naive(naive: NaiveDateTime) -> DateTime<Utc> {
    naive.and_utc()
}

/// "Resource changed" notification, as carried by every transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub resource_id: Uuid,
    pub url: String,
    /// When the upstream activity happened.
    pub last_update: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
}

impl ChangeEvent {
    pub fn new(resource: &TrackedResource, last_update: DateTime<Utc>) -> Self {
        Self {
            resource_id: resource.id,
            url: resource.url.clone(),
            last_update,
            title: None,
            user_name: None,
            preview: None,
        }
    }

    /// Attach title, author and preview. The preview is cut to `PREVIEW_LENGTH` characters.
    pub fn with_details(
        mut self,
        title: Option<String>,
        user_name: Option<String>,
        preview: Option<String>,
    ) -> Self {
        self.title = title;
        self.user_name = user_name;
        self.preview = preview.map(|p| truncate_chars(&p, PREVIEW_LENGTH).to_string());
        self
    }
}

/// Truncate to at most `max` characters without splitting a UTF-8 sequence.
pub fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Delivery mechanisms available to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Point-to-point HTTP POST.
    Http,
    /// Durable append-only queue (Redis stream).
    Queue,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Http => write!(f, "http"),
            TransportKind::Queue => write!(f, "queue"),
        }
    }
}

impl std::str::FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(TransportKind::Http),
            "queue" | "kafka" | "redis" => Ok(TransportKind::Queue),
            other => Err(format!("unknown transport '{}'", other)),
        }
    }
}
