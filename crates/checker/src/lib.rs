pub mod github;
pub mod stackoverflow;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use linkwatch_common::types::{ChangeEvent, ResourceKind, ResourceRef, TrackedResource};

/// Failure while querying an upstream resource API.
#[derive(Debug, Error)]
pub enum CheckError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Upstream returned {status} for {url}")]
    Status { status: u16, url: String },

    #[error("Unsupported URL: {0}")]
    UnsupportedUrl(String),

    #[error("No activity source registered for {0} resources")]
    NoSource(ResourceKind),

    #[error("Resource {url} is registered as {registered} but looks like a {actual}")]
    KindMismatch {
        url: String,
        registered: ResourceKind,
        actual: ResourceKind,
    },
}

/// Most recent upstream activity on a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Activity {
    pub updated_at: DateTime<Utc>,
    pub title: Option<String>,
    pub author: Option<String>,
    pub body: Option<String>,
}

/// Trait that every resource API client implements.
#[async_trait]
pub trait ActivitySource: Send + Sync {
    /// The resource kind this source understands.
    fn kind(&self) -> ResourceKind;

    /// Fetch the latest activity. `Ok(None)` means the upstream has nothing to report.
    async fn fetch_latest_activity(
        &self,
        resource: &ResourceRef,
    ) -> Result<Option<Activity>, CheckError>;

    /// Human-readable name for logs (e.g., "Stack Overflow").
    fn name(&self) -> &'static str;
}

/// A resource changed iff the observed activity is strictly after the checkpoint.
pub fn is_newer(observed: DateTime<Utc>, checkpoint: DateTime<Utc>) -> bool {
    observed > checkpoint
}

/// Per-kind change detection, dispatched on `TrackedResource::kind`.
#[derive(Clone, Default)]
pub struct ResourceChangeChecker {
    sources: HashMap<ResourceKind, Arc<dyn ActivitySource>>,
}

impl ResourceChangeChecker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a source for the kind it reports. Replaces any previous source.
    pub fn with_source(mut self, source: Arc<dyn ActivitySource>) -> Self {
        self.sources.insert(source.kind(), source);
        self
    }

    /// Check a resource for changes since its checkpoint.
    ///
    /// Upstream failures are logged and reported as "no change" so one broken
    /// resource never interrupts a scan.
    pub async fn check_for_update(&self, resource: &TrackedResource) -> Option<ChangeEvent> {
        match self.try_check(resource).await {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(
                    resource_id = %resource.id,
                    url = %resource.url,
                    error = %e,
                    "Resource check failed, treating as unchanged"
                );
                None
            }
        }
    }

    /// Same as `check_for_update` but surfaces the upstream error.
    pub async fn try_check(
        &self,
        resource: &TrackedResource,
    ) -> Result<Option<ChangeEvent>, CheckError> {
        let source = self
            .sources
            .get(&resource.kind)
            .ok_or(CheckError::NoSource(resource.kind))?;

        let reference = ResourceRef::parse(&resource.url)
            .ok_or_else(|| CheckError::UnsupportedUrl(resource.url.clone()))?;
        if reference.kind() != resource.kind {
            return Err(CheckError::KindMismatch {
                url: resource.url.clone(),
                registered: resource.kind,
                actual: reference.kind(),
            });
        }

        tracing::debug!(
            source = source.name(),
            resource = %reference,
            "Checking resource for updates"
        );

        let Some(activity) = source.fetch_latest_activity(&reference).await? else {
            tracing::debug!(resource = %reference, "No activity reported");
            return Ok(None);
        };

        if !is_newer(activity.updated_at, resource.last_checked_at) {
            return Ok(None);
        }

        tracing::info!(
            resource_id = %resource.id,
            resource = %reference,
            updated_at = %activity.updated_at,
            "Update found"
        );

        Ok(Some(
            ChangeEvent::new(resource, activity.updated_at).with_details(
                activity.title,
                activity.author,
                activity.body,
            ),
        ))
    }
}
