use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use parking_lot::Mutex;
use sqlx::PgPool;
use uuid::Uuid;

use linkwatch_common::error::AppError;
use linkwatch_common::types::{ResourceKind, TrackedResource, checkpoint_from_naive};

/// Where tracked resources and their checkpoints live.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// One page of resources, oldest checkpoint first.
    async fn list_resources(
        &self,
        offset: u64,
        limit: u32,
    ) -> Result<Vec<TrackedResource>, AppError>;

    /// Move a resource's checkpoint forward to `at`. Never moves it back.
    async fn advance_checkpoint(
        &self,
        resource_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), AppError>;
}

type ResourceRow = (Uuid, String, String, NaiveDateTime);

fn resource_from_row(
    (id, url, kind, last_checked_at): ResourceRow,
) -> Result<TrackedResource, AppError> {
    let kind: ResourceKind = kind.parse().map_err(AppError::Validation)?;
    Ok(TrackedResource {
        id,
        url,
        kind,
        last_checked_at: checkpoint_from_naive(last_checked_at),
    })
}

/// PostgreSQL-backed store over the `tracked_resources` table.
#[derive(Clone)]
pub struct PgSubscriptionStore {
    pool: PgPool,
}

impl PgSubscriptionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Start tracking a URL. Already-tracked URLs are returned unchanged.
    ///
    /// New resources start with a checkpoint of now, so only activity after
    /// subscription is reported.
    pub async fn track(&self, url: &str) -> Result<TrackedResource, AppError> {
        let kind = ResourceKind::classify(url)
            .ok_or_else(|| AppError::Validation(format!("unsupported URL: {}", url)))?;

        let row: ResourceRow = sqlx::query_as(
            r#"
            INSERT INTO tracked_resources (id, url, kind, last_checked_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (url) DO UPDATE SET url = EXCLUDED.url
            RETURNING id, url, kind, last_checked_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(url)
        .bind(kind.to_string())
        .bind(Utc::now().naive_utc())
        .fetch_one(&self.pool)
        .await?;

        resource_from_row(row)
    }

    pub async fn get(&self, resource_id: Uuid) -> Result<TrackedResource, AppError> {
        let row: Option<ResourceRow> = sqlx::query_as(
            "SELECT id, url, kind, last_checked_at FROM tracked_resources WHERE id = $1",
        )
        .bind(resource_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(resource_from_row)
            .transpose()?
            .ok_or_else(|| AppError::NotFound(format!("tracked resource {}", resource_id)))
    }
}

#[async_trait]
impl SubscriptionStore for PgSubscriptionStore {
    async fn list_resources(
        &self,
        offset: u64,
        limit: u32,
    ) -> Result<Vec<TrackedResource>, AppError> {
        let rows: Vec<ResourceRow> = sqlx::query_as(
            r#"
            SELECT id, url, kind, last_checked_at
            FROM tracked_resources
            ORDER BY last_checked_at ASC, id ASC
            OFFSET $1 LIMIT $2
            "#,
        )
        .bind(offset as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(resource_from_row).collect()
    }

    async fn advance_checkpoint(
        &self,
        resource_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE tracked_resources
            SET last_checked_at = GREATEST(last_checked_at, $2)
            WHERE id = $1
            "#,
        )
        .bind(resource_id)
        .bind(at.naive_utc())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("tracked resource {}", resource_id)));
        }
        Ok(())
    }
}

/// Process-local store for tests and dry runs.
#[derive(Default)]
pub struct InMemoryStore {
    resources: Mutex<HashMap<Uuid, TrackedResource>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, resource: TrackedResource) {
        self.resources.lock().insert(resource.id, resource);
    }

    pub fn get(&self, resource_id: Uuid) -> Option<TrackedResource> {
        self.resources.lock().get(&resource_id).cloned()
    }
}

#[async_trait]
impl SubscriptionStore for InMemoryStore {
    async fn list_resources(
        &self,
        offset: u64,
        limit: u32,
    ) -> Result<Vec<TrackedResource>, AppError> {
        let mut all: Vec<TrackedResource> = self.resources.lock().values().cloned().collect();
        all.sort_by(|a, b| {
            a.last_checked_at
                .cmp(&b.last_checked_at)
                .then_with(|| a.id.cmp(&b.id))
        });

        Ok(all
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn advance_checkpoint(
        &self,
        resource_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let mut resources = self.resources.lock();
        let resource = resources
            .get_mut(&resource_id)
            .ok_or_else(|| AppError::NotFound(format!("tracked resource {}", resource_id)))?;
        resource.last_checked_at = resource.last_checked_at.max(at);
        Ok(())
    }
}
