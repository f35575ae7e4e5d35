//! Postgres request store.
//!
//! Spec and status are JSONB columns; `phase` is denormalized into its own
//! column for filtering. Every write bumps `resource_version`, and status
//! writes only land when the caller's version still matches.

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use uuid::Uuid;

use super::RequestStore;
use crate::error::{Error, Result};
use crate::model::{
    NewNotificationRequest, NotificationRequest, NotificationSpec, NotificationStatus, Phase,
    RequestId,
};

const SELECT_COLUMNS: &str =
    "SELECT id, generation, resource_version, spec, status, created_at, updated_at FROM notification_requests";

/// Database handle. Owns the connection pool.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Other(format!("migration failed: {e}")))?;
        Ok(())
    }

    /// Simple health check: runs `SELECT 1`.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn exists(&self, id: &RequestId) -> Result<bool> {
        let row: Option<(i32,)> = sqlx::query_as("SELECT 1 FROM notification_requests WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }
}

#[async_trait]
impl RequestStore for PgStore {
    async fn create(&self, new: NewNotificationRequest) -> Result<NotificationRequest> {
        let spec = new.into_spec()?;
        let row: RequestRow = sqlx::query_as(
            "INSERT INTO notification_requests (id, generation, resource_version, phase, spec, status, created_at, updated_at)
             VALUES ($1, 1, 1, $2, $3, $4, now(), now())
             RETURNING id, generation, resource_version, spec, status, created_at, updated_at",
        )
        .bind(Uuid::new_v4())
        .bind(Phase::Pending.to_string())
        .bind(Json(&spec))
        .bind(Json(NotificationStatus::default()))
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into_request())
    }

    async fn get(&self, id: &RequestId) -> Result<Option<NotificationRequest>> {
        let row: Option<RequestRow> = sqlx::query_as(&format!("{SELECT_COLUMNS} WHERE id = $1"))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(RequestRow::into_request))
    }

    async fn list(&self, phase: Option<Phase>, limit: i64) -> Result<Vec<NotificationRequest>> {
        let rows: Vec<RequestRow> = sqlx::query_as(&format!(
            "{SELECT_COLUMNS} WHERE ($1::text IS NULL OR phase = $1) ORDER BY created_at DESC LIMIT $2"
        ))
        .bind(phase.map(|p| p.to_string()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(RequestRow::into_request).collect())
    }

    async fn list_active(&self) -> Result<Vec<RequestId>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM notification_requests
             WHERE phase NOT IN ('Sent', 'Failed')
             ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| RequestId(id)).collect())
    }

    async fn update_spec(
        &self,
        id: &RequestId,
        spec: NotificationSpec,
    ) -> Result<NotificationRequest> {
        let spec = spec.normalized()?;
        let row: Option<RequestRow> = sqlx::query_as(
            "UPDATE notification_requests
             SET spec = $1, generation = generation + 1, resource_version = resource_version + 1, updated_at = now()
             WHERE id = $2 AND phase NOT IN ('Sent', 'Failed')
             RETURNING id, generation, resource_version, spec, status, created_at, updated_at",
        )
        .bind(Json(&spec))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(row.into_request()),
            None if self.exists(id).await? => Err(Error::Immutable(id.to_string())),
            None => Err(Error::NotFound(id.to_string())),
        }
    }

    async fn update_status(
        &self,
        id: &RequestId,
        expected_version: i64,
        status: &NotificationStatus,
    ) -> Result<i64> {
        let row: Option<(i64,)> = sqlx::query_as(
            "UPDATE notification_requests
             SET status = $1, phase = $2, resource_version = resource_version + 1, updated_at = now()
             WHERE id = $3 AND resource_version = $4
             RETURNING resource_version",
        )
        .bind(Json(status))
        .bind(status.phase.to_string())
        .bind(id.0)
        .bind(expected_version)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((version,)) => Ok(version),
            None if self.exists(id).await? => Err(Error::Conflict(id.to_string())),
            None => Err(Error::NotFound(id.to_string())),
        }
    }

    async fn delete(&self, id: &RequestId) -> Result<bool> {
        let rows_affected = sqlx::query("DELETE FROM notification_requests WHERE id = $1")
            .bind(id.0)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(rows_affected > 0)
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct RequestRow {
    id: Uuid,
    generation: i64,
    resource_version: i64,
    spec: Json<NotificationSpec>,
    status: Json<NotificationStatus>,
    created_at: chrono::DateTime<chrono::Utc>,
    updated_at: chrono::DateTime<chrono::Utc>,
}

impl RequestRow {
    fn into_request(self) -> NotificationRequest {
        NotificationRequest {
            id: RequestId(self.id),
            generation: self.generation,
            resource_version: self.resource_version,
            spec: self.spec.0,
            status: self.status.0,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}
