//! Photo metadata persistence and query filtering.
//!
//! Photos are append-only: the ingestion pipeline is the sole writer and a
//! record is never updated or deleted by this service. Presigned URLs are
//! never stored; the query layer derives them from `timestamp` and
//! `image_type` at response time.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::config::DatabaseConfig;

/// Persisted photo metadata.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Photo {
    /// Store-assigned identifier.
    pub id: Uuid,
    /// Ingestion timestamp (UTC), also the basis of the archive key.
    pub timestamp: DateTime<Utc>,
    /// Container format derived from the decoded payload (`jpeg`, `png`, ..).
    pub image_type: String,
    /// Loose reference to the publishing device; not enforced by the store.
    pub device_id: Option<String>,
    /// OCR output, or the failure sentinel.
    #[sqlx(rename = "ocr_text")]
    pub text: String,
    pub created_at: DateTime<Utc>,
}

/// Fields supplied by the ingestion pipeline when persisting a photo.
#[derive(Debug, Clone)]
pub struct NewPhoto {
    pub timestamp: DateTime<Utc>,
    pub image_type: String,
    pub device_id: Option<String>,
    pub text: String,
}

/// Query filters for photo retrieval. Both bounds are inclusive.
#[derive(Debug, Clone)]
pub struct PhotoQuery {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Case-insensitive substring match against the extracted text.
    pub text: Option<String>,
    /// Exact match against `device_id`.
    pub device_id: Option<String>,
}

/// Photo persistence operations.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PhotoRepository: Send + Sync {
    /// Insert a new photo record. Called exactly once per ingested photo.
    async fn insert(&self, photo: NewPhoto) -> Result<Photo>;

    /// Fetch photos matching the filters, most recent first.
    async fn query(&self, query: &PhotoQuery) -> Result<Vec<Photo>>;

    /// Cheap store connectivity probe for readiness checks.
    async fn ping(&self) -> Result<()>;
}

/// Create the shared Postgres connection pool.
pub async fn connect_pool(config: &DatabaseConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
        .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
        .connect(&config.url)
        .await
        .context("Failed to connect to PostgreSQL")?;

    info!("Connected to PostgreSQL database");

    Ok(pool)
}

/// Escape LIKE metacharacters so a filter value matches literally inside
/// the `%..%` pattern. Paired with `ESCAPE '\'` on the query.
fn escape_like(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

/// Run database migrations.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    info!("Running database migrations");

    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("Failed to run migrations")?;

    info!("Database migrations completed");
    Ok(())
}

/// PostgreSQL-backed photo store.
pub struct PostgresPhotoStore {
    pool: PgPool,
}

impl PostgresPhotoStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PhotoRepository for PostgresPhotoStore {
    #[instrument(skip(self, photo), fields(device_id = ?photo.device_id, image_type = %photo.image_type))]
    async fn insert(&self, photo: NewPhoto) -> Result<Photo> {
        let id = Uuid::new_v4();

        let stored = sqlx::query_as::<_, Photo>(
            r#"
            INSERT INTO photos (id, timestamp, image_type, device_id, ocr_text, created_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            RETURNING id, timestamp, image_type, device_id, ocr_text, created_at
            "#,
        )
        .bind(id)
        .bind(photo.timestamp)
        .bind(&photo.image_type)
        .bind(&photo.device_id)
        .bind(&photo.text)
        .fetch_one(&self.pool)
        .await
        .context("Failed to insert photo metadata")?;

        debug!(photo_id = %stored.id, "Photo metadata persisted");

        metrics::counter!("photosink.photos.persisted").increment(1);

        Ok(stored)
    }

    #[instrument(skip(self))]
    async fn query(&self, query: &PhotoQuery) -> Result<Vec<Photo>> {
        let mut sql = String::from(
            r#"
            SELECT id, timestamp, image_type, device_id, ocr_text, created_at
            FROM photos
            WHERE timestamp >= $1 AND timestamp <= $2
            "#,
        );

        let mut param_count = 2;

        if query.text.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND ocr_text ILIKE ${} ESCAPE '\\'", param_count));
        }

        if query.device_id.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND device_id = ${}", param_count));
        }

        sql.push_str(" ORDER BY timestamp DESC");

        let mut query_builder = sqlx::query_as::<_, Photo>(&sql)
            .bind(query.start)
            .bind(query.end);

        if let Some(ref text) = query.text {
            query_builder = query_builder.bind(format!("%{}%", escape_like(text)));
        }
        if let Some(ref device_id) = query.device_id {
            query_builder = query_builder.bind(device_id);
        }

        query_builder
            .fetch_all(&self.pool)
            .await
            .context("Failed to query photos")
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("Database ping failed")?;
        Ok(())
    }
}

/// In-memory photo store for tests and local development.
#[derive(Default)]
pub struct InMemoryPhotoStore {
    photos: RwLock<Vec<Photo>>,
}

impl InMemoryPhotoStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored photos, unfiltered.
    pub async fn len(&self) -> usize {
        self.photos.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.photos.read().await.is_empty()
    }
}

#[async_trait]
impl PhotoRepository for InMemoryPhotoStore {
    async fn insert(&self, photo: NewPhoto) -> Result<Photo> {
        let stored = Photo {
            id: Uuid::new_v4(),
            timestamp: photo.timestamp,
            image_type: photo.image_type,
            device_id: photo.device_id,
            text: photo.text,
            created_at: Utc::now(),
        };
        self.photos.write().await.push(stored.clone());
        Ok(stored)
    }

    async fn query(&self, query: &PhotoQuery) -> Result<Vec<Photo>> {
        let text_filter = query.text.as_ref().map(|t| t.to_lowercase());

        let mut matches: Vec<Photo> = self
            .photos
            .read()
            .await
            .iter()
            .filter(|p| p.timestamp >= query.start && p.timestamp <= query.end)
            .filter(|p| match &text_filter {
                Some(needle) => p.text.to_lowercase().contains(needle),
                None => true,
            })
            .filter(|p| match &query.device_id {
                Some(device_id) => p.device_id.as_deref() == Some(device_id.as_str()),
                None => true,
            })
            .cloned()
            .collect();

        matches.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        Ok(matches)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
