use crate::config::DatabaseConfig;
use crate::error::ServiceError;
use crate::file_store::validate_filename;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Stored image record
///
/// `name` doubles as the key of the raw file in the upload directory; the
/// record and the file are one logical entity split across two stores.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ImageRecord {
    /// Unique image ID
    pub id: i64,
    /// Unique image name (also the on-disk filename)
    pub name: String,
    /// When the record was created
    pub created_at: DateTime<Utc>,
    /// When the record was last updated
    pub updated_at: DateTime<Utc>,
}

/// Stored tag record, deduplicated by name
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TagRecord {
    /// Unique tag ID
    pub id: i64,
    /// Unique tag name
    pub name: String,
    /// When the record was created
    pub created_at: DateTime<Utc>,
    /// When the record was last updated
    pub updated_at: DateTime<Utc>,
}

/// One labeled bounding box on one image
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DetectionRecord {
    /// Unique detection ID
    pub id: i64,
    /// Owning image
    pub image_id: i64,
    /// Label tag
    pub tag_id: i64,
    pub x_min: i32,
    pub y_min: i32,
    pub x_max: i32,
    pub y_max: i32,
    /// When the record was created
    pub created_at: DateTime<Utc>,
    /// When the record was last updated
    pub updated_at: DateTime<Utc>,
}

/// Joined projection of a detection with its tag name
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct DetectionWithTag {
    pub id: i64,
    pub tag_name: String,
    pub x_min: i32,
    pub y_min: i32,
    pub x_max: i32,
    pub y_max: i32,
}

/// Bounding box coordinates for detection writes
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x_min: i32,
    pub y_min: i32,
    pub x_max: i32,
    pub y_max: i32,
}

impl BoundingBox {
    /// A box must have positive extent on both axes
    pub fn validate(&self) -> Result<(), ServiceError> {
        if self.x_min >= self.x_max || self.y_min >= self.y_max {
            return Err(ServiceError::Validation(format!(
                "Bounding box must satisfy x_min < x_max and y_min < y_max, got \
                 ({}, {}, {}, {})",
                self.x_min, self.y_min, self.x_max, self.y_max
            )));
        }
        Ok(())
    }
}

/// One detection entry of a combined image+detections upload
#[derive(Debug, Clone, Deserialize)]
pub struct NewDetection {
    pub tag_name: String,
    #[serde(flatten)]
    pub bbox: BoundingBox,
}

/// Corpus-wide counts, surfaced on the health endpoint
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StorageStats {
    pub image_count: i64,
    pub tag_count: i64,
    pub detection_count: i64,
}

const IMAGE_COLUMNS: &str = "id, name, created_at, updated_at";
const TAG_COLUMNS: &str = "id, name, created_at, updated_at";
const DETECTION_COLUMNS: &str =
    "id, image_id, tag_id, x_min, y_min, x_max, y_max, created_at, updated_at";

/// Metadata store for images, tags and detections in PostgreSQL
pub struct MetadataStore {
    pool: PgPool,
}

impl MetadataStore {
    /// Create a new metadata store with connection pool
    pub async fn new(config: &DatabaseConfig) -> anyhow::Result<Self> {
        use anyhow::Context;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(&config.connection_url())
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        use anyhow::Context;

        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }

    /// Get the connection pool (for health checks)
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// List all image records in insertion order
    pub async fn list_images(&self) -> Result<Vec<ImageRecord>, ServiceError> {
        let images = sqlx::query_as::<_, ImageRecord>(&format!(
            "SELECT {IMAGE_COLUMNS} FROM images ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(images)
    }

    /// Get an image record by ID
    pub async fn get_image(&self, id: i64) -> Result<Option<ImageRecord>, ServiceError> {
        let image = sqlx::query_as::<_, ImageRecord>(&format!(
            "SELECT {IMAGE_COLUMNS} FROM images WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(image)
    }

    /// Get an image record by name
    pub async fn get_image_by_name(&self, name: &str) -> Result<Option<ImageRecord>, ServiceError> {
        let image = sqlx::query_as::<_, ImageRecord>(&format!(
            "SELECT {IMAGE_COLUMNS} FROM images WHERE name = $1"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(image)
    }

    /// Create an image record; a duplicate name is a conflict
    #[instrument(skip(self))]
    pub async fn create_image(&self, name: &str) -> Result<ImageRecord, ServiceError> {
        validate_filename(name)?;

        let image = sqlx::query_as::<_, ImageRecord>(&format!(
            "INSERT INTO images (name, created_at, updated_at) \
             VALUES ($1, NOW(), NOW()) \
             RETURNING {IMAGE_COLUMNS}"
        ))
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                ServiceError::Conflict(format!("Image {name} already exists"))
            }
            _ => ServiceError::from(e),
        })?;

        debug!(image_id = image.id, name = %name, "Image created");

        Ok(image)
    }

    /// Delete an image by ID, returning the deleted record.
    ///
    /// Detections cascade in the database; removing the backing file is the
    /// caller's half of the operation.
    #[instrument(skip(self))]
    pub async fn delete_image(&self, id: i64) -> Result<Option<ImageRecord>, ServiceError> {
        let image = sqlx::query_as::<_, ImageRecord>(&format!(
            "DELETE FROM images WHERE id = $1 RETURNING {IMAGE_COLUMNS}"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(ref image) = image {
            info!(image_id = image.id, name = %image.name, "Image deleted");
            metrics::counter!("keeper.images.deleted").increment(1);
        }

        Ok(image)
    }

    /// List all tag records in insertion order
    pub async fn list_tags(&self) -> Result<Vec<TagRecord>, ServiceError> {
        let tags =
            sqlx::query_as::<_, TagRecord>(&format!("SELECT {TAG_COLUMNS} FROM tags ORDER BY id"))
                .fetch_all(&self.pool)
                .await?;

        Ok(tags)
    }

    /// Look up a tag by name, creating it if absent. Idempotent.
    pub async fn find_or_create_tag(&self, name: &str) -> Result<TagRecord, ServiceError> {
        let mut conn = self.pool.acquire().await?;
        Self::find_or_create_tag_on(&mut conn, name).await
    }

    /// Create a detection, resolving both the image and the tag by name
    /// (creating either if absent)
    #[instrument(skip(self))]
    pub async fn create_detection(
        &self,
        image_name: &str,
        tag_name: &str,
        bbox: BoundingBox,
    ) -> Result<DetectionRecord, ServiceError> {
        bbox.validate()?;

        let mut conn = self.pool.acquire().await?;
        let image = Self::find_or_create_image_on(&mut conn, image_name).await?;
        let tag = Self::find_or_create_tag_on(&mut conn, tag_name).await?;
        let detection = Self::insert_detection_on(&mut conn, image.id, tag.id, bbox).await?;

        debug!(
            detection_id = detection.id,
            image = %image_name,
            tag = %tag_name,
            "Detection created"
        );
        metrics::counter!("keeper.detections.created").increment(1);

        Ok(detection)
    }

    /// Overwrite a detection's tag and box fields.
    ///
    /// Returns `None` if the detection does not exist; the tag is resolved
    /// (or created) by name only after the detection is known to exist.
    #[instrument(skip(self))]
    pub async fn update_detection(
        &self,
        id: i64,
        tag_name: &str,
        bbox: BoundingBox,
    ) -> Result<Option<DetectionRecord>, ServiceError> {
        bbox.validate()?;

        let exists = sqlx::query_scalar::<_, i64>("SELECT id FROM detections WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        if exists.is_none() {
            return Ok(None);
        }

        let tag = self.find_or_create_tag(tag_name).await?;

        let detection = sqlx::query_as::<_, DetectionRecord>(&format!(
            "UPDATE detections \
             SET tag_id = $2, x_min = $3, y_min = $4, x_max = $5, y_max = $6, updated_at = NOW() \
             WHERE id = $1 \
             RETURNING {DETECTION_COLUMNS}"
        ))
        .bind(id)
        .bind(tag.id)
        .bind(bbox.x_min)
        .bind(bbox.y_min)
        .bind(bbox.x_max)
        .bind(bbox.y_max)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(ref detection) = detection {
            debug!(detection_id = detection.id, tag = %tag_name, "Detection updated");
        }

        Ok(detection)
    }

    /// Delete a detection by ID; `false` if it did not exist
    #[instrument(skip(self))]
    pub async fn delete_detection(&self, id: i64) -> Result<bool, ServiceError> {
        let result = sqlx::query("DELETE FROM detections WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Joined detection listing for one image, by image name.
    ///
    /// Returns `None` for an unknown image name (distinct from an image with
    /// no detections). Rows are ordered by detection ID so listings are
    /// stable across calls.
    pub async fn list_detections_for_image(
        &self,
        image_name: &str,
    ) -> Result<Option<Vec<DetectionWithTag>>, ServiceError> {
        let Some(image) = self.get_image_by_name(image_name).await? else {
            return Ok(None);
        };

        let detections = sqlx::query_as::<_, DetectionWithTag>(
            "SELECT detections.id, tags.name AS tag_name, \
                    detections.x_min, detections.y_min, detections.x_max, detections.y_max \
             FROM detections \
             INNER JOIN tags ON detections.tag_id = tags.id \
             WHERE detections.image_id = $1 \
             ORDER BY detections.id",
        )
        .bind(image.id)
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(detections))
    }

    /// Raw detection rows for one image, for the export engine
    pub async fn list_detections_by_image_id(
        &self,
        image_id: i64,
    ) -> Result<Vec<DetectionRecord>, ServiceError> {
        let detections = sqlx::query_as::<_, DetectionRecord>(&format!(
            "SELECT {DETECTION_COLUMNS} FROM detections WHERE image_id = $1 ORDER BY id"
        ))
        .bind(image_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(detections)
    }

    /// Create (or find) the image record and insert all its detections in
    /// one transaction, so a failed detection insert leaves no partial state
    #[instrument(skip(self, detections), fields(name = %name, detection_count = detections.len()))]
    pub async fn create_image_with_detections(
        &self,
        name: &str,
        detections: &[NewDetection],
    ) -> Result<ImageRecord, ServiceError> {
        for detection in detections {
            detection.bbox.validate()?;
        }

        let mut tx = self.pool.begin().await?;

        let image = Self::find_or_create_image_on(&mut tx, name).await?;
        for detection in detections {
            let tag = Self::find_or_create_tag_on(&mut tx, &detection.tag_name).await?;
            Self::insert_detection_on(&mut tx, image.id, tag.id, detection.bbox).await?;
        }

        tx.commit().await?;

        info!(
            image_id = image.id,
            name = %name,
            detection_count = detections.len(),
            "Image and detections stored"
        );
        metrics::counter!("keeper.images.uploaded").increment(1);
        metrics::counter!("keeper.detections.created").increment(detections.len() as u64);

        Ok(image)
    }

    /// Corpus-wide record counts
    pub async fn stats(&self) -> Result<StorageStats, ServiceError> {
        let stats = sqlx::query_as::<_, StorageStats>(
            "SELECT \
                (SELECT COUNT(*) FROM images) AS image_count, \
                (SELECT COUNT(*) FROM tags) AS tag_count, \
                (SELECT COUNT(*) FROM detections) AS detection_count",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(stats)
    }

    async fn find_or_create_tag_on(
        conn: &mut PgConnection,
        name: &str,
    ) -> Result<TagRecord, ServiceError> {
        if name.trim().is_empty() {
            return Err(ServiceError::Validation(
                "Tag name must not be empty".to_string(),
            ));
        }

        if let Some(tag) = sqlx::query_as::<_, TagRecord>(&format!(
            "SELECT {TAG_COLUMNS} FROM tags WHERE name = $1"
        ))
        .bind(name)
        .fetch_optional(&mut *conn)
        .await?
        {
            return Ok(tag);
        }

        let inserted = sqlx::query_as::<_, TagRecord>(&format!(
            "INSERT INTO tags (name, created_at, updated_at) \
             VALUES ($1, NOW(), NOW()) \
             ON CONFLICT (name) DO NOTHING \
             RETURNING {TAG_COLUMNS}"
        ))
        .bind(name)
        .fetch_optional(&mut *conn)
        .await?;

        match inserted {
            Some(tag) => Ok(tag),
            // Lost an insert race; the row exists now
            None => sqlx::query_as::<_, TagRecord>(&format!(
                "SELECT {TAG_COLUMNS} FROM tags WHERE name = $1"
            ))
            .bind(name)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| {
                ServiceError::Internal(anyhow::anyhow!("Tag {name} disappeared after insert race"))
            }),
        }
    }

    async fn find_or_create_image_on(
        conn: &mut PgConnection,
        name: &str,
    ) -> Result<ImageRecord, ServiceError> {
        validate_filename(name)?;

        if let Some(image) = sqlx::query_as::<_, ImageRecord>(&format!(
            "SELECT {IMAGE_COLUMNS} FROM images WHERE name = $1"
        ))
        .bind(name)
        .fetch_optional(&mut *conn)
        .await?
        {
            return Ok(image);
        }

        let inserted = sqlx::query_as::<_, ImageRecord>(&format!(
            "INSERT INTO images (name, created_at, updated_at) \
             VALUES ($1, NOW(), NOW()) \
             ON CONFLICT (name) DO NOTHING \
             RETURNING {IMAGE_COLUMNS}"
        ))
        .bind(name)
        .fetch_optional(&mut *conn)
        .await?;

        match inserted {
            Some(image) => Ok(image),
            None => sqlx::query_as::<_, ImageRecord>(&format!(
                "SELECT {IMAGE_COLUMNS} FROM images WHERE name = $1"
            ))
            .bind(name)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| {
                ServiceError::Internal(anyhow::anyhow!(
                    "Image {name} disappeared after insert race"
                ))
            }),
        }
    }

    async fn insert_detection_on(
        conn: &mut PgConnection,
        image_id: i64,
        tag_id: i64,
        bbox: BoundingBox,
    ) -> Result<DetectionRecord, ServiceError> {
        let detection = sqlx::query_as::<_, DetectionRecord>(&format!(
            "INSERT INTO detections \
                 (image_id, tag_id, x_min, y_min, x_max, y_max, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, NOW(), NOW()) \
             RETURNING {DETECTION_COLUMNS}"
        ))
        .bind(image_id)
        .bind(tag_id)
        .bind(bbox.x_min)
        .bind(bbox.y_min)
        .bind(bbox.x_max)
        .bind(bbox.y_max)
        .fetch_one(&mut *conn)
        .await?;

        Ok(detection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounding_box_validation() {
        let valid = BoundingBox {
            x_min: 1,
            y_min: 2,
            x_max: 10,
            y_max: 20,
        };
        assert!(valid.validate().is_ok());

        let flat = BoundingBox {
            x_min: 5,
            y_min: 2,
            x_max: 5,
            y_max: 20,
        };
        assert!(flat.validate().is_err());

        let inverted = BoundingBox {
            x_min: 10,
            y_min: 20,
            x_max: 1,
            y_max: 2,
        };
        assert!(inverted.validate().is_err());
    }

    #[test]
    fn test_new_detection_deserializes_flat_fields() {
        let entry: NewDetection = serde_json::from_str(
            r#"{"tag_name": "cat", "x_min": 1, "y_min": 2, "x_max": 10, "y_max": 20}"#,
        )
        .unwrap();

        assert_eq!(entry.tag_name, "cat");
        assert_eq!(entry.bbox.x_min, 1);
        assert_eq!(entry.bbox.y_max, 20);
    }

    #[test]
    fn test_new_detection_rejects_missing_fields() {
        let result: Result<NewDetection, _> =
            serde_json::from_str(r#"{"tag_name": "cat", "x_min": 1}"#);
        assert!(result.is_err());
    }
}
