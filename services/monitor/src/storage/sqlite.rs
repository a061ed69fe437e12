use super::{NewImage, Storage, StorageError};
use crate::config::DatabaseConfig;
use crate::detector::Detection;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;
use std::collections::HashMap;
use std::str::FromStr;
use tracing::{debug, info, instrument};

/// Stored image metadata
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct StoredImage {
    pub id: i64,
    /// File name inside the image directory
    pub filename: String,
    pub camera: String,
    /// Time the frame was accepted by the buffer
    pub timestamp: DateTime<Utc>,
    /// Full path of the written file
    pub filepath: String,
    /// File size in bytes
    pub filesize: i64,
    /// When the record was created
    pub created_at: DateTime<Utc>,
}

/// Stored detection row
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct StoredDetection {
    pub id: i64,
    pub image_id: i64,
    /// Detected object label
    pub object_name: String,
    pub x: i64,
    pub y: i64,
    pub width: i64,
    pub height: i64,
    pub confidence: f64,
}

/// Aggregate counts over stored images.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StorageStats {
    pub total_images: i64,
    pub total_bytes: i64,
    pub per_camera: HashMap<String, i64>,
}

/// Image metadata store in SQLite
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open the database at `url`, creating the file and its directory if needed.
    pub async fn new(url: &str, config: &DatabaseConfig) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);

        let filename = options.clone().get_filename();
        if let Some(parent) = filename.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;

        info!(url = %url, "Connected to SQLite database");

        Ok(Self { pool })
    }

    /// Private in-memory database with the schema applied.
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

        // every connection to :memory: is its own database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations").run(&self.pool).await?;

        info!("Database migrations completed");
        Ok(())
    }

    /// Get image metadata by id
    pub async fn get_image(&self, id: i64) -> Result<Option<StoredImage>, StorageError> {
        let image = sqlx::query_as::<_, StoredImage>(
            r#"
            SELECT id, filename, camera, timestamp, filepath, filesize, created_at
            FROM images
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(image)
    }

    /// Get detections for an image, highest confidence first
    pub async fn detections_for_image(&self, image_id: i64) -> Result<Vec<StoredDetection>, StorageError> {
        let detections = sqlx::query_as::<_, StoredDetection>(
            r#"
            SELECT id, image_id, object_name, x, y, width, height, confidence
            FROM detections
            WHERE image_id = ?
            ORDER BY confidence DESC
            "#,
        )
        .bind(image_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(detections)
    }

    /// Get storage statistics
    pub async fn stats(&self) -> Result<StorageStats, StorageError> {
        let (total_images, total_bytes): (i64, i64) =
            sqlx::query_as("SELECT COUNT(*), COALESCE(SUM(filesize), 0) FROM images")
                .fetch_one(&self.pool)
                .await?;

        let per_camera: Vec<(String, i64)> =
            sqlx::query_as("SELECT camera, COUNT(*) FROM images GROUP BY camera")
                .fetch_all(&self.pool)
                .await?;

        Ok(StorageStats {
            total_images,
            total_bytes,
            per_camera: per_camera.into_iter().collect(),
        })
    }

    /// Close the connection pool
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl Storage for SqliteStore {
    #[instrument(skip(self, image), fields(filename = %image.filename, camera = %image.camera))]
    async fn save_image(&self, image: &NewImage) -> Result<i64, StorageError> {
        let result = sqlx::query(
            r#"
            INSERT INTO images (filename, camera, timestamp, filepath, filesize, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&image.filename)
        .bind(&image.camera)
        .bind(image.timestamp)
        .bind(&image.path)
        .bind(image.size)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            let duplicate = e
                .as_database_error()
                .map_or(false, |db| db.is_unique_violation());
            if duplicate {
                StorageError::Duplicate(image.filename.clone())
            } else {
                StorageError::Database(e)
            }
        })?;

        let id = result.last_insert_rowid();
        debug!(image_id = id, "Image indexed");
        Ok(id)
    }

    #[instrument(skip(self, detections), fields(count = detections.len()))]
    async fn save_detections(&self, image_id: i64, detections: &[Detection]) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;

        for detection in detections {
            sqlx::query(
                r#"
                INSERT INTO detections (image_id, object_name, x, y, width, height, confidence)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(image_id)
            .bind(&detection.label)
            .bind(detection.x)
            .bind(detection.y)
            .bind(detection.width)
            .bind(detection.height)
            .bind(detection.confidence as f64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_image(filename: &str, camera: &str, size: i64) -> NewImage {
        NewImage {
            filename: filename.to_string(),
            camera: camera.to_string(),
            timestamp: Utc::now(),
            path: format!("/tmp/{}", filename),
            size,
        }
    }

    #[tokio::test]
    async fn test_save_and_get_image() {
        let store = SqliteStore::in_memory().await.unwrap();

        let id = store
            .save_image(&new_image("a_brama_osoba_.jpg", "brama", 1200))
            .await
            .unwrap();

        let image = store.get_image(id).await.unwrap().unwrap();
        assert_eq!(image.filename, "a_brama_osoba_.jpg");
        assert_eq!(image.camera, "brama");
        assert_eq!(image.filesize, 1200);
        assert!(store.get_image(id + 100).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_filename_rejected() {
        let store = SqliteStore::in_memory().await.unwrap();
        let image = new_image("dup.jpg", "brama", 10);

        store.save_image(&image).await.unwrap();
        let result = store.save_image(&image).await;

        assert!(matches!(result, Err(StorageError::Duplicate(name)) if name == "dup.jpg"));
    }

    #[tokio::test]
    async fn test_save_detections() {
        let store = SqliteStore::in_memory().await.unwrap();
        let id = store.save_image(&new_image("d.jpg", "drzwi", 10)).await.unwrap();

        store
            .save_detections(
                id,
                &[
                    Detection::new("pies", 0.7, 1, 2, 3, 4),
                    Detection::new("osoba", 0.9, 5, 6, 7, 8),
                ],
            )
            .await
            .unwrap();

        let detections = store.detections_for_image(id).await.unwrap();
        assert_eq!(detections.len(), 2);
        assert_eq!(detections[0].object_name, "osoba");
        assert_eq!(detections[0].x, 5);
        assert_eq!(detections[1].object_name, "pies");
        assert_eq!(detections[1].height, 4);
    }

    #[tokio::test]
    async fn test_stats() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.save_image(&new_image("1.jpg", "brama", 100)).await.unwrap();
        store.save_image(&new_image("2.jpg", "brama", 50)).await.unwrap();
        store.save_image(&new_image("3.jpg", "drzwi", 25)).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_images, 3);
        assert_eq!(stats.total_bytes, 175);
        assert_eq!(stats.per_camera.get("brama"), Some(&2));
        assert_eq!(stats.per_camera.get("drzwi"), Some(&1));
    }

    #[tokio::test]
    async fn test_empty_stats() {
        let store = SqliteStore::in_memory().await.unwrap();
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_images, 0);
        assert_eq!(stats.total_bytes, 0);
        assert!(stats.per_camera.is_empty());
    }
}
