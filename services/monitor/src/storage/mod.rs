//! Persistence collaborator used by the frame buffer flush.

mod sqlite;

pub use sqlite::{SqliteStore, StorageStats, StoredDetection, StoredImage};

use crate::detector::Detection;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors that can occur while persisting frames.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image already stored: {0}")]
    Duplicate(String),
}

/// Metadata row written for every flushed frame.
#[derive(Debug, Clone, PartialEq)]
pub struct NewImage {
    /// File name inside the image directory
    pub filename: String,
    /// Camera name
    pub camera: String,
    /// Time the frame was accepted by the buffer
    pub timestamp: DateTime<Utc>,
    /// Full path of the written file
    pub path: String,
    /// File size in bytes
    pub size: i64,
}

/// Image and detection persistence.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Storage: Send + Sync {
    /// Insert an image row and return its id.
    async fn save_image(&self, image: &NewImage) -> Result<i64, StorageError>;

    /// Insert the detections found in an image.
    async fn save_detections(&self, image_id: i64, detections: &[Detection]) -> Result<(), StorageError>;
}
