//! Object storage for uploaded product images.

use crate::errors::ServiceError;
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), ServiceError>;
    /// Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), ServiceError>;
    async fn exists(&self, key: &str) -> Result<bool, ServiceError>;
}

/// Stores objects as files below a root directory.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, ServiceError> {
        let relative = Path::new(key);
        let safe = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(ServiceError::StorageError(format!("invalid object key: {key}")));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    #[instrument(skip(self, bytes), fields(len = bytes.len()))]
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), ServiceError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| ServiceError::StorageError(e.to_string()))?;
        }
        fs::write(&path, bytes)
            .await
            .map_err(|e| ServiceError::StorageError(e.to_string()))?;
        debug!(path = %path.display(), "object stored");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, key: &str) -> Result<(), ServiceError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(key, "object already absent");
                Ok(())
            }
            Err(e) => Err(ServiceError::StorageError(e.to_string())),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, ServiceError> {
        let path = self.path_for(key)?;
        fs::try_exists(&path)
            .await
            .map_err(|e| ServiceError::StorageError(e.to_string()))
    }
}

/// Generated key for a product image, e.g. `products/<uuid>.png`
pub fn product_image_key(content_type: Option<&str>) -> String {
    let ext = match content_type.map(|c| c.split(';').next().unwrap_or("").trim()) {
        Some("image/png") => "png",
        Some("image/jpeg") | Some("image/jpg") => "jpg",
        Some("image/webp") => "webp",
        Some("image/gif") => "gif",
        _ => "bin",
    };
    format!("products/{}.{}", Uuid::new_v4(), ext)
}
