//! Image service interface.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::model::ImageMeta;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ImageError {
    #[error("image {0} not found")]
    NotFound(String),

    #[error("image service failure: {0}")]
    Backend(String),
}

#[async_trait]
pub trait ImageService: Send + Sync {
    async fn get(&self, image_id: &str) -> Result<ImageMeta, ImageError>;
}

/// Image catalogue backed by a map.
#[derive(Debug, Default)]
pub struct InMemoryImageService {
    images: Mutex<HashMap<String, ImageMeta>>,
}

impl InMemoryImageService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an image under `id`.
    pub fn insert(&self, id: impl Into<String>, mut image: ImageMeta) {
        let id = id.into();
        image.id = Some(id.clone());
        if let Ok(mut images) = self.images.lock() {
            images.insert(id, image);
        }
    }
}

#[async_trait]
impl ImageService for InMemoryImageService {
    async fn get(&self, image_id: &str) -> Result<ImageMeta, ImageError> {
        self.images
            .lock()
            .map_err(|_| ImageError::Backend("image catalogue lock poisoned".to_string()))?
            .get(image_id)
            .cloned()
            .ok_or_else(|| ImageError::NotFound(image_id.to_string()))
    }
}
