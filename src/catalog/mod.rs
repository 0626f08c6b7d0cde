//! Remote image catalog.
//!
//! The engine only needs two operations: register an image under its content
//! key, and drop a key. Both must be idempotent on the server side.

pub mod error;
#[cfg(test)]
pub(crate) mod fake;
pub mod http;

use async_trait::async_trait;

use crate::key::ContentKey;
use crate::snapshot::ImageRecord;

pub use error::{CatalogError, Operation};
pub use http::{CatalogConfig, HttpCatalog};

/// Register one image with the catalog.
#[derive(Debug, Clone)]
pub struct AddImage {
    pub content_key: ContentKey,
    pub file_name: String,
    /// Directory the file lives in, forward slashes.
    pub source_dir: String,
    pub bytes: Vec<u8>,
}

impl AddImage {
    pub fn new(record: &ImageRecord, bytes: Vec<u8>) -> Self {
        Self {
            content_key: record.content_key.clone(),
            file_name: record.file_name.clone(),
            source_dir: record.source_dir(),
            bytes,
        }
    }
}

/// Drop one key from the catalog.
#[derive(Debug, Clone)]
pub struct RemoveImage {
    pub content_key: ContentKey,
    pub file_name: String,
    pub source_dir: String,
}

impl From<&ImageRecord> for RemoveImage {
    fn from(record: &ImageRecord) -> Self {
        Self {
            content_key: record.content_key.clone(),
            file_name: record.file_name.clone(),
            source_dir: record.source_dir(),
        }
    }
}

/// Remote catalog operations. `Ok` means the server acknowledged the change.
#[async_trait]
pub trait CatalogClient: Send + Sync {
    async fn add_image(&self, request: &AddImage) -> Result<(), CatalogError>;

    /// Removing a key the catalog does not hold succeeds.
    async fn remove_image(&self, request: &RemoveImage) -> Result<(), CatalogError>;
}
