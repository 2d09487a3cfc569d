//! Blob storage tiers
//!
//! Every tier implements [`StorageBackend`]. [`TieredStore`] arranges them fastest first,
//! treats the slowest as the system of record and promotes bytes upward in the
//! background through a bounded [`PromotionQueue`].

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};

use crate::errors::{StorageError, StorageResult};

pub mod local;
pub mod memory;
pub mod promotion;
pub mod remote;
pub mod tiered;

pub use local::LocalBackend;
pub use memory::MemoryBackend;
pub use promotion::{BlobGenerations, PromotionJob, PromotionQueue, PromotionStats};
pub use remote::RemoteBackend;
pub use tiered::{StoredBlob, TieredStore};

/// Per-blob metadata passed to `store`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlobMetadata {
    /// Caller-chosen id; when absent the id is the content hash
    pub custom_id: Option<String>,
    pub content_type: Option<String>,
}

impl BlobMetadata {
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            custom_id: Some(id.into()),
            content_type: None,
        }
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Short name for logs and stats
    fn name(&self) -> &str;

    /// Persist `data` and return its id
    async fn store(&self, data: Bytes, metadata: &BlobMetadata) -> StorageResult<String>;

    async fn get(&self, id: &str) -> StorageResult<Bytes>;

    async fn exists(&self, id: &str) -> bool;

    /// Remove `id`. Missing ids report `StorageError::NotFound`.
    async fn delete(&self, id: &str) -> StorageResult<()>;
}

/// Id for `data`: the caller's custom id if given, else the hex SHA-256 of the content
pub fn blob_id(data: &[u8], metadata: &BlobMetadata) -> String {
    match metadata.custom_id.as_deref() {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => hex::encode(Sha256::digest(data)),
    }
}

/// Ids become file names and URL path segments, so only a conservative alphabet is allowed
pub fn validate_id(backend: &str, id: &str) -> StorageResult<()> {
    let valid = id.len() >= 2
        && id.len() <= 128
        && id.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
    if valid {
        Ok(())
    } else {
        Err(StorageError::Rejected {
            backend: backend.to_string(),
            message: format!("invalid blob id '{id}'"),
        })
    }
}
