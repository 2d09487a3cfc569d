//! On-disk tier sharded by the first two characters of the blob id

use async_trait::async_trait;
use bytes::Bytes;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use super::{BlobMetadata, StorageBackend, blob_id, validate_id};
use crate::errors::{StorageError, StorageResult};

#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn ensure_root(&self) -> StorageResult<()> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| StorageError::io(self.name(), e))
    }

    /// `<root>/<id[0..2]>/<id>`
    pub fn blob_path(&self, id: &str) -> StorageResult<PathBuf> {
        validate_id(self.name(), id)?;
        Ok(self.root.join(&id[..2]).join(id))
    }

    fn map_io(&self, id: &str, err: std::io::Error) -> StorageError {
        if err.kind() == ErrorKind::NotFound {
            StorageError::not_found(id)
        } else {
            StorageError::io(self.name(), err)
        }
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn name(&self) -> &str {
        "local"
    }

    async fn store(&self, data: Bytes, metadata: &BlobMetadata) -> StorageResult<String> {
        let id = blob_id(&data, metadata);
        let path = self.blob_path(&id)?;
        let shard = path
            .parent()
            .ok_or_else(|| StorageError::io(self.name(), std::io::Error::other("blob path has no parent")))?;

        fs::create_dir_all(shard)
            .await
            .map_err(|e| StorageError::io(self.name(), e))?;

        // Readers never observe a partially written blob
        let temp_path = shard.join(format!(".{id}.{:08x}.tmp", rand::random::<u32>()));
        if let Err(e) = fs::write(&temp_path, &data).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StorageError::io(self.name(), e));
        }
        if let Err(e) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StorageError::io(self.name(), e));
        }

        debug!("Stored blob {} ({} bytes) at {}", id, data.len(), path.display());
        Ok(id)
    }

    async fn get(&self, id: &str) -> StorageResult<Bytes> {
        let path = self.blob_path(id)?;
        fs::read(&path).await.map(Bytes::from).map_err(|e| self.map_io(id, e))
    }

    async fn exists(&self, id: &str) -> bool {
        match self.blob_path(id) {
            Ok(path) => fs::try_exists(&path).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    async fn delete(&self, id: &str) -> StorageResult<()> {
        let path = self.blob_path(id)?;
        fs::remove_file(&path).await.map_err(|e| self.map_io(id, e))
    }
}
