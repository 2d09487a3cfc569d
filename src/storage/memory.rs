//! In-process byte tier bounded by total size

use async_trait::async_trait;
use bytes::Bytes;
use lru::LruCache;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

use super::{BlobMetadata, StorageBackend, blob_id};
use crate::errors::{StorageError, StorageResult};

struct Blobs {
    lru: LruCache<String, Bytes>,
    bytes: u64,
}

/// Fastest tier. Least recently read blobs are dropped once `max_bytes` is exceeded.
pub struct MemoryBackend {
    blobs: Mutex<Blobs>,
    max_bytes: u64,
}

impl MemoryBackend {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            blobs: Mutex::new(Blobs {
                lru: LruCache::unbounded(),
                bytes: 0,
            }),
            max_bytes,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Blobs> {
        self.blobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.lock().lru.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn used_bytes(&self) -> u64 {
        self.lock().bytes
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn store(&self, data: Bytes, metadata: &BlobMetadata) -> StorageResult<String> {
        let size = data.len() as u64;
        if size > self.max_bytes {
            return Err(StorageError::Rejected {
                backend: self.name().to_string(),
                message: format!("blob of {size} bytes exceeds tier budget of {} bytes", self.max_bytes),
            });
        }

        let id = blob_id(&data, metadata);
        let mut blobs = self.lock();
        if let Some(previous) = blobs.lru.put(id.clone(), data) {
            blobs.bytes -= previous.len() as u64;
        }
        blobs.bytes += size;

        while blobs.bytes > self.max_bytes {
            match blobs.lru.pop_lru() {
                Some((dropped_id, dropped)) => {
                    blobs.bytes -= dropped.len() as u64;
                    debug!("Memory tier dropped blob {} ({} bytes)", dropped_id, dropped.len());
                }
                None => break,
            }
        }

        Ok(id)
    }

    async fn get(&self, id: &str) -> StorageResult<Bytes> {
        self.lock()
            .lru
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::not_found(id))
    }

    async fn exists(&self, id: &str) -> bool {
        self.lock().lru.contains(id)
    }

    async fn delete(&self, id: &str) -> StorageResult<()> {
        let mut blobs = self.lock();
        match blobs.lru.pop(id) {
            Some(removed) => {
                blobs.bytes -= removed.len() as u64;
                Ok(())
            }
            None => Err(StorageError::not_found(id)),
        }
    }
}
