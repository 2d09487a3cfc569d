//! Ordered storage tiers with write-to-slowest and read promotion
//!
//! Writes and deletes of one id are serialized through a striped lock. Reads never take
//! it; their promotions are guarded by blob generations instead.

use bytes::Bytes;
use futures::future::join_all;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::{
    BlobMetadata, LocalBackend, MemoryBackend, PromotionJob, PromotionQueue, PromotionStats, RemoteBackend,
    StorageBackend, blob_id,
};
use crate::config::StorageConfig;
use crate::errors::{StorageError, StorageResult};
use crate::utils::{RetryConfig, with_retry};

const WRITE_LOCK_STRIPES: usize = 256;

/// Result of a tiered write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub id: String,
    /// The system-of-record tier refused the write; only faster tiers hold the bytes
    pub degraded: bool,
}

/// Storage tiers ordered fastest first. The last tier is the system of record.
pub struct TieredStore {
    tiers: Vec<Arc<dyn StorageBackend>>,
    promotions: PromotionQueue,
    write_retry: RetryConfig,
    degraded_writes: AtomicU64,
    write_locks: Vec<Mutex<()>>,
}

impl TieredStore {
    /// Must be called inside a Tokio runtime: spawns the promotion worker
    pub fn new(
        tiers: Vec<Arc<dyn StorageBackend>>,
        promotion_queue_capacity: usize,
        write_retry: RetryConfig,
    ) -> StorageResult<Self> {
        if tiers.is_empty() {
            return Err(StorageError::AllTiersFailed {
                message: "no storage tiers configured".to_string(),
            });
        }
        Ok(Self {
            tiers,
            promotions: PromotionQueue::start(promotion_queue_capacity),
            write_retry,
            degraded_writes: AtomicU64::new(0),
            write_locks: (0..WRITE_LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        })
    }

    /// Memory (optional), local disk, then the remote store when configured
    pub async fn from_config(config: &StorageConfig) -> StorageResult<Self> {
        let mut tiers: Vec<Arc<dyn StorageBackend>> = Vec::new();

        if config.memory_tier_enabled {
            tiers.push(Arc::new(MemoryBackend::new(config.memory_tier_size_mb * 1024 * 1024)));
        }

        let local = LocalBackend::new(&config.local_path);
        local.ensure_root().await?;
        tiers.push(Arc::new(local));

        if let Some(remote) = &config.remote {
            tiers.push(Arc::new(RemoteBackend::new(remote)?));
        }

        let store = Self::new(
            tiers,
            config.promotion_queue_capacity,
            RetryConfig::for_storage(config.write_retry_attempts),
        )?;
        info!("Storage tiers (fastest first): {}", store.tier_names().join(" -> "));
        Ok(store)
    }

    pub fn tier_names(&self) -> Vec<String> {
        self.tiers.iter().map(|t| t.name().to_string()).collect()
    }

    fn write_lock(&self, id: &str) -> &Mutex<()> {
        let hash = id
            .bytes()
            .fold(0usize, |hash, byte| hash.wrapping_mul(31).wrapping_add(byte as usize));
        &self.write_locks[hash % self.write_locks.len()]
    }

    fn system_of_record(&self) -> (usize, &Arc<dyn StorageBackend>) {
        let last = self.tiers.len() - 1;
        (last, &self.tiers[last])
    }

    /// Write to the slowest tier first, then promote to the faster ones in the background.
    ///
    /// Transient failures of the slowest tier are retried. If it still refuses, the bytes
    /// are written synchronously to the faster tiers and the result is flagged `degraded`.
    pub async fn store(&self, data: Bytes, metadata: &BlobMetadata) -> StorageResult<StoredBlob> {
        let id = blob_id(&data, metadata);
        let metadata = BlobMetadata {
            custom_id: Some(id.clone()),
            content_type: metadata.content_type.clone(),
        };
        let (durable_index, durable) = self.system_of_record();

        let _guard = self.write_lock(&id).lock().await;
        let generation = self.promotions.generations().bump(&id);

        let durable_result = with_retry(
            &self.write_retry,
            || durable.store(data.clone(), &metadata),
            &format!("store blob in {} tier", durable.name()),
        )
        .await;

        match durable_result {
            Ok(_) => {
                self.promote(&id, generation, data, durable_index);
                Ok(StoredBlob { id, degraded: false })
            }
            Err(durable_err) => {
                error!(
                    "System-of-record tier {} failed to store blob {}: {}",
                    durable.name(),
                    id,
                    durable_err
                );
                self.store_degraded(id, data, &metadata, durable_err).await
            }
        }
    }

    async fn store_degraded(
        &self,
        id: String,
        data: Bytes,
        metadata: &BlobMetadata,
        durable_err: StorageError,
    ) -> StorageResult<StoredBlob> {
        let (durable_index, _) = self.system_of_record();
        let faster = &self.tiers[..durable_index];

        let results = join_all(faster.iter().map(|tier| tier.store(data.clone(), metadata))).await;
        let accepted = results.iter().filter(|r| r.is_ok()).count();

        if accepted == 0 {
            return Err(StorageError::AllTiersFailed {
                message: format!("blob {id}: {durable_err}"),
            });
        }

        self.degraded_writes.fetch_add(1, Ordering::Relaxed);
        warn!(
            "Blob {} held only by {} faster tier(s); durable copy missing",
            id, accepted
        );
        Ok(StoredBlob { id, degraded: true })
    }

    /// Read from the fastest tier holding `id`, back-filling the tiers above the hit
    pub async fn get(&self, id: &str) -> StorageResult<Bytes> {
        let mut last_error = None;
        let generation = self.promotions.generations().observe(id);

        for (index, tier) in self.tiers.iter().enumerate() {
            match tier.get(id).await {
                Ok(data) => {
                    if index > 0 {
                        debug!("Blob {} found in {} tier, promoting", id, tier.name());
                        self.promote(id, generation, data.clone(), index);
                    }
                    return Ok(data);
                }
                Err(e) if e.is_not_found() => continue,
                Err(e) => {
                    warn!("Tier {} failed reading blob {}: {}", tier.name(), id, e);
                    last_error = Some(e);
                }
            }
        }

        self.promotions.generations().retire_if(id, generation);
        Err(last_error.unwrap_or_else(|| StorageError::not_found(id)))
    }

    /// True if any tier holds `id`
    pub async fn exists(&self, id: &str) -> bool {
        join_all(self.tiers.iter().map(|tier| tier.exists(id)))
            .await
            .into_iter()
            .any(|found| found)
    }

    /// Delete from every tier. Succeeds when at least one tier confirms the delete.
    pub async fn delete(&self, id: &str) -> StorageResult<()> {
        let _guard = self.write_lock(id).lock().await;
        self.delete_locked(id).await
    }

    /// Generation of the last write of `id` by this process, 0 if none.
    /// Pass it to [`TieredStore::delete_unless_rewritten`] later.
    pub fn written_generation(&self, id: &str) -> u64 {
        self.promotions.generations().written(id)
    }

    /// Delete `id` unless it was written again after `seen` was taken.
    ///
    /// Returns `Ok(false)` when the delete was skipped.
    pub async fn delete_unless_rewritten(&self, id: &str, seen: u64) -> StorageResult<bool> {
        let _guard = self.write_lock(id).lock().await;
        if self.promotions.generations().written(id) != seen {
            debug!("Keeping blob {}: written again since it was displaced", id);
            return Ok(false);
        }
        self.delete_locked(id).await.map(|()| true)
    }

    async fn delete_locked(&self, id: &str) -> StorageResult<()> {
        let generations = self.promotions.generations();
        generations.retire(id);
        let results = join_all(self.tiers.iter().map(|tier| tier.delete(id))).await;
        // Reads that raced the delete registered generations which must not promote
        generations.retire(id);

        let mut confirmed = false;
        let mut failure = None;
        for (tier, result) in self.tiers.iter().zip(results) {
            match result {
                Ok(()) => confirmed = true,
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!("Tier {} failed deleting blob {}: {}", tier.name(), id, e);
                    failure = Some(e);
                }
            }
        }

        match (confirmed, failure) {
            (true, _) => Ok(()),
            (false, Some(e)) => Err(e),
            (false, None) => Err(StorageError::not_found(id)),
        }
    }

    fn promote(&self, id: &str, generation: u64, data: Bytes, below: usize) {
        if below == 0 {
            return;
        }
        let job = PromotionJob {
            id: id.to_string(),
            generation,
            data,
            targets: self.tiers[..below].to_vec(),
        };
        self.promotions.enqueue(job);
    }

    pub async fn wait_for_promotions(&self) {
        self.promotions.wait_idle().await;
    }

    /// Finish queued promotions and stop the worker
    pub async fn shutdown(&self) {
        self.promotions.drain().await;
    }

    pub fn promotion_stats(&self) -> PromotionStats {
        self.promotions.stats()
    }

    pub fn degraded_writes(&self) -> u64 {
        self.degraded_writes.load(Ordering::Relaxed)
    }
}
