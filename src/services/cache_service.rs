//! The cache service constructed once at startup and shared by every handler
//!
//! `CacheService` owns the memory working set (`EvictionCache`), the tiered blob store,
//! the durable index repository and the `ProxyPipeline`. All I/O triggered by the memory
//! cache (flushing displaced entries, deleting their bytes) happens here, after the
//! eviction lock has been released.
//!
//! Stored thumbnails, the paged index listing and uploads (`UploadService`) are served
//! from here too.
//!
//! While enabled, lookups go to the memory working set and the reconciliation loop
//! flushes dirty metadata to the index. While disabled, the working set is empty and
//! lookups read and update the index directly.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::cache_key::{CacheKey, content_id, thumbnail_id_for};
use super::eviction_cache::{DisplaceReason, Displaced, EvictionCache};
use super::proxy_pipeline::{ProxyPipeline, etag_for};
use super::source_cache::SourceCache;
use super::upstream::UpstreamFetcher;
use super::uploads::UploadService;
use crate::codec::{TransformCodec, TransformOutput};
use crate::config::Config;
use crate::database::repositories::CacheIndexRepository;
use crate::errors::{ProxyError, ProxyResult};
use crate::models::{
    CacheEntry, CacheStatus, EntryListQuery, EntryPage, EntrySummary, ResolvedImage, TransformRequest,
};
use crate::storage::{BlobMetadata, PromotionStats, TieredStore};

/// Index rows examined per cleanup pass
const PURGE_BATCH: u64 = 1000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Dirty entries written to the index
    pub flushed: usize,
    /// Entries touched again while the batch was being written
    pub still_dirty: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    /// Entries dropped from memory after exceeding the TTL
    pub expired: usize,
    /// Index rows removed after exceeding the retention window
    pub purged: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub enabled: bool,
    pub requests: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub entries: usize,
    pub bytes: u64,
    pub max_entries: usize,
    pub max_bytes: u64,
    pub evictions: u64,
    /// Bytes served from cache instead of being fetched and transformed again
    pub bytes_saved: u64,
    pub upstream_fetches: u64,
    pub source_cache_hits: u64,
    pub inconsistencies: u64,
    pub degraded_writes: u64,
    pub promotions: PromotionStats,
    pub storage_tiers: Vec<String>,
}

/// Metadata and bytes found for a key
#[derive(Debug, Clone)]
pub struct CachedImage {
    pub entry: CacheEntry,
    pub bytes: Bytes,
}

/// Blobs to delete for an entry that left memory, with the write generation each had
/// at that moment. A blob written again since is kept.
struct Doomed {
    /// Skip everything if this key is resident again by the time the delete runs
    resident_key: Option<String>,
    blobs: Vec<(String, u64)>,
}

#[derive(Default)]
struct Counters {
    requests: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    bytes_saved: AtomicU64,
    inconsistencies: AtomicU64,
}

pub struct CacheService {
    memory: EvictionCache,
    store: Arc<TieredStore>,
    index: CacheIndexRepository,
    pipeline: ProxyPipeline,
    uploads: UploadService,
    cache_control: String,
    enabled: AtomicBool,
    ttl: Duration,
    index_retention: Duration,
    sync_lock: Mutex<()>,
    toggle_lock: Mutex<()>,
    counters: Counters,
}

impl CacheService {
    pub fn new(
        config: &Config,
        store: Arc<TieredStore>,
        index: CacheIndexRepository,
        fetcher: Arc<dyn UpstreamFetcher>,
    ) -> Self {
        let codec = Arc::new(TransformCodec::new(&config.transform));
        let pipeline = ProxyPipeline::new(
            fetcher,
            SourceCache::new(config.cache.source_cache_entries, config.cache.source_cache_max_bytes()),
            Arc::clone(&codec),
            config.web.cache_control.clone(),
        );
        let uploads = UploadService::new(
            Arc::clone(&store),
            codec,
            config.web.cache_control.clone(),
            config.web.max_upload_bytes(),
        );

        Self {
            memory: EvictionCache::new(config.cache.max_entries, config.cache.max_bytes()),
            store,
            index,
            pipeline,
            uploads,
            cache_control: config.web.cache_control.clone(),
            enabled: AtomicBool::new(config.cache.enabled),
            ttl: config.cache.ttl,
            index_retention: config.reconciliation.index_retention,
            sync_lock: Mutex::new(()),
            toggle_lock: Mutex::new(()),
            counters: Counters::default(),
        }
    }

    /// Resolve a transform request to servable bytes
    pub async fn resolve(&self, request: &TransformRequest) -> ProxyResult<ResolvedImage> {
        self.counters.requests.fetch_add(1, Ordering::Relaxed);
        self.pipeline.resolve(self, request).await
    }

    pub fn uploads(&self) -> &UploadService {
        &self.uploads
    }

    /// Thumbnail stored alongside a cached image, addressed by the image's storage id
    /// with an optional extension
    pub async fn thumbnail(&self, file: &str) -> ProxyResult<ResolvedImage> {
        let path = format!("/thumb/{file}");
        let id = content_id(file).ok_or_else(|| ProxyError::not_found(&path))?;

        let bytes = match self.store.get(&thumbnail_id_for(id)).await {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => return Err(ProxyError::not_found(path)),
            Err(e) => return Err(e.into()),
        };
        Ok(ResolvedImage {
            etag: etag_for(&bytes),
            bytes,
            content_type: "image/webp".to_string(),
            cache_control: self.cache_control.clone(),
            cache_status: CacheStatus::Hit,
            key: path,
        })
    }

    /// One page of the index. Dirty metadata is synced first so counters are current.
    pub async fn list_entries(&self, query: &EntryListQuery) -> ProxyResult<EntryPage> {
        let synced = if self.is_enabled() { self.sync().await.map(|_| ()) } else { Ok(()) };
        if let Err(e) = synced {
            warn!("Sync before listing failed, listing may be stale: {}", e);
        }

        let (rows, total) = self.index.list(query).await?;
        let items = rows
            .into_iter()
            .map(|row| {
                let thumb_url = row.thumb_locator.as_ref().map(|_| format!("/thumb/{}.webp", row.locator));
                let resident = self.memory.contains(&row.key);
                EntrySummary {
                    key: row.key,
                    format: row.format,
                    content_type: row.content_type,
                    size: row.size,
                    access_count: row.access_count,
                    last_access: row.last_access,
                    created_at: row.created_at,
                    thumb_url,
                    resident,
                }
            })
            .collect();
        Ok(EntryPage::new(items, total, query))
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn memory(&self) -> &EvictionCache {
        &self.memory
    }

    pub fn store(&self) -> &TieredStore {
        &self.store
    }

    pub fn index(&self) -> &CacheIndexRepository {
        &self.index
    }

    /// Find cached bytes for `key`, recording the access.
    ///
    /// Metadata whose bytes have vanished from every tier is removed and reported as a
    /// miss. Other read failures are also misses; the entry is regenerated.
    pub async fn lookup(&self, key: &CacheKey) -> Option<CachedImage> {
        let found = self.lookup_entry(key).await;
        match &found {
            Some(cached) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .bytes_saved
                    .fetch_add(cached.bytes.len() as u64, Ordering::Relaxed);
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
            }
        }
        found
    }

    async fn lookup_entry(&self, key: &CacheKey) -> Option<CachedImage> {
        let entry = if self.is_enabled() {
            self.memory.get(key.as_str())?
        } else {
            match self.index.record_access(key.as_str(), Utc::now()).await {
                Ok(found) => found?,
                Err(e) => {
                    warn!("Index lookup for {} failed, treating as miss: {}", key, e);
                    return None;
                }
            }
        };

        match self.store.get(&entry.locator).await {
            Ok(bytes) => Some(CachedImage { entry, bytes }),
            Err(e) if e.is_not_found() => {
                let inconsistency = ProxyError::inconsistency(key.as_str(), &entry.locator);
                warn!("{}; removing stale metadata", inconsistency);
                self.counters.inconsistencies.fetch_add(1, Ordering::Relaxed);
                self.forget(&entry).await;
                None
            }
            Err(e) => {
                warn!("Reading cached bytes for {} failed, treating as miss: {}", key, e);
                None
            }
        }
    }

    /// Persist freshly transformed bytes and admit them to the working set
    pub async fn admit(&self, key: &CacheKey, output: &TransformOutput) -> ProxyResult<CacheEntry> {
        let metadata = BlobMetadata::with_id(key.storage_id()).content_type(output.content_type);
        let stored = self.store.store(output.bytes.clone(), &metadata).await?;
        if stored.degraded {
            warn!(
                "{} cached without a durable copy; it is lost once the faster tiers drop it",
                key
            );
        }

        let thumb_locator = match &output.thumbnail {
            Some(thumb) => {
                let thumb_metadata = BlobMetadata::with_id(key.thumbnail_id()).content_type("image/webp");
                match self.store.store(thumb.clone(), &thumb_metadata).await {
                    Ok(blob) => Some(blob.id),
                    Err(e) => {
                        warn!("Storing thumbnail for {} failed: {}", key, e);
                        None
                    }
                }
            }
            None => None,
        };

        let entry = CacheEntry::new(
            key.as_str(),
            stored.id,
            output.content_type,
            output.format,
            output.bytes.len() as u64,
            etag_for(&output.bytes),
        )
        .with_thumbnail(thumb_locator);

        if self.is_enabled() {
            let displaced = self.memory.put(entry.clone());
            self.settle(displaced).await;
        } else if let Err(e) = self.index.upsert(&entry).await {
            warn!("Recording {} in the index failed: {}", key, e);
        }

        Ok(entry)
    }

    /// Handle entries pushed out of the working set by `put`
    async fn settle(&self, displaced: Vec<Displaced>) {
        if displaced.is_empty() {
            return;
        }

        // Generations are read before any await so a re-admit racing this is recognized
        let doomed: Vec<Doomed> = displaced.iter().filter_map(|d| self.doom_displaced(d)).collect();

        let to_flush: Vec<CacheEntry> = displaced
            .iter()
            .filter(|d| d.needs_flush() || d.reason == DisplaceReason::Rejected)
            .map(|d| d.entry.clone())
            .collect();
        if let Err(e) = self.index.upsert_batch(&to_flush).await {
            warn!("Flushing {} displaced entries failed: {}", to_flush.len(), e);
        }

        for doomed in doomed {
            self.delete_bytes(doomed).await;
        }
    }

    fn doom_displaced(&self, displaced: &Displaced) -> Option<Doomed> {
        let entry = &displaced.entry;
        match displaced.reason {
            DisplaceReason::Evicted => {
                debug!("Evicted {} ({} bytes)", entry.key, entry.size);
                Some(self.doom(Some(&entry.key), entry.locators()))
            }
            DisplaceReason::Rejected => {
                debug!(
                    "{} ({} bytes) exceeds the memory budget, tracked in the index only",
                    entry.key, entry.size
                );
                None
            }
            DisplaceReason::Replaced => {
                let current = self.memory.peek(&entry.key);
                let unused = entry
                    .locators()
                    .filter(|locator| !current.as_ref().is_some_and(|c| c.locators().any(|l| l == *locator)));
                Some(self.doom(None, unused))
            }
        }
    }

    fn doom<'a>(&self, resident_key: Option<&str>, locators: impl Iterator<Item = &'a str>) -> Doomed {
        Doomed {
            resident_key: resident_key.map(str::to_string),
            blobs: locators
                .map(|id| (id.to_string(), self.store.written_generation(id)))
                .collect(),
        }
    }

    async fn delete_bytes(&self, doomed: Doomed) {
        if doomed.resident_key.as_deref().is_some_and(|key| self.memory.contains(key)) {
            return;
        }
        for (id, seen) in doomed.blobs {
            match self.store.delete_unless_rewritten(&id, seen).await {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!("Deleting blob {} failed: {}", id, e),
            }
        }
    }

    async fn delete_blob(&self, locator: &str) {
        match self.store.delete(locator).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!("Deleting blob {} failed: {}", locator, e),
        }
    }

    /// Drop metadata whose primary bytes are gone
    async fn forget(&self, entry: &CacheEntry) {
        self.memory.remove(&entry.key);
        if let Some(thumb) = &entry.thumb_locator {
            self.delete_blob(thumb).await;
        }
        if let Err(e) = self.index.delete(&entry.key).await {
            warn!("Removing stale index row {} failed: {}", entry.key, e);
        }
    }

    /// Write every dirty entry to the index in one transaction.
    ///
    /// Dirty flags are cleared only after the commit, and only for entries not touched
    /// while the batch was in flight. A failed batch leaves everything dirty for the next
    /// run.
    pub async fn sync(&self) -> ProxyResult<SyncReport> {
        let _guard = self.sync_lock.lock().await;

        let dirty = self.memory.dirty_snapshot();
        if dirty.is_empty() {
            return Ok(SyncReport::default());
        }

        self.index.upsert_batch(&dirty).await?;
        let cleaned = self.memory.mark_clean(&dirty);
        debug!("Synced {} dirty entries to the index", dirty.len());

        Ok(SyncReport {
            flushed: dirty.len(),
            still_dirty: dirty.len() - cleaned,
        })
    }

    /// Expire idle entries from memory and purge index rows past retention
    pub async fn cleanup(&self) -> ProxyResult<CleanupReport> {
        self.cleanup_at(Utc::now()).await
    }

    pub async fn cleanup_at(&self, now: DateTime<Utc>) -> ProxyResult<CleanupReport> {
        let idle_cutoff = cutoff(now, self.ttl);

        let expiring: Vec<CacheEntry> = self
            .memory
            .snapshot()
            .into_iter()
            .filter(|e| e.dirty && e.last_access < idle_cutoff)
            .collect();
        self.index.upsert_batch(&expiring).await?;
        let flushed: HashSet<&str> = expiring.iter().map(|e| e.key.as_str()).collect();

        let expired = self.memory.take_idle_since(idle_cutoff);
        let doomed: Vec<Doomed> = expired.iter().map(|e| self.doom(Some(&e.key), e.locators())).collect();
        let late: Vec<CacheEntry> = expired
            .iter()
            .filter(|e| e.dirty && !flushed.contains(e.key.as_str()))
            .cloned()
            .collect();
        if let Err(e) = self.index.upsert_batch(&late).await {
            warn!("Flushing {} expiring entries failed: {}", late.len(), e);
        }
        for doomed in doomed {
            self.delete_bytes(doomed).await;
        }

        let retention_cutoff = cutoff(now, self.index_retention);
        let mut purged = 0;
        for row in self.index.find_stale(retention_cutoff, PURGE_BATCH).await? {
            if self.memory.contains(&row.key) {
                continue;
            }
            self.delete_bytes(self.doom(Some(&row.key), row.locators())).await;
            if self.index.delete(&row.key).await? {
                purged += 1;
            }
        }

        let report = CleanupReport {
            expired: expired.len(),
            purged,
        };
        if report.expired > 0 || report.purged > 0 {
            info!(
                "Cleanup expired {} entries, purged {} index rows",
                report.expired, report.purged
            );
        }
        Ok(report)
    }

    /// Turn the memory working set on or off.
    ///
    /// Disabling syncs first, then empties memory; lookups go to the index afterwards.
    /// Enabling reloads the most recent rows from the index.
    pub async fn set_enabled(&self, enabled: bool) -> ProxyResult<()> {
        let _guard = self.toggle_lock.lock().await;
        if self.is_enabled() == enabled {
            return Ok(());
        }

        if enabled {
            self.enabled.store(true, Ordering::Release);
            let loaded = self.load_from_index().await?;
            info!("Cache enabled, {} entries loaded from the index", loaded);
        } else {
            self.sync().await?;
            self.enabled.store(false, Ordering::Release);
            let leftovers: Vec<CacheEntry> = self.memory.clear().into_iter().filter(|e| e.dirty).collect();
            self.index.upsert_batch(&leftovers).await?;
            info!("Cache disabled, serving lookups from the index");
        }
        Ok(())
    }

    /// Fill the working set with the most recently used index rows whose bytes still
    /// exist. Rows with missing bytes are removed from the index.
    pub async fn load_from_index(&self) -> ProxyResult<usize> {
        let rows = self.index.load_recent(self.memory.max_entries() as u64).await?;

        let mut budget = self.memory.max_bytes().saturating_sub(self.memory.total_bytes());
        let mut accepted = Vec::new();
        let mut missing = 0;
        for row in rows {
            if row.size > budget || self.memory.contains(&row.key) {
                continue;
            }
            if !self.store.exists(&row.locator).await {
                missing += 1;
                if let Err(e) = self.index.delete(&row.key).await {
                    warn!("Removing stale index row {} failed: {}", row.key, e);
                }
                continue;
            }
            budget -= row.size;
            accepted.push(row);
        }

        let loaded = accepted.len();
        // Oldest first so the newest row ends up most recently used
        for row in accepted.into_iter().rev() {
            let displaced = self.memory.put(row);
            self.settle(displaced).await;
        }

        if missing > 0 {
            warn!("Dropped {} index rows whose bytes are missing", missing);
        }
        Ok(loaded)
    }

    pub fn stats(&self) -> CacheStats {
        let memory = self.memory.stats();
        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;

        CacheStats {
            enabled: self.is_enabled(),
            requests: self.counters.requests.load(Ordering::Relaxed),
            hits,
            misses,
            hit_rate: if lookups == 0 { 0.0 } else { hits as f64 / lookups as f64 },
            entries: memory.entries,
            bytes: memory.bytes,
            max_entries: memory.max_entries,
            max_bytes: memory.max_bytes,
            evictions: memory.evictions,
            bytes_saved: self.counters.bytes_saved.load(Ordering::Relaxed),
            upstream_fetches: self.pipeline.upstream_fetches(),
            source_cache_hits: self.pipeline.source_cache_hits(),
            inconsistencies: self.counters.inconsistencies.load(Ordering::Relaxed),
            degraded_writes: self.store.degraded_writes(),
            promotions: self.store.promotion_stats(),
            storage_tiers: self.store.tier_names(),
        }
    }

    /// Final sync, then drain queued promotions
    pub async fn shutdown(&self) {
        match self.sync().await {
            Ok(report) => info!("Final sync wrote {} entries", report.flushed),
            Err(e) => warn!("Final sync failed: {}", e),
        }
        self.store.shutdown().await;
    }
}

fn cutoff(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::errors::StorageError;
    use crate::models::{CacheStatus, OutputFormat, ResizeMode};
    use crate::services::testing::{MockFetcher, TestHarness, png_bytes};
    use crate::storage::{MemoryBackend, StorageBackend};
    use crate::utils::RetryConfig;

    const SOURCE: &str = "https://img.example.com/a.png";

    fn request(source: &str) -> TransformRequest {
        TransformRequest::new(source)
    }

    #[tokio::test]
    async fn test_miss_then_hit_is_idempotent() {
        let harness = TestHarness::new(|_| {}).await;
        harness.fetcher.serve(SOURCE, png_bytes(64, 48));

        let first = harness.service.resolve(&request(SOURCE)).await.unwrap();
        let second = harness.service.resolve(&request(SOURCE)).await.unwrap();

        assert_eq!(first.cache_status, CacheStatus::Miss);
        assert_eq!(second.cache_status, CacheStatus::Hit);
        assert_eq!(first.bytes, second.bytes);
        assert_eq!(first.etag, second.etag);
        assert_eq!(harness.fetcher.calls(SOURCE), 1);

        let stats = harness.service.stats();
        assert_eq!((stats.hits, stats.misses, stats.requests), (1, 1, 2));
        assert_eq!(stats.bytes_saved, second.bytes.len() as u64);
    }

    #[tokio::test]
    async fn test_different_modes_share_one_fetch() {
        let harness = TestHarness::new(|_| {}).await;
        harness.fetcher.serve(SOURCE, png_bytes(300, 200));

        let fill = request(SOURCE)
            .with_size(Some(100), Some(100))
            .with_mode(ResizeMode::Fill);
        let fit = request(SOURCE).with_size(Some(100), Some(100));
        let a = harness.service.resolve(&fill).await.unwrap();
        let b = harness.service.resolve(&fit).await.unwrap();

        assert_ne!(a.key, b.key);
        assert_eq!(harness.service.memory().len(), 2);
        assert_eq!(harness.fetcher.calls(SOURCE), 1);
        assert_eq!(harness.service.stats().source_cache_hits, 1);
    }

    #[tokio::test]
    async fn test_capacity_eviction_deletes_bytes() {
        let harness = TestHarness::new(|c| c.cache.max_entries = 2).await;
        let urls = ["https://x.test/a.png", "https://x.test/b.png", "https://x.test/c.png"];
        for url in urls {
            harness.fetcher.serve(url, png_bytes(8, 8));
            harness.service.resolve(&request(url)).await.unwrap();
            harness.service.store().wait_for_promotions().await;
        }

        let evicted = CacheKey::for_request(&request(urls[0]));
        assert!(!harness.service.memory().contains(evicted.as_str()));
        assert!(!harness.service.store().exists(&evicted.storage_id()).await);
        assert_eq!(harness.service.stats().evictions, 1);

        // Evicted dirty metadata was flushed before the bytes went
        assert!(harness.service.index().find(evicted.as_str()).await.unwrap().is_some());

        assert!(harness.service.lookup(&evicted).await.is_none());
        for url in &urls[1..] {
            let key = CacheKey::for_request(&request(url));
            assert!(harness.service.lookup(&key).await.is_some());
        }
    }

    #[tokio::test]
    async fn test_evicted_bytes_stay_gone_when_promotions_lag() {
        let harness = TestHarness::new(|c| c.cache.max_entries = 1).await;
        let urls = ["https://x.test/a.png", "https://x.test/b.png"];
        for url in urls {
            harness.fetcher.serve(url, png_bytes(8, 8));
            harness.service.resolve(&request(url)).await.unwrap();
        }
        harness.service.store().wait_for_promotions().await;

        let evicted = CacheKey::for_request(&request(urls[0]));
        assert!(!harness.service.store().exists(&evicted.storage_id()).await);
        assert!(!harness.service.store().exists(&evicted.thumbnail_id()).await);

        // The flushed row must self-heal rather than resolve to stray bytes
        harness.service.set_enabled(false).await.unwrap();
        assert!(harness.service.lookup(&evicted).await.is_none());
        assert!(harness.service.index().find(evicted.as_str()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_readmit_during_eviction_keeps_new_bytes() {
        let harness = TestHarness::new(|c| c.cache.max_entries = 1).await;
        let (a, b) = ("https://x.test/a.png", "https://x.test/b.png");
        harness.fetcher.serve(a, png_bytes(8, 8));
        harness.fetcher.serve(b, png_bytes(9, 9));
        harness.service.resolve(&request(a)).await.unwrap();

        let key_a = CacheKey::for_request(&request(a));
        let resident = harness.service.memory().peek(key_a.as_str()).unwrap();
        let doomed = harness.service.doom(Some(key_a.as_str()), resident.locators());

        // A is evicted by B, then admitted again before the displaced delete runs
        harness.service.resolve(&request(b)).await.unwrap();
        harness.service.resolve(&request(a)).await.unwrap();
        harness.service.memory().remove(key_a.as_str());
        harness.service.delete_bytes(doomed).await;

        assert!(harness.service.store().exists(&key_a.storage_id()).await);
    }

    #[tokio::test]
    async fn test_synced_entries_survive_restart() {
        let harness = TestHarness::new(|_| {}).await;
        harness.fetcher.serve(SOURCE, png_bytes(8, 8));
        let first = harness.service.resolve(&request(SOURCE)).await.unwrap();
        harness.service.shutdown().await;

        let restarted = harness.restart().await;
        assert_eq!(restarted.load_from_index().await.unwrap(), 1);

        let hit = restarted.resolve(&request(SOURCE)).await.unwrap();
        assert_eq!(hit.cache_status, CacheStatus::Hit);
        assert_eq!(hit.bytes, first.bytes);
        assert_eq!(harness.fetcher.calls(SOURCE), 1);
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_missing_bytes_self_heal_as_miss() {
        let harness = TestHarness::new(|_| {}).await;
        harness.fetcher.serve(SOURCE, png_bytes(16, 16));
        let first = harness.service.resolve(&request(SOURCE)).await.unwrap();
        harness.service.store().wait_for_promotions().await;

        let key = CacheKey::for_request(&request(SOURCE));
        harness.service.store().delete(&key.storage_id()).await.unwrap();

        let second = harness.service.resolve(&request(SOURCE)).await.unwrap();
        assert_eq!(second.cache_status, CacheStatus::Miss);
        assert_eq!(first.bytes, second.bytes);
        assert_eq!(harness.service.stats().inconsistencies, 1);
        assert!(logs_contain("removing stale metadata"));
        assert_eq!(harness.fetcher.calls(SOURCE), 1);
    }

    /// System-of-record tier that refuses every write
    struct RefusingTier;

    #[async_trait::async_trait]
    impl StorageBackend for RefusingTier {
        fn name(&self) -> &str {
            "refusing"
        }

        async fn store(&self, _data: Bytes, _metadata: &BlobMetadata) -> crate::errors::StorageResult<String> {
            Err(StorageError::Rejected {
                backend: "refusing".to_string(),
                message: "read-only".to_string(),
            })
        }

        async fn get(&self, id: &str) -> crate::errors::StorageResult<Bytes> {
            Err(StorageError::not_found(id))
        }

        async fn exists(&self, _id: &str) -> bool {
            false
        }

        async fn delete(&self, id: &str) -> crate::errors::StorageResult<()> {
            Err(StorageError::not_found(id))
        }
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_degraded_write_still_serves_and_is_reported() {
        let mut config = Config::default();
        config.transform.generate_thumbnails = false;
        let database = Database::in_memory().await;
        let tiers: Vec<Arc<dyn StorageBackend>> = vec![Arc::new(MemoryBackend::new(1 << 20)), Arc::new(RefusingTier)];
        let store = TieredStore::new(tiers, 8, RetryConfig::for_storage(1)).unwrap();
        let fetcher = Arc::new(MockFetcher::default());
        fetcher.serve(SOURCE, png_bytes(16, 16));
        let service = CacheService::new(
            &config,
            Arc::new(store),
            CacheIndexRepository::new(database.connection()),
            fetcher,
        );

        let first = service.resolve(&request(SOURCE)).await.unwrap();
        assert_eq!(first.cache_status, CacheStatus::Miss);
        assert_eq!(service.stats().degraded_writes, 1);
        assert!(logs_contain("without a durable copy"));

        let second = service.resolve(&request(SOURCE)).await.unwrap();
        assert_eq!(second.cache_status, CacheStatus::Hit);
        assert_eq!(second.bytes, first.bytes);
    }

    #[tokio::test]
    async fn test_upstream_failure_is_not_cached() {
        let harness = TestHarness::new(|_| {}).await;

        let err = harness.service.resolve(&request(SOURCE)).await.unwrap_err();
        assert!(err.is_upstream_error());
        assert!(harness.service.memory().is_empty());

        harness.fetcher.serve(SOURCE, png_bytes(4, 4));
        let ok = harness.service.resolve(&request(SOURCE)).await.unwrap();
        assert_eq!(ok.cache_status, CacheStatus::Miss);
    }

    #[tokio::test]
    async fn test_decode_error_for_undecodable_transform() {
        let harness = TestHarness::new(|_| {}).await;
        harness.fetcher.serve(SOURCE, b"<html>nope</html>".to_vec());

        let err = harness
            .service
            .resolve(&request(SOURCE).with_format(OutputFormat::Png))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Decode { .. }));
        assert!(harness.service.memory().is_empty());

        let passthrough = harness.service.resolve(&request(SOURCE)).await.unwrap();
        assert_eq!(passthrough.bytes.as_ref(), b"<html>nope</html>");
    }

    #[tokio::test]
    async fn test_sync_flushes_and_clears_dirty() {
        let harness = TestHarness::new(|_| {}).await;
        harness.fetcher.serve(SOURCE, png_bytes(8, 8));
        harness.service.resolve(&request(SOURCE)).await.unwrap();
        harness.service.resolve(&request(SOURCE)).await.unwrap();

        let report = harness.service.sync().await.unwrap();

        assert_eq!(report, SyncReport { flushed: 1, still_dirty: 0 });
        assert!(harness.service.memory().dirty_snapshot().is_empty());
        let row = harness.service.index().find(SOURCE).await.unwrap().unwrap();
        assert_eq!(row.access_count, 1);
        assert_eq!(harness.service.sync().await.unwrap().flushed, 0);
    }

    #[tokio::test]
    async fn test_cleanup_expires_idle_entries() {
        let harness = TestHarness::new(|_| {}).await;
        harness.fetcher.serve(SOURCE, png_bytes(8, 8));
        harness.service.resolve(&request(SOURCE)).await.unwrap();
        harness.service.store().wait_for_promotions().await;

        let later = Utc::now() + chrono::Duration::hours(1);
        let report = harness.service.cleanup_at(later).await.unwrap();

        assert_eq!(report.expired, 1);
        assert!(harness.service.memory().is_empty());
        let key = CacheKey::for_request(&request(SOURCE));
        assert!(!harness.service.store().exists(&key.storage_id()).await);
        assert!(harness.service.index().find(SOURCE).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_cleanup_purges_rows_past_retention() {
        let harness = TestHarness::new(|_| {}).await;
        harness.fetcher.serve(SOURCE, png_bytes(8, 8));
        harness.service.resolve(&request(SOURCE)).await.unwrap();
        harness.service.sync().await.unwrap();

        let much_later = Utc::now() + chrono::Duration::days(30);
        let report = harness.service.cleanup_at(much_later).await.unwrap();

        assert_eq!(report.purged, 1);
        assert_eq!(harness.service.index().count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_disable_serves_from_index_and_enable_reloads() {
        let harness = TestHarness::new(|_| {}).await;
        harness.fetcher.serve(SOURCE, png_bytes(8, 8));
        harness.service.resolve(&request(SOURCE)).await.unwrap();

        harness.service.set_enabled(false).await.unwrap();
        assert!(!harness.service.is_enabled());
        assert!(harness.service.memory().is_empty());

        let hit = harness.service.resolve(&request(SOURCE)).await.unwrap();
        assert_eq!(hit.cache_status, CacheStatus::Hit);
        assert_eq!(harness.fetcher.calls(SOURCE), 1);
        let row = harness.service.index().find(SOURCE).await.unwrap().unwrap();
        assert_eq!(row.access_count, 1);

        harness.service.set_enabled(true).await.unwrap();
        assert!(harness.service.memory().contains(SOURCE));
        let again = harness.service.resolve(&request(SOURCE)).await.unwrap();
        assert_eq!(again.cache_status, CacheStatus::Hit);
    }

    #[tokio::test]
    async fn test_load_from_index_skips_rows_without_bytes() {
        let harness = TestHarness::new(|_| {}).await;
        let ghost = CacheEntry::new("https://gone.test/x.png", "deadbeef", "image/webp", "webp", 10, "\"x\"");
        harness.service.index().upsert(&ghost).await.unwrap();

        assert_eq!(harness.service.load_from_index().await.unwrap(), 0);
        assert_eq!(harness.service.index().count().await.unwrap(), 0);
    }

    #[test]
    fn test_cutoff_saturates() {
        let now = Utc::now();
        assert_eq!(cutoff(now, Duration::from_secs(60)), now - chrono::Duration::seconds(60));
        assert_eq!(cutoff(now, Duration::MAX), DateTime::<Utc>::MIN_UTC);
    }

    #[tokio::test]
    async fn test_fetcher_unused_for_hits() {
        let fetcher = Arc::new(MockFetcher::default());
        let harness = TestHarness::with_fetcher(fetcher.clone(), |_| {}).await;
        fetcher.serve(SOURCE, png_bytes(8, 8));

        for _ in 0..5 {
            harness.service.resolve(&request(SOURCE)).await.unwrap();
        }
        assert_eq!(fetcher.calls(SOURCE), 1);
        assert_eq!(harness.service.stats().hits, 4);
    }

    #[tokio::test]
    async fn test_thumbnail_is_served_for_cached_image() {
        let harness = TestHarness::new(|_| {}).await;
        harness.fetcher.serve(SOURCE, png_bytes(300, 200));
        harness.service.resolve(&request(SOURCE)).await.unwrap();

        let storage_id = CacheKey::from_stored(SOURCE).storage_id();
        for file in [storage_id.clone(), format!("{storage_id}.webp")] {
            let thumb = harness.service.thumbnail(&file).await.unwrap();
            assert_eq!(thumb.content_type, "image/webp");
            assert_eq!(thumb.etag, etag_for(&thumb.bytes));

            let decoded = image::load_from_memory(&thumb.bytes).unwrap();
            assert!(decoded.width() <= harness.config.transform.thumbnail_size);
        }
    }

    #[tokio::test]
    async fn test_missing_thumbnail_is_not_found() {
        let harness = TestHarness::new(|c| c.transform.generate_thumbnails = false).await;
        harness.fetcher.serve(SOURCE, png_bytes(30, 20));
        harness.service.resolve(&request(SOURCE)).await.unwrap();

        let storage_id = CacheKey::from_stored(SOURCE).storage_id();
        for file in [storage_id.as_str(), "../../etc/passwd", "abc"] {
            let err = harness.service.thumbnail(file).await.unwrap_err();
            assert!(matches!(err, ProxyError::NotFound { .. }), "{file}: {err}");
        }
    }

    #[tokio::test]
    async fn test_list_entries_reports_memory_state() {
        let harness = TestHarness::new(|_| {}).await;
        harness.fetcher.serve(SOURCE, png_bytes(30, 20));
        harness.service.resolve(&request(SOURCE)).await.unwrap();
        harness.service.resolve(&request(SOURCE)).await.unwrap();

        let page = harness.service.list_entries(&EntryListQuery::default()).await.unwrap();

        assert_eq!((page.total, page.total_pages, page.page), (1, 1, 1));
        let item = &page.items[0];
        assert_eq!(item.key, SOURCE);
        assert_eq!(item.access_count, 1);
        assert!(item.resident);
        let storage_id = CacheKey::from_stored(SOURCE).storage_id();
        assert_eq!(item.thumb_url.as_deref(), Some(format!("/thumb/{storage_id}.webp").as_str()));

        let thumb_file = item.thumb_url.as_deref().unwrap().trim_start_matches("/thumb/");
        assert!(harness.service.thumbnail(thumb_file).await.is_ok());
    }
}
