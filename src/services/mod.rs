//! Cache and proxy services
//!
//! `CacheService` is the single object handlers talk to. It owns the memory working
//! set, the tiered store, the index repository, the `ProxyPipeline` and the
//! `UploadService`.

pub mod cache_key;
pub mod cache_service;
pub mod eviction_cache;
pub mod proxy_pipeline;
pub mod reconciliation;
pub mod source_cache;
pub mod uploads;
pub mod upstream;

#[cfg(test)]
pub(crate) mod testing;

pub use cache_key::{CacheKey, content_id, decode_path_source, normalize_source, thumbnail_id_for};
pub use cache_service::{CacheService, CacheStats, CachedImage, CleanupReport, SyncReport};
pub use eviction_cache::{DisplaceReason, Displaced, EvictionCache, EvictionStats};
pub use proxy_pipeline::{ProxyPipeline, etag_for};
pub use reconciliation::ReconciliationLoop;
pub use source_cache::SourceCache;
pub use uploads::{UploadReport, UploadService, UploadedFile};
pub use upstream::{HttpFetcher, UpstreamFetcher};
