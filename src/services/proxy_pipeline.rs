//! Request resolution: cache lookup, upstream fetch, transform, admit
//!
//! The pipeline holds no cache state of its own. It is driven by `CacheService::resolve`
//! and calls back into the service for lookups and admission, so it works the same
//! whether the memory working set is enabled or not.

use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

use super::cache_key::CacheKey;
use super::cache_service::CacheService;
use super::source_cache::SourceCache;
use super::upstream::UpstreamFetcher;
use crate::codec::TransformCodec;
use crate::errors::{ProxyError, ProxyResult};
use crate::models::{CacheStatus, ResolvedImage, TransformRequest};

/// Quoted lowercase hex SHA-256, used as the strong ETag of served bytes
pub fn etag_for(bytes: &[u8]) -> String {
    format!("\"{}\"", hex::encode(Sha256::digest(bytes)))
}

pub struct ProxyPipeline {
    fetcher: Arc<dyn UpstreamFetcher>,
    sources: SourceCache,
    codec: Arc<TransformCodec>,
    cache_control: String,
    upstream_fetches: AtomicU64,
    source_cache_hits: AtomicU64,
}

impl ProxyPipeline {
    pub fn new(
        fetcher: Arc<dyn UpstreamFetcher>,
        sources: SourceCache,
        codec: Arc<TransformCodec>,
        cache_control: String,
    ) -> Self {
        Self {
            fetcher,
            sources,
            codec,
            cache_control,
            upstream_fetches: AtomicU64::new(0),
            source_cache_hits: AtomicU64::new(0),
        }
    }

    /// Serve from cache when possible, otherwise fetch, transform and admit.
    ///
    /// Failures are never cached: an error leaves no entry behind and the next request
    /// for the same key tries again.
    pub async fn resolve(&self, cache: &CacheService, request: &TransformRequest) -> ProxyResult<ResolvedImage> {
        let key = CacheKey::for_request(request);

        if let Some(cached) = cache.lookup(&key).await {
            debug!("Cache hit for {}", key);
            return Ok(ResolvedImage {
                bytes: cached.bytes,
                content_type: cached.entry.content_type,
                cache_control: self.cache_control.clone(),
                etag: cached.entry.etag,
                cache_status: CacheStatus::Hit,
                key: key.to_string(),
            });
        }

        let source = self.fetch_source(&request.source).await?;

        let codec = Arc::clone(&self.codec);
        let owned_request = request.clone();
        let output = tokio::task::spawn_blocking(move || codec.transform(&source, &owned_request))
            .await
            .map_err(|e| ProxyError::encode(format!("transform task failed: {e}")))??;

        let entry = cache.admit(&key, &output).await?;
        info!(
            "Cached {} as {} ({} bytes{})",
            key,
            entry.format,
            entry.size,
            if output.passthrough { ", passthrough" } else { "" }
        );

        Ok(ResolvedImage {
            bytes: output.bytes,
            content_type: entry.content_type,
            cache_control: self.cache_control.clone(),
            etag: entry.etag,
            cache_status: CacheStatus::Miss,
            key: key.to_string(),
        })
    }

    /// Source bytes for `url`, reusing a recent fetch when one is cached
    async fn fetch_source(&self, url: &str) -> ProxyResult<Bytes> {
        if let Some(bytes) = self.sources.get(url) {
            self.source_cache_hits.fetch_add(1, Ordering::Relaxed);
            debug!("Source cache hit for {}", url);
            return Ok(bytes);
        }

        self.upstream_fetches.fetch_add(1, Ordering::Relaxed);
        let bytes = self.fetcher.fetch(url).await?;
        self.sources.insert(url, bytes.clone());
        Ok(bytes)
    }

    pub fn upstream_fetches(&self) -> u64 {
        self.upstream_fetches.load(Ordering::Relaxed)
    }

    pub fn source_cache_hits(&self) -> u64 {
        self.source_cache_hits.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OutputFormat, ResizeMode};
    use crate::services::testing::{TestHarness, png_bytes};

    #[test]
    fn test_etag_is_quoted_sha256() {
        let etag = etag_for(b"abc");
        assert_eq!(
            etag,
            "\"ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad\""
        );
    }

    #[tokio::test]
    async fn test_miss_response_metadata() {
        let harness = TestHarness::new(|c| c.web.cache_control = "public, max-age=60".to_string()).await;
        let url = "https://img.example.com/p.png";
        harness.fetcher.serve(url, png_bytes(40, 20));

        let request = TransformRequest::new(url)
            .with_size(Some(20), Some(20))
            .with_mode(ResizeMode::Pad)
            .with_format(OutputFormat::Png);
        let resolved = harness.service.resolve(&request).await.unwrap();

        assert_eq!(resolved.cache_status, CacheStatus::Miss);
        assert_eq!(resolved.content_type, "image/png");
        assert_eq!(resolved.cache_control, "public, max-age=60");
        assert_eq!(resolved.etag, etag_for(&resolved.bytes));
        assert_eq!(resolved.key, "https://img.example.com/p.png?format=png&h=20&mode=pad&w=20");

        let decoded = image::load_from_memory(&resolved.bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (20, 20));
    }

    #[tokio::test]
    async fn test_upstream_counters() {
        let harness = TestHarness::new(|_| {}).await;
        let url = "https://img.example.com/c.png";
        harness.fetcher.serve(url, png_bytes(10, 10));

        for width in [5, 6, 7] {
            let request = TransformRequest::new(url).with_size(Some(width), None);
            harness.service.resolve(&request).await.unwrap();
        }

        let stats = harness.service.stats();
        assert_eq!(stats.upstream_fetches, 1);
        assert_eq!(stats.source_cache_hits, 2);
    }
}
