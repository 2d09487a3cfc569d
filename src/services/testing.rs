//! Shared fixtures for service tests

use async_trait::async_trait;
use bytes::Bytes;
use image::{ImageFormat, Rgba, RgbaImage};
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use super::cache_service::CacheService;
use super::upstream::UpstreamFetcher;
use crate::config::Config;
use crate::database::Database;
use crate::database::repositories::CacheIndexRepository;
use crate::errors::{ProxyError, ProxyResult, UpstreamFailure};
use crate::storage::TieredStore;

/// Serves canned bodies and counts fetches per URL. Unknown URLs answer 404.
#[derive(Default)]
pub struct MockFetcher {
    bodies: Mutex<HashMap<String, Bytes>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl MockFetcher {
    pub fn serve(&self, url: &str, body: impl Into<Bytes>) {
        self.bodies.lock().unwrap().insert(url.to_string(), body.into());
    }

    pub fn calls(&self, url: &str) -> usize {
        self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
    }
}

#[async_trait]
impl UpstreamFetcher for MockFetcher {
    async fn fetch(&self, url: &str) -> ProxyResult<Bytes> {
        *self.calls.lock().unwrap().entry(url.to_string()).or_default() += 1;
        self.bodies
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| ProxyError::upstream(url, UpstreamFailure::Status(404)))
    }
}

/// Gradient PNG, so different sizes encode to different bytes
pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = RgbaImage::from_fn(width, height, |x, y| {
        Rgba([(x * 255 / width.max(1)) as u8, (y * 255 / height.max(1)) as u8, 128, 255])
    });
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png).unwrap();
    out.into_inner()
}

/// A `CacheService` over an in-memory index and a temporary local tier
pub struct TestHarness {
    pub service: Arc<CacheService>,
    pub fetcher: Arc<MockFetcher>,
    pub config: Config,
    pub database: Database,
    _dir: TempDir,
}

impl TestHarness {
    pub async fn new(tweak: impl FnOnce(&mut Config)) -> Self {
        Self::with_fetcher(Arc::new(MockFetcher::default()), tweak).await
    }

    pub async fn with_fetcher(fetcher: Arc<MockFetcher>, tweak: impl FnOnce(&mut Config)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage.local_path = dir.path().join("blobs");
        tweak(&mut config);

        let database = Database::in_memory().await;
        let service = build_service(&config, &database, fetcher.clone()).await;

        Self {
            service,
            fetcher,
            config,
            database,
            _dir: dir,
        }
    }

    /// A fresh service over the same index and local tier, as after a process restart
    pub async fn restart(&self) -> Arc<CacheService> {
        build_service(&self.config, &self.database, self.fetcher.clone()).await
    }
}

async fn build_service(config: &Config, database: &Database, fetcher: Arc<MockFetcher>) -> Arc<CacheService> {
    let store = Arc::new(TieredStore::from_config(&config.storage).await.unwrap());
    let index = CacheIndexRepository::new(database.connection());
    Arc::new(CacheService::new(config, store, index, fetcher))
}
