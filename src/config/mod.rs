use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

pub mod defaults;
pub mod duration_serde;

use defaults::*;
use duration_serde::duration;

/// Environment variable prefix for overrides, e.g. `IMAGE_PROXY_CACHE__MAX_ENTRIES=500`
pub const ENV_PREFIX: &str = "IMAGE_PROXY_";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub transform: TransformConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
    pub max_connections: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Cache-Control header attached to every successfully served image
    #[serde(default = "default_cache_control")]
    pub cache_control: String,
    /// Request body limit for `POST /api/upload`
    #[serde(default = "default_max_upload_size_mb")]
    pub max_upload_size_mb: u64,
}

/// In-memory working set limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Whether lookups go through the memory working set at all
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u64,
    /// Idle time after which an entry is purged from memory
    #[serde(default = "default_entry_ttl", with = "duration")]
    pub ttl: Duration,
    /// Decoded-source reuse across different transforms of the same URL
    #[serde(default = "default_source_cache_entries")]
    pub source_cache_entries: usize,
    #[serde(default = "default_source_cache_size_mb")]
    pub source_cache_size_mb: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationConfig {
    #[serde(default = "default_sync_interval", with = "duration")]
    pub sync_interval: Duration,
    #[serde(default = "default_cleanup_interval", with = "duration")]
    pub cleanup_interval: Duration,
    /// Index rows idle for longer than this are purged along with their bytes
    #[serde(default = "default_index_retention", with = "duration")]
    pub index_retention: Duration,
    #[serde(default = "default_sync_batch_size")]
    pub sync_batch_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory of the on-disk tier
    #[serde(default = "default_local_path")]
    pub local_path: PathBuf,
    /// Keep an in-process byte tier in front of disk
    #[serde(default = "default_true")]
    pub memory_tier_enabled: bool,
    #[serde(default = "default_memory_tier_size_mb")]
    pub memory_tier_size_mb: u64,
    #[serde(default = "default_promotion_queue_capacity")]
    pub promotion_queue_capacity: usize,
    #[serde(default = "default_write_retry_attempts")]
    pub write_retry_attempts: u32,
    /// Optional centralized object store, becomes the slowest tier when set
    pub remote: Option<RemoteStorageConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteStorageConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    #[serde(default = "default_remote_timeout", with = "duration")]
    pub timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_upstream_timeout", with = "duration")]
    pub timeout: Duration,
    #[serde(default = "default_max_source_size_mb")]
    pub max_source_size_mb: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformConfig {
    #[serde(default = "default_max_source_pixels")]
    pub max_source_pixels: u64,
    #[serde(default = "default_true")]
    pub generate_thumbnails: bool,
    #[serde(default = "default_thumbnail_size")]
    pub thumbnail_size: u32,
}

fn default_true() -> bool {
    true
}

fn default_database_url() -> String {
    DEFAULT_DATABASE_URL.to_string()
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_cache_control() -> String {
    DEFAULT_CACHE_CONTROL.to_string()
}

fn default_max_upload_size_mb() -> u64 {
    DEFAULT_MAX_UPLOAD_SIZE_MB
}

fn default_max_entries() -> usize {
    DEFAULT_MAX_ENTRIES
}

fn default_max_size_mb() -> u64 {
    DEFAULT_MAX_SIZE_MB
}

fn default_entry_ttl() -> Duration {
    DEFAULT_ENTRY_TTL
}

fn default_source_cache_entries() -> usize {
    DEFAULT_SOURCE_CACHE_ENTRIES
}

fn default_source_cache_size_mb() -> u64 {
    DEFAULT_SOURCE_CACHE_SIZE_MB
}

fn default_sync_interval() -> Duration {
    DEFAULT_SYNC_INTERVAL
}

fn default_cleanup_interval() -> Duration {
    DEFAULT_CLEANUP_INTERVAL
}

fn default_index_retention() -> Duration {
    DEFAULT_INDEX_RETENTION
}

fn default_sync_batch_size() -> usize {
    DEFAULT_SYNC_BATCH_SIZE
}

fn default_local_path() -> PathBuf {
    PathBuf::from(DEFAULT_LOCAL_PATH)
}

fn default_memory_tier_size_mb() -> u64 {
    DEFAULT_MEMORY_TIER_SIZE_MB
}

fn default_promotion_queue_capacity() -> usize {
    DEFAULT_PROMOTION_QUEUE_CAPACITY
}

fn default_write_retry_attempts() -> u32 {
    DEFAULT_WRITE_RETRY_ATTEMPTS
}

fn default_remote_timeout() -> Duration {
    DEFAULT_REMOTE_TIMEOUT
}

fn default_upstream_timeout() -> Duration {
    DEFAULT_UPSTREAM_TIMEOUT
}

fn default_max_source_size_mb() -> u64 {
    DEFAULT_MAX_SOURCE_SIZE_MB
}

fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}

fn default_max_source_pixels() -> u64 {
    DEFAULT_MAX_SOURCE_PIXELS
}

fn default_thumbnail_size() -> u32 {
    DEFAULT_THUMBNAIL_SIZE
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: Some(DEFAULT_MAX_CONNECTIONS),
        }
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cache_control: default_cache_control(),
            max_upload_size_mb: default_max_upload_size_mb(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: default_max_entries(),
            max_size_mb: default_max_size_mb(),
            ttl: default_entry_ttl(),
            source_cache_entries: default_source_cache_entries(),
            source_cache_size_mb: default_source_cache_size_mb(),
        }
    }
}

impl WebConfig {
    pub fn max_upload_bytes(&self) -> usize {
        (self.max_upload_size_mb * 1024 * 1024) as usize
    }
}

impl CacheConfig {
    pub fn max_bytes(&self) -> u64 {
        self.max_size_mb * 1024 * 1024
    }

    pub fn source_cache_max_bytes(&self) -> u64 {
        self.source_cache_size_mb * 1024 * 1024
    }
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            sync_interval: default_sync_interval(),
            cleanup_interval: default_cleanup_interval(),
            index_retention: default_index_retention(),
            sync_batch_size: default_sync_batch_size(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            local_path: default_local_path(),
            memory_tier_enabled: true,
            memory_tier_size_mb: default_memory_tier_size_mb(),
            promotion_queue_capacity: default_promotion_queue_capacity(),
            write_retry_attempts: default_write_retry_attempts(),
            remote: None,
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            timeout: default_upstream_timeout(),
            max_source_size_mb: default_max_source_size_mb(),
            user_agent: default_user_agent(),
        }
    }
}

impl UpstreamConfig {
    pub fn max_source_bytes(&self) -> usize {
        (self.max_source_size_mb * 1024 * 1024) as usize
    }
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            max_source_pixels: default_max_source_pixels(),
            generate_thumbnails: true,
            thumbnail_size: default_thumbnail_size(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file layered under `IMAGE_PROXY_*` environment overrides.
    ///
    /// A missing file is created with the defaults so operators have something to edit.
    pub fn load_from_file(config_file: &str) -> Result<Self> {
        if !std::path::Path::new(config_file).exists() {
            let contents = toml::to_string_pretty(&Self::default())?;
            std::fs::write(config_file, contents)
                .with_context(|| format!("Failed to write default config to {config_file}"))?;
            info!("Created default config file: {}", config_file);
        }

        Self::figment(config_file)
            .extract()
            .with_context(|| format!("Failed to load configuration from {config_file}"))
    }

    fn figment(config_file: &str) -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(config_file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.web.host, self.web.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.cache.max_entries, 1000);
        assert_eq!(config.cache.max_bytes(), 50 * 1024 * 1024);
        assert_eq!(config.cache.ttl, Duration::from_secs(600));
        assert_eq!(config.reconciliation.sync_interval, Duration::from_secs(30));
        assert_eq!(config.reconciliation.cleanup_interval, Duration::from_secs(300));
        assert_eq!(config.upstream.timeout, Duration::from_secs(10));
        assert_eq!(config.web.cache_control, "public, max-age=86400");
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [cache]
            max_entries = 2
            ttl = "1h"

            [storage.remote]
            base_url = "http://store.local"
            "#,
        )
        .unwrap();

        assert_eq!(config.cache.max_entries, 2);
        assert_eq!(config.cache.ttl, Duration::from_secs(3600));
        assert_eq!(config.cache.max_size_mb, DEFAULT_MAX_SIZE_MB);
        let remote = config.storage.remote.unwrap();
        assert_eq!(remote.timeout, DEFAULT_REMOTE_TIMEOUT);
        assert!(remote.api_key.is_none());
    }

    #[test]
    fn test_load_creates_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let path_str = path.to_str().unwrap();

        let config = Config::load_from_file(path_str).unwrap();
        assert!(path.exists());
        assert_eq!(config.web.port, DEFAULT_PORT);
    }
}
