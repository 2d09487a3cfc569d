//! Configuration default values
//!
//! Kept in one place so the documented defaults and the serde defaults never drift.
use std::time::Duration;

// Database defaults
pub const DEFAULT_DATABASE_URL: &str = "sqlite://./data/image-proxy.db";
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

// Web server defaults
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_CACHE_CONTROL: &str = "public, max-age=86400";
pub const DEFAULT_MAX_UPLOAD_SIZE_MB: u64 = 32;

// Memory cache defaults
pub const DEFAULT_MAX_ENTRIES: usize = 1000;
pub const DEFAULT_MAX_SIZE_MB: u64 = 50;
pub const DEFAULT_ENTRY_TTL: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_SOURCE_CACHE_ENTRIES: usize = 64;
pub const DEFAULT_SOURCE_CACHE_SIZE_MB: u64 = 64;

// Reconciliation defaults
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_INDEX_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);
pub const DEFAULT_SYNC_BATCH_SIZE: usize = 500;

// Storage defaults
pub const DEFAULT_LOCAL_PATH: &str = "./data/cache";
pub const DEFAULT_MEMORY_TIER_SIZE_MB: u64 = 50;
pub const DEFAULT_PROMOTION_QUEUE_CAPACITY: usize = 256;
pub const DEFAULT_WRITE_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_REMOTE_TIMEOUT: Duration = Duration::from_secs(10);

// Upstream defaults
pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_SOURCE_SIZE_MB: u64 = 25;
pub const DEFAULT_USER_AGENT: &str = concat!("image-proxy/", env!("CARGO_PKG_VERSION"));

// Transform defaults
pub const DEFAULT_QUALITY: u8 = 80;
pub const MIN_QUALITY: u8 = 1;
pub const MAX_QUALITY: u8 = 100;
pub const MIN_DIMENSION: u32 = 1;
pub const MAX_DIMENSION: u32 = 5000;
pub const DEFAULT_MAX_SOURCE_PIXELS: u64 = 50_000_000;
pub const DEFAULT_THUMBNAIL_SIZE: u32 = 200;
