//! image-proxy: an image transformation proxy with a tiered cache
//!
//! Requests name a source URL plus optional transform parameters. Transformed bytes are
//! kept in a bounded memory working set backed by ordered storage tiers and a SQLite
//! index that survives restarts.

pub mod codec;
pub mod config;
pub mod database;
pub mod errors;
pub mod models;
pub mod services;
pub mod storage;
pub mod utils;
pub mod web;

pub use config::Config;
pub use errors::{ProxyError, ProxyResult};
pub use services::CacheService;
