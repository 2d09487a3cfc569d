//! HTTP request handlers
//!
//! Handlers are thin: they parse the request, call `CacheService` and map the result.

pub mod admin;
pub mod health;
pub mod images;
pub mod storage;
