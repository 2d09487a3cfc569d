//! Centralized error handling for the image proxy
//!
//! # Error Categories
//!
//! - **Upstream Errors**: the origin server was unreachable or answered with a failure status
//! - **Decode Errors**: source bytes could not be decoded for a requested transform
//! - **Encode Errors**: our own transform or re-encode step failed
//! - **Durable Store Errors**: storage tiers could not persist or return bytes
//! - **Cache Inconsistency**: index metadata points at bytes that no longer exist
//!
//! Client-facing failures (`InvalidRequest`, `Decode`, upstream 4xx) are kept apart
//! from internal failures so the web layer can tell "upstream failed" from "we failed".

pub mod types;

pub use types::*;

/// Convenience type alias for Results using ProxyError
pub type ProxyResult<T> = Result<T, ProxyError>;

/// Convenience type alias for Repository Results
pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// Convenience type alias for storage backend Results
pub type StorageResult<T> = Result<T, StorageError>;
