//! Error type definitions for the image proxy
//!
//! `ProxyError` is the taxonomy surfaced by `CacheService::resolve`. Lower layers
//! use narrower enums (`StorageError`, `RepositoryError`) which convert into it.

use thiserror::Error;

/// Top-level error returned from the proxy pipeline
#[derive(Error, Debug)]
pub enum ProxyError {
    /// The request carried parameters we refuse to act on
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    /// Network failure or non-success status from the origin server
    #[error("Upstream fetch failed for {url}: {kind}")]
    UpstreamFetch { url: String, kind: UpstreamFailure },

    /// A stored image or thumbnail named by the request does not exist
    #[error("Not found: {resource}")]
    NotFound { resource: String },

    /// Source bytes are malformed or in a format we cannot decode
    #[error("Decode error: {message}")]
    Decode { message: String },

    /// Internal transform or re-encode failure
    #[error("Encode error: {message}")]
    Encode { message: String },

    /// No storage tier could persist or return the bytes
    #[error("Durable store error: {0}")]
    DurableStore(#[from] StorageError),

    /// Index metadata references bytes that are missing from every tier
    #[error("Cache inconsistency: {key} references missing blob {locator}")]
    CacheInconsistency { key: String, locator: String },

    /// Durable index failures
    #[error("Index error: {0}")]
    Index(#[from] RepositoryError),
}

/// Why an upstream fetch failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamFailure {
    Timeout,
    Network(String),
    Status(u16),
    TooLarge { limit: usize },
}

impl std::fmt::Display for UpstreamFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpstreamFailure::Timeout => write!(f, "timed out"),
            UpstreamFailure::Network(message) => write!(f, "network error: {message}"),
            UpstreamFailure::Status(code) => write!(f, "upstream returned status {code}"),
            UpstreamFailure::TooLarge { limit } => {
                write!(f, "response body exceeds {limit} bytes")
            }
        }
    }
}

impl ProxyError {
    /// Create an invalid request error
    pub fn invalid_request<S: Into<String>>(message: S) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Create an upstream fetch error
    pub fn upstream<S: Into<String>>(url: S, kind: UpstreamFailure) -> Self {
        Self::UpstreamFetch {
            url: url.into(),
            kind,
        }
    }

    pub fn not_found<S: Into<String>>(resource: S) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    /// Create a decode error
    pub fn decode<S: Into<String>>(message: S) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Create an encode error
    pub fn encode<S: Into<String>>(message: S) -> Self {
        Self::Encode {
            message: message.into(),
        }
    }

    /// Create a cache inconsistency error
    pub fn inconsistency<K: Into<String>, L: Into<String>>(key: K, locator: L) -> Self {
        Self::CacheInconsistency {
            key: key.into(),
            locator: locator.into(),
        }
    }

    /// Whether the failure was caused by the request or its source image rather than by us
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidRequest { .. } | Self::NotFound { .. } | Self::Decode { .. }
        )
    }

    /// Whether the failure originated at the upstream server
    pub fn is_upstream_error(&self) -> bool {
        matches!(self, Self::UpstreamFetch { .. })
    }
}

/// Storage backend errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Blob not found: {id}")]
    NotFound { id: String },

    #[error("I/O error in {backend}: {source}")]
    Io {
        backend: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Remote store error in {backend}: {message}")]
    Remote { backend: String, message: String },

    #[error("Storage tier {backend} rejected blob: {message}")]
    Rejected { backend: String, message: String },

    #[error("All storage tiers failed: {message}")]
    AllTiersFailed { message: String },
}

impl StorageError {
    pub fn not_found<S: Into<String>>(id: S) -> Self {
        Self::NotFound { id: id.into() }
    }

    pub fn io<S: Into<String>>(backend: S, source: std::io::Error) -> Self {
        Self::Io {
            backend: backend.into(),
            source,
        }
    }

    pub fn remote<S: Into<String>, M: Into<String>>(backend: S, message: M) -> Self {
        Self::Remote {
            backend: backend.into(),
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Transient failures are worth retrying before degrading to faster tiers
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Io { source, .. } => matches!(
                source.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::TimedOut
            ),
            Self::Remote { message, .. } => {
                let lower = message.to_lowercase();
                lower.contains("timeout") || lower.contains("busy") || lower.contains("503")
            }
            _ => false,
        }
    }
}

/// Durable index (repository layer) errors
#[derive(Error, Debug)]
pub enum RepositoryError {
    /// Database errors from SeaORM
    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    /// Query execution failures
    #[error("Query failed: {query} - {message}")]
    QueryFailed { query: String, message: String },
}

impl RepositoryError {
    pub fn query_failed<Q: Into<String>, M: Into<String>>(query: Q, message: M) -> Self {
        Self::QueryFailed {
            query: query.into(),
            message: message.into(),
        }
    }
}
