//! Output of a successful resolution

use bytes::Bytes;
use serde::Serialize;
use strum::{AsRefStr, Display, IntoStaticStr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, AsRefStr, IntoStaticStr)]
#[strum(serialize_all = "UPPERCASE")]
#[serde(rename_all = "lowercase")]
pub enum CacheStatus {
    Hit,
    Miss,
}

/// Bytes ready to serve plus the response metadata that goes with them
#[derive(Debug, Clone)]
pub struct ResolvedImage {
    pub bytes: Bytes,
    pub content_type: String,
    pub cache_control: String,
    /// Quoted SHA-256 of `bytes`
    pub etag: String,
    pub cache_status: CacheStatus,
    pub key: String,
}

impl ResolvedImage {
    pub fn is_hit(&self) -> bool {
        self.cache_status == CacheStatus::Hit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_header_values() {
        assert_eq!(CacheStatus::Hit.to_string(), "HIT");
        assert_eq!(CacheStatus::Miss.as_ref(), "MISS");
    }
}
