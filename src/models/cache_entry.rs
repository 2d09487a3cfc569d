//! Cache entry metadata shared by the memory working set and the durable index

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata for one transformed image held by the cache.
///
/// `size` always equals the length of the bytes stored under `locator`. `dirty` is set
/// whenever the in-memory copy diverges from the durable index and cleared only after a
/// successful sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    /// Storage id of the transformed bytes
    pub locator: String,
    /// Storage id of the thumbnail artifact, if one was generated
    pub thumb_locator: Option<String>,
    pub content_type: String,
    pub format: String,
    pub size: u64,
    pub etag: String,
    pub access_count: u64,
    pub last_access: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub dirty: bool,
}

impl CacheEntry {
    /// New entry for freshly written bytes. Starts dirty since the index has not seen it.
    pub fn new(
        key: impl Into<String>,
        locator: impl Into<String>,
        content_type: impl Into<String>,
        format: impl Into<String>,
        size: u64,
        etag: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            key: key.into(),
            locator: locator.into(),
            thumb_locator: None,
            content_type: content_type.into(),
            format: format.into(),
            size,
            etag: etag.into(),
            access_count: 0,
            last_access: now,
            created_at: now,
            dirty: true,
        }
    }

    pub fn with_thumbnail(mut self, thumb_locator: Option<String>) -> Self {
        self.thumb_locator = thumb_locator;
        self
    }

    /// Record a hit
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.access_count += 1;
        self.last_access = now;
        self.dirty = true;
    }

    /// Every storage id this entry owns
    pub fn locators(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.locator.as_str()).chain(self.thumb_locator.as_deref())
    }

    pub fn idle_for(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.last_access)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_touch_marks_dirty_and_counts() {
        let mut entry = CacheEntry::new("k", "id", "image/webp", "webp", 10, "\"e\"");
        entry.dirty = false;
        let later = entry.last_access + chrono::Duration::seconds(5);

        entry.touch(later);

        assert!(entry.dirty);
        assert_eq!(entry.access_count, 1);
        assert_eq!(entry.last_access, later);
        assert_eq!(entry.idle_for(later), chrono::Duration::zero());
    }

    #[test]
    fn test_locators_include_thumbnail() {
        let entry = CacheEntry::new("k", "id", "image/png", "png", 1, "\"e\"")
            .with_thumbnail(Some("id_thumb".to_string()));
        assert_eq!(entry.locators().collect::<Vec<_>>(), vec!["id", "id_thumb"]);
    }
}
