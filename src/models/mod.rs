//! Domain models

pub mod cache_entry;
pub mod listing;
pub mod resolved;
pub mod transform;

pub use cache_entry::CacheEntry;
pub use listing::{EntryListParams, EntryListQuery, EntryPage, EntrySort, EntrySummary};
pub use resolved::{CacheStatus, ResolvedImage};
pub use transform::{OutputFormat, ResizeMode, TransformParams, TransformRequest};
