//! Repositories over the durable index

pub mod cache_index;

pub use cache_index::CacheIndexRepository;
