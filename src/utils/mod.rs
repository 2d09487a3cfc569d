//! Shared utilities

pub mod retry;

pub use retry::{Retryable, RetryConfig, with_retry};
