//! Error types for the cache module.

use thiserror::Error;

/// Errors that can occur during cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Message not found.
    #[error("message not found: {0}")]
    NotFound(String),

    /// Backend cannot serve the request right now.
    #[error("cache unavailable: {0}")]
    Unavailable(String),

    /// Invalid data in the cache.
    #[error("invalid data: {0}")]
    InvalidData(String),
}

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;
