//! Error types for the replication service.

use dissem_cache::CacheError;
use dissem_core::{ConfigError, CoreError};
use dissem_replication::ReplicationError;
use thiserror::Error;

/// Errors that can occur during service operations.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Configuration rejected.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Gateway or session failure.
    #[error("replication error: {0}")]
    Replication(#[from] ReplicationError),

    /// Cache failure.
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    /// Control message could not be decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CoreError),
}

/// Result type for service operations.
pub type Result<T> = std::result::Result<T, ServiceError>;
