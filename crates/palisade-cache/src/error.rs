//! Cache error type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache entry could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("cache entry is corrupt: {0}")]
    Corrupt(String),
    #[error("key/value store error: {0}")]
    Store(String),
}
