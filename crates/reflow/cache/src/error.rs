use thiserror::Error;

/// Errors raised by cache providers.
///
/// These never escape [`crate::TieredCache`]; they are logged and turned
/// into misses there.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(String),
    #[error("cache serialization error: {0}")]
    Serialization(String),
    #[error("cache provider unavailable: {0}")]
    Unavailable(String),
}

impl From<serde_json::Error> for CacheError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(value.to_string())
    }
}

pub type CacheResult<T> = Result<T, CacheError>;
