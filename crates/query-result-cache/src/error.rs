//! Error types for the query result cache

use std::fmt;

#[derive(Debug)]
pub enum CacheError {
    /// Invalid or incomplete construction parameters
    Config(String),
    /// Unrecognized refresh granularity, rejected before any I/O
    InvalidGranularity(String),
    /// Unsupported serialization format, rejected at construction
    InvalidFormat(String),
    /// Object store failed for a reason other than "not found"
    StoreUnavailable(Box<object_store::Error>),
    /// Warehouse execution failed; no cache write is attempted
    QueryFailed(Box<dyn std::error::Error + Send + Sync>),
    /// Artifact write failed after a successful query; logged, never fatal
    CacheWriteFailed(String),
    /// A found artifact failed to decode; treated as a miss and re-executed
    CacheCorrupt(String),
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::Config(msg) => write!(f, "Configuration error: {}", msg),
            CacheError::InvalidGranularity(value) => write!(
                f,
                "Invalid granularity '{}', expected one of daily, weekly, monthly",
                value
            ),
            CacheError::InvalidFormat(value) => {
                write!(f, "Invalid format '{}', expected one of csv, parquet", value)
            }
            CacheError::StoreUnavailable(err) => write!(f, "Object store error: {}", err),
            CacheError::QueryFailed(err) => write!(f, "Warehouse query failed: {}", err),
            CacheError::CacheWriteFailed(msg) => write!(f, "Cache write failed: {}", msg),
            CacheError::CacheCorrupt(msg) => write!(f, "Cached artifact corrupt: {}", msg),
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CacheError::StoreUnavailable(err) => Some(err.as_ref()),
            CacheError::QueryFailed(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<object_store::Error> for CacheError {
    fn from(err: object_store::Error) -> Self {
        CacheError::StoreUnavailable(Box::new(err))
    }
}

impl From<sqlx::Error> for CacheError {
    fn from(err: sqlx::Error) -> Self {
        CacheError::QueryFailed(Box::new(err))
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
