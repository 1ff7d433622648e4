//! Object-store backed cache for warehouse query results
//!
//! Sits between a client and a slow analytical warehouse. Each query is
//! keyed by an MD5 digest of its exact text plus a time bucket (daily,
//! weekly anchored to Monday, or monthly), so a result is reused until the
//! bucket rolls over and staleness is bounded by the bucket length. On a
//! miss the query runs against the warehouse and the serialized result is
//! written back to the store for the rest of the bucket.
//!
//! Artifacts are written as CSV or Parquet under
//! `{folder}/{md5hex}_{bucketEpochSeconds}.{ext}`, the layout used by
//! pre-existing caches, so old and new artifacts interoperate.
//!
//! # Example
//!
//! ```no_run
//! use query_result_cache::{CacheConfig, CachingQueryExecutor, WarehouseConfig};
//!
//! # async fn example() -> Result<(), query_result_cache::CacheError> {
//! let cache = CacheConfig::new("analytics-cache", "cache", "parquet".parse()?);
//! let warehouse = WarehouseConfig {
//!     host: Some("wh.example.com".to_string()),
//!     database: Some("analytics".to_string()),
//!     username: Some("reader".to_string()),
//!     password: Some("secret".to_string()),
//!     ..Default::default()
//! };
//!
//! let executor = CachingQueryExecutor::connect(cache, warehouse).await?;
//!
//! // Weekly refresh by default; served from the store within the bucket
//! let table = executor.query("SELECT count(*) FROM events").await?;
//! println!("{} rows", table.row_count());
//! # Ok(())
//! # }
//! ```

mod codec;
mod error;
mod executor;
mod key;
mod types;
mod warehouse;

pub use codec::Format;
pub use error::{CacheError, Result};
pub use executor::{CacheConfig, CachingQueryExecutor};
pub use key::{bucket_epoch, bucket_start, derive_key, Clock, SystemClock};
pub use types::{Granularity, Table, Value};
pub use warehouse::{PgWarehouse, Warehouse, WarehouseConfig};
