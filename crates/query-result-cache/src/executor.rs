//! Cache probe and populate orchestration

use std::sync::Arc;

use object_store::aws::AmazonS3Builder;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use tracing::{debug, info, warn};

use crate::codec::Format;
use crate::error::{CacheError, Result};
use crate::key::{derive_key, Clock, SystemClock};
use crate::types::{Granularity, Table};
use crate::warehouse::{PgWarehouse, Warehouse, WarehouseConfig};

/// Cache-side settings for [`CachingQueryExecutor`].
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Store container holding cached artifacts.
    pub bucket: String,
    /// Key prefix namespace within the store.
    pub folder: String,
    /// Artifact serialization format, validated at construction.
    pub format: Format,
    /// Log cache hit/miss/write events at `info` instead of `debug`.
    pub verbose: bool,
}

impl CacheConfig {
    pub fn new(bucket: impl Into<String>, folder: impl Into<String>, format: Format) -> Self {
        Self {
            bucket: bucket.into(),
            folder: folder.into(),
            format,
            verbose: false,
        }
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}

/// Query-result cache between a client and a slow analytical warehouse.
///
/// Each call derives a deterministic key from the query text and the
/// requested refresh bucket, probes the object store, and on a miss
/// executes the query and writes the serialized result back under that
/// key. Holds no per-call state, so one instance can be shared across
/// tasks. Two callers racing on the same missing key will both execute
/// and both write; the second write overwrites the first with equivalent
/// content, which wastes work but stays correct. Callers needing
/// at-most-once execution per key can wrap `query` in a single-flight
/// layer of their own.
pub struct CachingQueryExecutor {
    store: Arc<dyn ObjectStore>,
    warehouse: Arc<dyn Warehouse>,
    folder: String,
    format: Format,
    verbose: bool,
    clock: Arc<dyn Clock>,
}

impl CachingQueryExecutor {
    /// Build an executor over injected collaborators. The executor does not
    /// own their lifetimes; both may be shared with other components.
    pub fn new(
        store: Arc<dyn ObjectStore>,
        warehouse: Arc<dyn Warehouse>,
        config: CacheConfig,
    ) -> Result<Self> {
        if config.folder.is_empty() {
            return Err(CacheError::Config("folder must not be empty".to_string()));
        }
        Ok(Self {
            store,
            warehouse,
            folder: config.folder,
            format: config.format,
            verbose: config.verbose,
            clock: Arc::new(SystemClock),
        })
    }

    /// Build an executor over S3 (credentials from the environment) and a
    /// Postgres-protocol warehouse connection.
    pub async fn connect(cache: CacheConfig, warehouse: WarehouseConfig) -> Result<Self> {
        if cache.bucket.is_empty() {
            return Err(CacheError::Config("bucket must not be empty".to_string()));
        }
        let store = AmazonS3Builder::from_env()
            .with_bucket_name(&cache.bucket)
            .build()
            .map_err(|err| CacheError::Config(err.to_string()))?;
        let warehouse = PgWarehouse::connect(&warehouse).await?;
        Self::new(Arc::new(store), Arc::new(warehouse), cache)
    }

    /// Replace the clock used for bucket truncation.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Run a query with the default weekly refresh bucket.
    pub async fn query(&self, sql: &str) -> Result<Table> {
        self.query_with(sql, Granularity::Weekly).await
    }

    /// Run a query, serving the result from the cache when an artifact for
    /// the current bucket exists.
    ///
    /// At most one store read, one warehouse execution and one store write
    /// per call; no internal retries. A corrupt cached artifact is treated
    /// as a miss and the query re-executed. A failed cache write is logged
    /// and the freshly queried table returned anyway. A column-less result
    /// (a zero-row result whose driver reports no column metadata) is
    /// returned without being cached, as it has no schema to round-trip.
    pub async fn query_with(&self, sql: &str, refresh: Granularity) -> Result<Table> {
        let key = derive_key(sql, refresh, &self.folder, self.format, self.clock.today());
        let path = Path::from(key);

        match self.store.get(&path).await {
            Ok(found) => {
                let bytes = found.bytes().await?;
                match self.format.decode(&bytes) {
                    Ok(table) => {
                        self.trace_cache_event(&path, "cache hit");
                        return Ok(table);
                    }
                    Err(err) => {
                        warn!(key = %path, error = %err, "cached artifact corrupt, re-executing query");
                    }
                }
            }
            Err(object_store::Error::NotFound { .. }) => {
                self.trace_cache_event(&path, "cache miss, querying warehouse");
            }
            Err(err) => return Err(CacheError::StoreUnavailable(Box::new(err))),
        }

        let table = self.warehouse.execute(sql).await?;
        if table.columns.is_empty() {
            // Zero-row warehouse results carry no column metadata, so there
            // is no schema to round-trip; serve them uncached.
            debug!(key = %path, "result has no columns, skipping cache write");
            return Ok(table);
        }
        match self.write_back(&path, &table).await {
            Ok(()) => self.trace_cache_event(&path, "cache write complete"),
            Err(err) => {
                warn!(key = %path, error = %err, "cache write failed, returning uncached result");
            }
        }
        Ok(table)
    }

    async fn write_back(&self, path: &Path, table: &Table) -> Result<()> {
        let bytes = self.format.encode(table)?;
        self.store
            .put(path, PutPayload::from(bytes))
            .await
            .map_err(|err| CacheError::CacheWriteFailed(err.to_string()))?;
        Ok(())
    }

    fn trace_cache_event(&self, key: &Path, event: &str) {
        if self.verbose {
            info!(key = %key, "{}", event);
        } else {
            debug!(key = %key, "{}", event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::bucket_epoch;
    use crate::types::Value;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use futures::stream::BoxStream;
    use object_store::memory::InMemory;
    use object_store::{
        GetOptions, GetResult, ListResult, MultipartUpload, ObjectMeta, PutMultipartOpts,
        PutOptions, PutResult,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedClock(NaiveDate);

    impl Clock for FixedClock {
        fn today(&self) -> NaiveDate {
            self.0
        }
    }

    struct MockWarehouse {
        table: Table,
        executions: AtomicUsize,
    }

    impl MockWarehouse {
        fn new(table: Table) -> Self {
            Self {
                table,
                executions: AtomicUsize::new(0),
            }
        }

        fn executions(&self) -> usize {
            self.executions.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Warehouse for MockWarehouse {
        async fn execute(&self, _sql: &str) -> Result<Table> {
            self.executions.fetch_add(1, Ordering::SeqCst);
            Ok(self.table.clone())
        }
    }

    struct FailingWarehouse;

    #[async_trait]
    impl Warehouse for FailingWarehouse {
        async fn execute(&self, _sql: &str) -> Result<Table> {
            Err(CacheError::QueryFailed("syntax error".into()))
        }
    }

    /// Delegates everything to an in-memory store but refuses writes.
    #[derive(Debug)]
    struct FailingPutStore {
        inner: InMemory,
    }

    impl std::fmt::Display for FailingPutStore {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "FailingPutStore")
        }
    }

    #[async_trait]
    impl ObjectStore for FailingPutStore {
        async fn put_opts(
            &self,
            _location: &Path,
            _payload: PutPayload,
            _opts: PutOptions,
        ) -> object_store::Result<PutResult> {
            Err(object_store::Error::Generic {
                store: "FailingPutStore",
                source: "put refused".into(),
            })
        }

        async fn put_multipart_opts(
            &self,
            location: &Path,
            opts: PutMultipartOpts,
        ) -> object_store::Result<Box<dyn MultipartUpload>> {
            self.inner.put_multipart_opts(location, opts).await
        }

        async fn get_opts(
            &self,
            location: &Path,
            options: GetOptions,
        ) -> object_store::Result<GetResult> {
            self.inner.get_opts(location, options).await
        }

        async fn delete(&self, location: &Path) -> object_store::Result<()> {
            self.inner.delete(location).await
        }

        fn list(&self, prefix: Option<&Path>) -> BoxStream<'_, object_store::Result<ObjectMeta>> {
            self.inner.list(prefix)
        }

        async fn list_with_delimiter(
            &self,
            prefix: Option<&Path>,
        ) -> object_store::Result<ListResult> {
            self.inner.list_with_delimiter(prefix).await
        }

        async fn copy(&self, from: &Path, to: &Path) -> object_store::Result<()> {
            self.inner.copy(from, to).await
        }

        async fn copy_if_not_exists(&self, from: &Path, to: &Path) -> object_store::Result<()> {
            self.inner.copy_if_not_exists(from, to).await
        }
    }

    /// Delegates everything to an in-memory store but refuses reads.
    #[derive(Debug)]
    struct FailingGetStore {
        inner: InMemory,
    }

    impl std::fmt::Display for FailingGetStore {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "FailingGetStore")
        }
    }

    #[async_trait]
    impl ObjectStore for FailingGetStore {
        async fn put_opts(
            &self,
            location: &Path,
            payload: PutPayload,
            opts: PutOptions,
        ) -> object_store::Result<PutResult> {
            self.inner.put_opts(location, payload, opts).await
        }

        async fn put_multipart_opts(
            &self,
            location: &Path,
            opts: PutMultipartOpts,
        ) -> object_store::Result<Box<dyn MultipartUpload>> {
            self.inner.put_multipart_opts(location, opts).await
        }

        async fn get_opts(
            &self,
            _location: &Path,
            _options: GetOptions,
        ) -> object_store::Result<GetResult> {
            Err(object_store::Error::Generic {
                store: "FailingGetStore",
                source: "get refused".into(),
            })
        }

        async fn delete(&self, location: &Path) -> object_store::Result<()> {
            self.inner.delete(location).await
        }

        fn list(&self, prefix: Option<&Path>) -> BoxStream<'_, object_store::Result<ObjectMeta>> {
            self.inner.list(prefix)
        }

        async fn list_with_delimiter(
            &self,
            prefix: Option<&Path>,
        ) -> object_store::Result<ListResult> {
            self.inner.list_with_delimiter(prefix).await
        }

        async fn copy(&self, from: &Path, to: &Path) -> object_store::Result<()> {
            self.inner.copy(from, to).await
        }

        async fn copy_if_not_exists(&self, from: &Path, to: &Path) -> object_store::Result<()> {
            self.inner.copy_if_not_exists(from, to).await
        }
    }

    fn sample_table() -> Table {
        Table::new(
            vec!["id".to_string(), "name".to_string()],
            vec![
                vec![Value::Int(1), Value::Text("alpha".to_string())],
                vec![Value::Int(2), Value::Null],
            ],
        )
    }

    fn monday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 8).unwrap()
    }

    fn executor(
        store: Arc<dyn ObjectStore>,
        warehouse: Arc<dyn Warehouse>,
        format: Format,
    ) -> CachingQueryExecutor {
        CachingQueryExecutor::new(store, warehouse, CacheConfig::new("test", "cache", format))
            .unwrap()
            .with_clock(Arc::new(FixedClock(monday())))
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let store = Arc::new(InMemory::new());
        let warehouse = Arc::new(MockWarehouse::new(sample_table()));
        let exec = executor(store, warehouse.clone(), Format::Parquet);

        let first = exec.query_with("SELECT 1", Granularity::Daily).await.unwrap();
        assert_eq!(first, sample_table());
        assert_eq!(warehouse.executions(), 1);

        let second = exec.query_with("SELECT 1", Granularity::Daily).await.unwrap();
        assert_eq!(second, sample_table());
        // Served from the store, no second execution
        assert_eq!(warehouse.executions(), 1);
    }

    #[tokio::test]
    async fn test_miss_writes_artifact_at_derived_key() {
        let store = Arc::new(InMemory::new());
        let warehouse = Arc::new(MockWarehouse::new(sample_table()));
        let exec = executor(store.clone(), warehouse, Format::Parquet);

        exec.query_with("SELECT 1", Granularity::Weekly).await.unwrap();

        let key = format!(
            "cache/b1698e52a0f16203489454196a0c6307_{}.parquet",
            bucket_epoch(Granularity::Weekly, monday())
        );
        let stored = store.get(&Path::from(key)).await.unwrap();
        let bytes = stored.bytes().await.unwrap();
        assert_eq!(Format::Parquet.decode(&bytes).unwrap(), sample_table());
    }

    #[tokio::test]
    async fn test_different_granularities_use_different_keys() {
        let store = Arc::new(InMemory::new());
        let warehouse = Arc::new(MockWarehouse::new(sample_table()));
        let exec = executor(store, warehouse.clone(), Format::Parquet);

        exec.query_with("SELECT 1", Granularity::Daily).await.unwrap();
        exec.query_with("SELECT 1", Granularity::Monthly).await.unwrap();
        // Monday 2024-01-08: daily and monthly buckets differ, so the second
        // call misses and executes again
        assert_eq!(warehouse.executions(), 2);
    }

    #[tokio::test]
    async fn test_query_failure_propagates_without_cache_write() {
        let store = Arc::new(InMemory::new());
        let exec = executor(store.clone(), Arc::new(FailingWarehouse), Format::Parquet);

        let err = exec.query_with("SELECT nope", Granularity::Daily).await.unwrap_err();
        assert!(matches!(err, CacheError::QueryFailed(_)));

        let key = derive_key(
            "SELECT nope",
            Granularity::Daily,
            "cache",
            Format::Parquet,
            monday(),
        );
        let probe = store.get(&Path::from(key)).await;
        assert!(matches!(probe, Err(object_store::Error::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_store_failure_propagates_without_execution() {
        let store = Arc::new(FailingGetStore {
            inner: InMemory::new(),
        });
        let warehouse = Arc::new(MockWarehouse::new(sample_table()));
        let exec = executor(store, warehouse.clone(), Format::Parquet);

        let err = exec.query_with("SELECT 1", Granularity::Daily).await.unwrap_err();
        assert!(matches!(err, CacheError::StoreUnavailable(_)));
        // A store failure is never treated as a miss
        assert_eq!(warehouse.executions(), 0);
    }

    #[tokio::test]
    async fn test_empty_result_with_columns_is_cached() {
        let store = Arc::new(InMemory::new());
        let empty = Table::new(vec!["id".to_string()], vec![]);
        let warehouse = Arc::new(MockWarehouse::new(empty.clone()));
        let exec = executor(store, warehouse.clone(), Format::Parquet);

        let first = exec.query_with("SELECT 1", Granularity::Daily).await.unwrap();
        assert_eq!(first, empty);
        let second = exec.query_with("SELECT 1", Granularity::Daily).await.unwrap();
        assert_eq!(second, empty);
        assert_eq!(warehouse.executions(), 1);
    }

    #[tokio::test]
    async fn test_column_less_result_returned_but_not_cached() {
        let store = Arc::new(InMemory::new());
        let warehouse = Arc::new(MockWarehouse::new(Table::new(vec![], vec![])));
        let exec = executor(store.clone(), warehouse.clone(), Format::Parquet);

        let table = exec.query_with("SELECT 1", Granularity::Daily).await.unwrap();
        assert!(table.columns.is_empty());

        let key = derive_key(
            "SELECT 1",
            Granularity::Daily,
            "cache",
            Format::Parquet,
            monday(),
        );
        let probe = store.get(&Path::from(key)).await;
        assert!(matches!(probe, Err(object_store::Error::NotFound { .. })));

        // Without a schema to round-trip, each call goes to the warehouse
        exec.query_with("SELECT 1", Granularity::Daily).await.unwrap();
        assert_eq!(warehouse.executions(), 2);
    }

    #[tokio::test]
    async fn test_write_failure_still_returns_table() {
        let store = Arc::new(FailingPutStore {
            inner: InMemory::new(),
        });
        let warehouse = Arc::new(MockWarehouse::new(sample_table()));
        let exec = executor(store, warehouse.clone(), Format::Parquet);

        let table = exec.query_with("SELECT 1", Granularity::Daily).await.unwrap();
        assert_eq!(table, sample_table());
        assert_eq!(warehouse.executions(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_artifact_reexecutes_and_heals() {
        let store = Arc::new(InMemory::new());
        let key = derive_key(
            "SELECT 1",
            Granularity::Daily,
            "cache",
            Format::Parquet,
            monday(),
        );
        let path = Path::from(key);
        store
            .put(&path, PutPayload::from_static(b"not parquet"))
            .await
            .unwrap();

        let warehouse = Arc::new(MockWarehouse::new(sample_table()));
        let exec = executor(store.clone(), warehouse.clone(), Format::Parquet);

        let table = exec.query_with("SELECT 1", Granularity::Daily).await.unwrap();
        assert_eq!(table, sample_table());
        assert_eq!(warehouse.executions(), 1);

        // The rewritten artifact now decodes, so the next call is a hit
        let again = exec.query_with("SELECT 1", Granularity::Daily).await.unwrap();
        assert_eq!(again, sample_table());
        assert_eq!(warehouse.executions(), 1);
    }

    #[tokio::test]
    async fn test_csv_round_trip_through_cache() {
        let store = Arc::new(InMemory::new());
        let warehouse = Arc::new(MockWarehouse::new(sample_table()));
        let exec = executor(store, warehouse.clone(), Format::Csv);

        exec.query_with("SELECT 1", Granularity::Daily).await.unwrap();
        let hit = exec.query_with("SELECT 1", Granularity::Daily).await.unwrap();
        assert_eq!(hit, sample_table());
        assert_eq!(warehouse.executions(), 1);
    }

    #[tokio::test]
    async fn test_empty_folder_is_config_error() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let warehouse: Arc<dyn Warehouse> = Arc::new(MockWarehouse::new(sample_table()));
        let result = CachingQueryExecutor::new(
            store,
            warehouse,
            CacheConfig::new("test", "", Format::Csv),
        );
        assert!(matches!(result.err(), Some(CacheError::Config(_))));
    }
}
