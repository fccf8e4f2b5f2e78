//! End-to-end test infrastructure for explorer-index.
//!
//! Provides a shared TestHarness over real stores (RocksDB streams, SQLite,
//! Tantivy) in a temp directory, plus engine and ingester wrappers that
//! inject failures or record concurrency.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::Row;

use explorer_indexing::{
    EventPublisher, IndexWriter, MessageIngester, PollingQueueReader, RelationalIngester,
    StreamPublisher, StreamQueueReader,
};
use explorer_relational::{Materializer, MaterializerConfig, QueueTable, RelationalConfig};
use explorer_scheduler::{IngestionScheduler, SchedulerMetrics};
use explorer_search::{
    BulkItemResponse, BulkOperation, SearchEngine, SearchError, SearchIndex, SearchIndexConfig,
    StoredDocument, TantivyEngine,
};
use explorer_storage::StreamStore;
use explorer_types::{
    IngestAction, IngestionOutcome, NewEvent, QueuedEvent, ResourceUniqueId, FOLDER_TYPE,
};

/// Consumer group used by every stream reader in these tests.
pub const GROUP: &str = "explorer";

/// Shared test harness for E2E tests.
pub struct TestHarness {
    /// Keeps temp dir alive for the lifetime of the harness
    pub _temp_dir: tempfile::TempDir,
    pub store: Arc<StreamStore>,
    pub table: QueueTable,
    pub engine: TantivyEngine,
}

impl TestHarness {
    /// Create a harness with fresh stores.
    pub async fn new() -> Self {
        let temp_dir = tempfile::TempDir::new().expect("Failed to create temp dir");

        let stream_path = temp_dir.path().join("streams");
        std::fs::create_dir_all(&stream_path).expect("Failed to create stream dir");
        let store = Arc::new(StreamStore::open(&stream_path).expect("Failed to open stream store"));

        let pool = RelationalConfig::with_database_path(temp_dir.path().join("explorer.db"))
            .connect()
            .await
            .expect("Failed to open relational store");

        let index_path = temp_dir.path().join("search-index");
        std::fs::create_dir_all(&index_path).expect("Failed to create index dir");
        let index = SearchIndex::open_or_create(SearchIndexConfig::new(&index_path))
            .expect("Failed to open search index");
        let engine = TantivyEngine::new(&index).expect("Failed to create engine");

        Self {
            _temp_dir: temp_dir,
            store,
            table: QueueTable::new(pool),
            engine,
        }
    }

    pub fn stream_reader(&self, consumer: &str) -> Arc<StreamQueueReader> {
        Arc::new(StreamQueueReader::new(self.store.clone(), GROUP, consumer))
    }

    pub fn polling_reader(&self) -> Arc<PollingQueueReader> {
        Arc::new(PollingQueueReader::new(self.table.clone()))
    }

    pub fn materializer(&self) -> Materializer {
        Materializer::new(self.table.pool().clone(), MaterializerConfig::default())
    }

    /// Two-phase ingester writing to the harness index.
    pub fn ingester(&self) -> Arc<RelationalIngester> {
        self.ingester_with_engine(Arc::new(self.engine.clone()))
    }

    pub fn ingester_with_engine(&self, engine: Arc<dyn SearchEngine>) -> Arc<RelationalIngester> {
        Arc::new(RelationalIngester::new(
            self.materializer(),
            IndexWriter::new(engine),
        ))
    }

    pub async fn publish_stream(&self, events: Vec<NewEvent>) {
        let publisher = StreamPublisher::new(self.store.clone());
        for event in events {
            publisher.publish(event).await.expect("Failed to publish");
        }
    }

    pub async fn publish_table(&self, events: Vec<NewEvent>) {
        for event in events {
            self.table.publish(event).await.expect("Failed to enqueue");
        }
    }

    /// Indexed document of a non-folder resource.
    pub async fn resource_document(
        &self,
        resource_id: &str,
        application: &str,
        resource_type: &str,
    ) -> Option<StoredDocument> {
        let unique_id = ResourceUniqueId::new(resource_id, application, resource_type).to_string();
        let row = sqlx::query("SELECT id FROM resources WHERE resource_unique_id = ?1")
            .bind(&unique_id)
            .fetch_optional(self.table.pool())
            .await
            .expect("Failed to look up resource row")?;
        let id: i64 = row.get("id");
        self.engine
            .get(application, &id.to_string())
            .await
            .expect("Failed to read document")
    }

    /// Indexed document of a folder, by external id.
    pub async fn folder_document(&self, ent_id: &str) -> Option<StoredDocument> {
        let (id, _) = self.folder_path(ent_id).await?;
        self.engine
            .get(FOLDER_TYPE, &id.to_string())
            .await
            .expect("Failed to read folder document")
    }

    /// Folder row id and ancestor chain, nearest first.
    pub async fn folder_path(&self, ent_id: &str) -> Option<(i64, Vec<i64>)> {
        self.materializer()
            .folder_path(ent_id)
            .await
            .expect("Failed to resolve folder")
    }

    pub async fn index_count(&self, index: &str) -> usize {
        self.engine.count(index).await.expect("Failed to count")
    }
}

/// Upsert of a `drive` file carrying a `title` field.
pub fn file_upsert(resource_id: &str, version: i64) -> NewEvent {
    NewEvent::new(resource_id, "drive", "file", IngestAction::Upsert, version)
        .with_field("title", serde_json::json!(format!("{} v{}", resource_id, version)))
}

pub fn file_delete(resource_id: &str, version: i64) -> NewEvent {
    NewEvent::new(resource_id, "drive", "file", IngestAction::Delete, version)
}

/// Folder upsert; `parent` of `None` attaches it to the root.
pub fn folder_upsert(ent_id: &str, parent: Option<&str>) -> NewEvent {
    let event = NewEvent::new(ent_id, "drive", FOLDER_TYPE, IngestAction::Upsert, 1)
        .with_field("name", serde_json::json!(ent_id));
    match parent {
        Some(parent) => event.with_field("parentId", serde_json::json!(parent)),
        None => event,
    }
}

/// Poll scheduler metrics until `done` holds or the timeout passes.
pub async fn wait_for_metrics(
    scheduler: &IngestionScheduler,
    timeout: Duration,
    done: impl Fn(&SchedulerMetrics) -> bool,
) -> SchedulerMetrics {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let metrics = scheduler.metrics().await.expect("Scheduler gone");
        if done(&metrics) || tokio::time::Instant::now() >= deadline {
            return metrics;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Engine that fails the first `failures` bulk calls, then delegates.
pub struct FlakyEngine {
    inner: Arc<dyn SearchEngine>,
    failures_left: AtomicUsize,
}

impl FlakyEngine {
    pub fn new(inner: Arc<dyn SearchEngine>, failures: usize) -> Self {
        Self {
            inner,
            failures_left: AtomicUsize::new(failures),
        }
    }
}

#[async_trait]
impl SearchEngine for FlakyEngine {
    async fn bulk(&self, operations: Vec<BulkOperation>) -> Result<Vec<BulkItemResponse>, SearchError> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SearchError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "engine unreachable",
            )));
        }
        self.inner.bulk(operations).await
    }

    async fn get(&self, index: &str, id: &str) -> Result<Option<StoredDocument>, SearchError> {
        self.inner.get(index, id).await
    }

    async fn count(&self, index: &str) -> Result<usize, SearchError> {
        self.inner.count(index).await
    }
}

/// Ingester wrapper that records how many calls overlap.
pub struct RecordingIngester {
    inner: Arc<dyn MessageIngester>,
    delay: Duration,
    active: AtomicUsize,
    max_active: AtomicUsize,
    calls: AtomicUsize,
}

impl RecordingIngester {
    pub fn new(inner: Arc<dyn MessageIngester>, delay: Duration) -> Self {
        Self {
            inner,
            delay,
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageIngester for RecordingIngester {
    async fn ingest(&self, events: Vec<QueuedEvent>) -> IngestionOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        let outcome = self.inner.ingest(events).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        outcome
    }
}
