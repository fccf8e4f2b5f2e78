//! Message ingesters: turn a merged batch into an outcome.
//!
//! [`RelationalIngester`] is the two-phase path: materialize in the
//! relational store, then write the enriched events to the index, then
//! purge rows whose delete reached the index. [`IndexOnlyIngester`] skips
//! the relational phase.

use async_trait::async_trait;
use tracing::{debug, warn};

use explorer_relational::Materializer;
use explorer_types::{IngestAction, IngestionOutcome, QueuedEvent};

use crate::writer::IndexWriter;

/// Ingests a batch. Per-event failures land in the outcome; nothing here
/// aborts the batch.
#[async_trait]
pub trait MessageIngester: Send + Sync {
    async fn ingest(&self, events: Vec<QueuedEvent>) -> IngestionOutcome;
}

/// Writes events straight to the index.
pub struct IndexOnlyIngester {
    writer: IndexWriter,
}

impl IndexOnlyIngester {
    pub fn new(writer: IndexWriter) -> Self {
        Self { writer }
    }
}

#[async_trait]
impl MessageIngester for IndexOnlyIngester {
    async fn ingest(&self, events: Vec<QueuedEvent>) -> IngestionOutcome {
        self.writer.write(events).await
    }
}

/// Materializes relational state before writing to the index.
pub struct RelationalIngester {
    materializer: Materializer,
    writer: IndexWriter,
}

impl RelationalIngester {
    pub fn new(materializer: Materializer, writer: IndexWriter) -> Self {
        Self {
            materializer,
            writer,
        }
    }

    pub fn materializer(&self) -> &Materializer {
        &self.materializer
    }
}

#[async_trait]
impl MessageIngester for RelationalIngester {
    async fn ingest(&self, events: Vec<QueuedEvent>) -> IngestionOutcome {
        let materialized = self.materializer.materialize(events).await;

        let mut outcome = IngestionOutcome {
            succeeded: materialized.noop,
            failed: materialized.failed,
        };

        let mut batch = materialized.ready;
        batch.extend(materialized.derived);
        let written = self.writer.write(batch).await;

        let deletes: Vec<QueuedEvent> = written
            .succeeded
            .iter()
            .filter(|e| e.action == IngestAction::Delete)
            .cloned()
            .collect();
        if !deletes.is_empty() {
            match self.materializer.purge(&deletes).await {
                Ok(purged) => debug!(purged, "Purged deleted rows"),
                // Rows stay soft-deleted; a redelivered delete purges them
                Err(e) => warn!(error = %e, "Purge after delete failed"),
            }
        }

        outcome.merge(written);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::tests::{tantivy_writer, UnreachableEngine};
    use chrono::Utc;
    use explorer_relational::{connect_in_memory, MaterializerConfig};
    use explorer_types::{NewEvent, QueueToken, FOLDER_TYPE};
    use serde_json::json;
    use std::sync::Arc;

    fn queued(new: NewEvent, row: i64) -> QueuedEvent {
        QueuedEvent::from_new(new, QueueToken::Row(row), Utc::now())
    }

    async fn ingester(writer: IndexWriter) -> RelationalIngester {
        let pool = connect_in_memory().await.unwrap();
        RelationalIngester::new(Materializer::new(pool, MaterializerConfig::default()), writer)
    }

    #[tokio::test]
    async fn test_two_phase_ingest_enriches_documents() {
        let writer = tantivy_writer();
        let engine = writer.engine().clone();
        let ingester = ingester(writer).await;

        let outcome = ingester
            .ingest(vec![
                queued(
                    NewEvent::new("home", "drive", FOLDER_TYPE, IngestAction::Upsert, 1)
                        .with_field("name", json!("Home")),
                    1,
                ),
                queued(
                    NewEvent::new("doc", "drive", "file", IngestAction::Upsert, 1)
                        .with_field("creatorId", json!("alice"))
                        .with_field("links", json!([{"folderId": "home", "userId": "alice"}])),
                    2,
                ),
            ])
            .await;
        assert_eq!(outcome.succeeded.len(), 2, "{:?}", outcome.failed);

        let doc_id = outcome.succeeded[1].predictable_id.unwrap().to_string();
        let folder_id = outcome.succeeded[0].predictable_id.unwrap();
        let stored = engine.get("drive", &doc_id).await.unwrap().unwrap();
        assert_eq!(stored.source["folderIds"], json!([folder_id]));
        assert_eq!(stored.source["visibleBy"], json!(["creator:alice"]));

        let folder = engine.get("folder", &folder_id.to_string()).await.unwrap().unwrap();
        assert_eq!(folder.source["ancestors"], json!([0]));
    }

    #[tokio::test]
    async fn test_materialization_failure_skips_index_write() {
        let writer = tantivy_writer();
        let engine = writer.engine().clone();
        let ingester = ingester(writer).await;

        let outcome = ingester
            .ingest(vec![queued(
                NewEvent::new("orphan", "drive", FOLDER_TYPE, IngestAction::Upsert, 1)
                    .with_field("parentId", json!("nowhere")),
                1,
            )])
            .await;
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(engine.count("folder").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let writer = tantivy_writer();
        let engine = writer.engine().clone();
        let ingester = ingester(writer).await;

        ingester
            .ingest(vec![queued(NewEvent::new("d", "drive", "file", IngestAction::Upsert, 1), 1)])
            .await;
        let delete = queued(NewEvent::new("d", "drive", "file", IngestAction::Delete, 2), 2);

        let first = ingester.ingest(vec![delete.clone()]).await;
        let second = ingester.ingest(vec![delete]).await;
        assert_eq!(first.succeeded.len(), 1);
        assert_eq!(second.succeeded.len(), 1);
        assert_eq!(engine.count("drive").await.unwrap(), 0);

        let (rows,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM resources")
            .fetch_one(ingester.materializer().pool())
            .await
            .unwrap();
        assert_eq!(rows, 0);
    }

    #[tokio::test]
    async fn test_transport_failure_keeps_relational_rows() {
        let ingester = ingester(IndexWriter::new(Arc::new(UnreachableEngine))).await;
        let outcome = ingester
            .ingest(vec![queued(NewEvent::new("x", "drive", "file", IngestAction::Upsert, 1), 1)])
            .await;
        assert_eq!(outcome.failed.len(), 1);

        // Redelivery after the outage resolves to the same row id
        let retry = ingester
            .ingest(vec![queued(NewEvent::new("x", "drive", "file", IngestAction::Upsert, 1), 1)])
            .await;
        assert_eq!(retry.failed[0].predictable_id, outcome.failed[0].predictable_id);
    }

    #[tokio::test]
    async fn test_index_only_ingester_uses_unique_ids() {
        let writer = tantivy_writer();
        let engine = writer.engine().clone();
        let ingester: Box<dyn MessageIngester> = Box::new(IndexOnlyIngester::new(writer));

        let outcome = ingester
            .ingest(vec![queued(NewEvent::new("x", "blog", "post", IngestAction::Upsert, 1), 1)])
            .await;
        assert_eq!(outcome.succeeded.len(), 1);
        assert!(engine.get("blog", "x:blog:post").await.unwrap().is_some());
    }
}
