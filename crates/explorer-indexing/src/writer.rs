//! Index writer: one bulk call per cycle.
//!
//! Each enriched event becomes exactly one bulk operation. Derived parent
//! refreshes ride along as field patches but never appear in the returned
//! outcome, since they have no queue position to report.

use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use explorer_search::{BulkItemResponse, BulkOperation, SearchEngine};
use explorer_types::{IngestAction, IngestionOutcome, QueuedEvent, FOLDER_TYPE};

/// Writes enriched events to a [`SearchEngine`].
#[derive(Clone)]
pub struct IndexWriter {
    engine: Arc<dyn SearchEngine>,
}

impl IndexWriter {
    pub fn new(engine: Arc<dyn SearchEngine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<dyn SearchEngine> {
        &self.engine
    }

    /// Logical index of an event: folders share one, resources go to their
    /// application's.
    pub fn index_name(event: &QueuedEvent) -> String {
        if event.is_folder() {
            FOLDER_TYPE.to_string()
        } else {
            event.application.clone()
        }
    }

    /// Document id: the materialized row id when known.
    pub fn document_id(event: &QueuedEvent) -> String {
        match event.predictable_id {
            Some(id) => id.to_string(),
            None => event.unique_id().to_string(),
        }
    }

    fn document_fields(event: &QueuedEvent) -> Map<String, Value> {
        let mut fields = event.payload.clone();
        fields.insert("resourceId".into(), json!(event.resource_id));
        fields.insert("application".into(), json!(event.application));
        fields.insert("resourceType".into(), json!(event.resource_type));
        fields.insert("resourceUniqueId".into(), json!(event.unique_id().to_string()));
        fields
    }

    pub fn to_operation(event: &QueuedEvent) -> BulkOperation {
        let index = Self::index_name(event);
        let id = Self::document_id(event);

        if event.queue_token.is_derived() {
            return BulkOperation::PatchFields {
                index,
                id,
                fields: event.overrides.clone(),
            };
        }
        match event.action {
            IngestAction::Delete => BulkOperation::Delete { index, id },
            IngestAction::Upsert => BulkOperation::Upsert {
                index,
                id,
                version: event.version,
                fields: Self::document_fields(event),
                overrides: event.overrides.clone(),
            },
            IngestAction::Audience => BulkOperation::Audience {
                index,
                id,
                fields: event.payload.clone(),
            },
        }
    }

    fn succeeded(event: &QueuedEvent, response: &BulkItemResponse) -> bool {
        response.is_success() || (event.action == IngestAction::Delete && response.is_not_found())
    }

    /// Write a batch and classify each event.
    pub async fn write(&self, events: Vec<QueuedEvent>) -> IngestionOutcome {
        if events.is_empty() {
            return IngestionOutcome::new();
        }
        let operations: Vec<BulkOperation> = events.iter().map(Self::to_operation).collect();

        let responses = match self.engine.bulk(operations).await {
            Ok(responses) if responses.len() == events.len() => responses,
            Ok(responses) => {
                let error = format!(
                    "bulk response has {} items for {} operations",
                    responses.len(),
                    events.len()
                );
                return Self::transport_failure(events, &error);
            }
            Err(e) => return Self::transport_failure(events, &e.to_string()),
        };

        let mut outcome = IngestionOutcome::new();
        for (mut event, response) in events.into_iter().zip(responses) {
            let ok = Self::succeeded(&event, &response);
            if event.queue_token.is_derived() {
                if !ok {
                    debug!(
                        id = %response.id,
                        status = response.status,
                        "Parent refresh not applied"
                    );
                }
                continue;
            }
            if ok {
                outcome.succeeded.push(event);
            } else {
                let reason = response
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("status {}", response.status));
                event.fail(reason, Some(format!("status {}", response.status)));
                outcome.failed.push(event);
            }
        }

        debug!(
            succeeded = outcome.succeeded.len(),
            failed = outcome.failed.len(),
            "Index write complete"
        );
        outcome
    }

    fn transport_failure(events: Vec<QueuedEvent>, error: &str) -> IngestionOutcome {
        warn!(error, count = events.len(), "Bulk write failed as a whole");
        let reported: Vec<QueuedEvent> = events
            .into_iter()
            .filter(|e| !e.queue_token.is_derived())
            .collect();
        IngestionOutcome::all_failed(reported, error)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use explorer_search::{SearchError, SearchIndex, StoredDocument, TantivyEngine};
    use explorer_types::{NewEvent, QueueToken};
    use chrono::Utc;

    /// Engine whose every bulk call fails.
    pub(crate) struct UnreachableEngine;

    #[async_trait]
    impl SearchEngine for UnreachableEngine {
        async fn bulk(&self, _: Vec<BulkOperation>) -> Result<Vec<BulkItemResponse>, SearchError> {
            Err(SearchError::IndexLocked("connection refused".into()))
        }

        async fn get(&self, _: &str, _: &str) -> Result<Option<StoredDocument>, SearchError> {
            Ok(None)
        }

        async fn count(&self, _: &str) -> Result<usize, SearchError> {
            Ok(0)
        }
    }

    pub(crate) fn tantivy_writer() -> IndexWriter {
        let engine = TantivyEngine::new(&SearchIndex::in_ram().unwrap()).unwrap();
        IndexWriter::new(Arc::new(engine))
    }

    fn queued(id: &str, action: IngestAction, version: i64) -> QueuedEvent {
        let mut event = QueuedEvent::from_new(
            NewEvent::new(id, "drive", "file", action, version),
            QueueToken::Row(version),
            Utc::now(),
        );
        event.payload.insert("title".into(), json!(format!("v{}", version)));
        event
    }

    #[test]
    fn test_operation_mapping() {
        let mut folder = queued("f", IngestAction::Upsert, 1);
        folder.resource_type = FOLDER_TYPE.into();
        folder.predictable_id = Some(9);
        assert!(matches!(
            IndexWriter::to_operation(&folder),
            BulkOperation::Upsert { ref index, ref id, .. } if index == "folder" && id == "9"
        ));

        let delete = queued("r", IngestAction::Delete, 1);
        assert_eq!(
            IndexWriter::to_operation(&delete),
            BulkOperation::Delete {
                index: "drive".into(),
                id: "r:drive:file".into()
            }
        );

        let mut derived = folder.clone();
        derived.queue_token = QueueToken::Derived;
        assert!(matches!(IndexWriter::to_operation(&derived), BulkOperation::PatchFields { .. }));
    }

    #[tokio::test]
    async fn test_delete_of_missing_document_succeeds() {
        let writer = tantivy_writer();
        let outcome = writer.write(vec![queued("gone", IngestAction::Delete, 1)]).await;
        assert_eq!(outcome.succeeded.len(), 1);
        assert!(outcome.failed.is_empty());
    }

    #[tokio::test]
    async fn test_rejected_item_fails_alone() {
        let writer = tantivy_writer();
        let outcome = writer
            .write(vec![
                queued("missing", IngestAction::Audience, 1),
                queued("ok", IngestAction::Upsert, 1),
            ])
            .await;
        assert_eq!(outcome.succeeded.len(), 1);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].error.as_deref(), Some("document_missing"));
        assert_eq!(outcome.failed[0].error_detail.as_deref(), Some("status 404"));
    }

    #[tokio::test]
    async fn test_transport_failure_fails_every_reported_item() {
        let writer = IndexWriter::new(Arc::new(UnreachableEngine));
        let mut derived = queued("p", IngestAction::Upsert, 1);
        derived.queue_token = QueueToken::Derived;

        let outcome = writer
            .write(vec![
                queued("a", IngestAction::Upsert, 1),
                queued("b", IngestAction::Delete, 1),
                derived,
            ])
            .await;
        assert!(outcome.succeeded.is_empty());
        assert_eq!(outcome.failed.len(), 2);
        assert!(outcome.failed[0]
            .error
            .as_deref()
            .unwrap()
            .contains("connection refused"));
    }

    #[tokio::test]
    async fn test_version_monotonic_across_writes() {
        let writer = tantivy_writer();
        for version in [3, 1, 2] {
            writer.write(vec![queued("doc", IngestAction::Upsert, version)]).await;
        }
        let stored = writer
            .engine()
            .get("drive", "doc:drive:file")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.version, 3);
        assert_eq!(stored.source["title"], json!("v3"));
    }
}
