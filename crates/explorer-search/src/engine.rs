//! Bulk document engine.
//!
//! A bulk call stages every operation against the last committed state plus
//! whatever earlier operations in the same call produced, then writes the
//! final state of each touched document and commits once. The writer lock
//! is held for the whole call, so concurrent bulk calls serialize and the
//! version gate decides the outcome regardless of arrival order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tantivy::collector::{Count, TopDocs};
use tantivy::query::TermQuery;
use tantivy::schema::IndexRecordOption;
use tantivy::{IndexReader, IndexWriter, Searcher, TantivyDocument, Term};
use tracing::{debug, info, warn};

use crate::document::{document_key, StoredDocument};
use crate::error::SearchError;
use crate::index::SearchIndex;
use crate::merge::{apply_audience, apply_patch, apply_upsert};
use crate::schema::SearchSchema;

/// One operation of a bulk write.
#[derive(Debug, Clone, PartialEq)]
pub enum BulkOperation {
    /// Delete by id
    Delete { index: String, id: String },
    /// Version-gated merge with always-applied overrides
    Upsert {
        index: String,
        id: String,
        version: i64,
        fields: Map<String, Value>,
        overrides: Map<String, Value>,
    },
    /// Replace the audience sub-document of an existing document
    Audience {
        index: String,
        id: String,
        fields: Map<String, Value>,
    },
    /// Overwrite fields of an existing document, no version check
    PatchFields {
        index: String,
        id: String,
        fields: Map<String, Value>,
    },
}

impl BulkOperation {
    pub fn index(&self) -> &str {
        match self {
            BulkOperation::Delete { index, .. }
            | BulkOperation::Upsert { index, .. }
            | BulkOperation::Audience { index, .. }
            | BulkOperation::PatchFields { index, .. } => index,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            BulkOperation::Delete { id, .. }
            | BulkOperation::Upsert { id, .. }
            | BulkOperation::Audience { id, .. }
            | BulkOperation::PatchFields { id, .. } => id,
        }
    }

    pub fn key(&self) -> String {
        document_key(self.index(), self.id())
    }
}

/// Per-item result of a bulk write, in request order.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkItemResponse {
    pub index: String,
    pub id: String,
    /// 200 updated/deleted, 201 created, 404 not found, 500 engine failure
    pub status: u16,
    pub error: Option<String>,
}

impl BulkItemResponse {
    fn ok(op: &BulkOperation, status: u16) -> Self {
        Self {
            index: op.index().to_string(),
            id: op.id().to_string(),
            status,
            error: None,
        }
    }

    fn failed(op: &BulkOperation, status: u16, error: impl Into<String>) -> Self {
        Self {
            index: op.index().to_string(),
            id: op.id().to_string(),
            status,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_not_found(&self) -> bool {
        self.status == 404
    }
}

/// Document engine the index writer talks to.
#[async_trait]
pub trait SearchEngine: Send + Sync {
    /// Apply all operations in one write.
    ///
    /// `Err` means the call as a whole failed and no item is known to be
    /// applied.
    async fn bulk(&self, operations: Vec<BulkOperation>) -> Result<Vec<BulkItemResponse>, SearchError>;

    /// Fetch a committed document.
    async fn get(&self, index: &str, id: &str) -> Result<Option<StoredDocument>, SearchError>;

    /// Number of committed documents in a logical index.
    async fn count(&self, index: &str) -> Result<usize, SearchError>;
}

/// Embedded engine backed by a Tantivy index.
#[derive(Clone)]
pub struct TantivyEngine {
    writer: Arc<Mutex<IndexWriter>>,
    reader: IndexReader,
    schema: SearchSchema,
}

/// Staged state of a document: `Some(None)` is a pending delete.
type Staged = HashMap<String, Option<StoredDocument>>;

impl TantivyEngine {
    pub fn new(index: &SearchIndex) -> Result<Self, SearchError> {
        Ok(Self {
            writer: Arc::new(Mutex::new(index.writer()?)),
            reader: index.reader()?,
            schema: index.schema().clone(),
        })
    }

    fn lookup(&self, searcher: &Searcher, key: &str) -> Result<Option<StoredDocument>, SearchError> {
        let term = Term::from_field_text(self.schema.doc_key, key);
        let query = TermQuery::new(term, IndexRecordOption::Basic);
        let top_docs = searcher.search(&query, &TopDocs::with_limit(1))?;

        match top_docs.first() {
            Some((_, address)) => {
                let document: TantivyDocument = searcher.doc(*address)?;
                Ok(Some(StoredDocument::from_tantivy(&self.schema, &document)?))
            }
            None => Ok(None),
        }
    }

    /// Compute the response for one operation and its new staged state.
    fn stage(
        op: &BulkOperation,
        current: Option<StoredDocument>,
    ) -> (BulkItemResponse, Option<Option<StoredDocument>>) {
        match op {
            BulkOperation::Delete { .. } => match current {
                Some(_) => (BulkItemResponse::ok(op, 200), Some(None)),
                None => (BulkItemResponse::failed(op, 404, "not_found"), None),
            },
            BulkOperation::Upsert {
                index,
                id,
                version,
                fields,
                overrides,
            } => {
                let (document, created) = apply_upsert(current, index, id, *version, fields, overrides);
                let status = if created { 201 } else { 200 };
                (BulkItemResponse::ok(op, status), Some(Some(document)))
            }
            BulkOperation::Audience { fields, .. } => match current {
                Some(document) => (
                    BulkItemResponse::ok(op, 200),
                    Some(Some(apply_audience(document, fields))),
                ),
                None => (BulkItemResponse::failed(op, 404, "document_missing"), None),
            },
            BulkOperation::PatchFields { fields, .. } => match current {
                Some(document) => (
                    BulkItemResponse::ok(op, 200),
                    Some(Some(apply_patch(document, fields))),
                ),
                None => (BulkItemResponse::failed(op, 404, "document_missing"), None),
            },
        }
    }

    fn write_staged(&self, writer: &mut IndexWriter, staged: &Staged) -> Result<u64, SearchError> {
        for (key, document) in staged {
            writer.delete_term(Term::from_field_text(self.schema.doc_key, key));
            if let Some(document) = document {
                writer.add_document(document.to_tantivy(&self.schema)?)?;
            }
        }
        Ok(writer.commit()?)
    }

    fn bulk_blocking(&self, operations: Vec<BulkOperation>) -> Result<Vec<BulkItemResponse>, SearchError> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|e| SearchError::IndexLocked(e.to_string()))?;
        let searcher = self.reader.searcher();

        let mut staged: Staged = HashMap::new();
        let mut responses = Vec::with_capacity(operations.len());

        for op in &operations {
            let key = op.key();
            let current = match staged.get(&key) {
                Some(document) => document.clone(),
                None => match self.lookup(&searcher, &key) {
                    Ok(document) => document,
                    Err(e) => {
                        warn!(key = %key, error = %e, "Document lookup failed");
                        responses.push(BulkItemResponse::failed(op, 500, e.to_string()));
                        continue;
                    }
                },
            };

            let (response, next) = Self::stage(op, current);
            if let Some(next) = next {
                staged.insert(key, next);
            }
            responses.push(response);
        }

        if !staged.is_empty() {
            match self.write_staged(&mut writer, &staged) {
                Ok(opstamp) => {
                    debug!(opstamp, documents = staged.len(), "Committed bulk write");
                }
                Err(e) => {
                    if let Err(rollback) = writer.rollback() {
                        warn!(error = %rollback, "Rollback after failed bulk write failed");
                    }
                    return Err(e);
                }
            }
            drop(writer);
            self.reader.reload()?;
        }

        info!(
            operations = operations.len(),
            failed = responses.iter().filter(|r| !r.is_success()).count(),
            "Bulk write complete"
        );
        Ok(responses)
    }

    fn count_blocking(&self, index: &str) -> Result<usize, SearchError> {
        let searcher = self.reader.searcher();
        let term = Term::from_field_text(self.schema.index_name, index);
        let query = TermQuery::new(term, IndexRecordOption::Basic);
        Ok(searcher.search(&query, &Count)?)
    }
}

#[async_trait]
impl SearchEngine for TantivyEngine {
    async fn bulk(&self, operations: Vec<BulkOperation>) -> Result<Vec<BulkItemResponse>, SearchError> {
        if operations.is_empty() {
            return Ok(Vec::new());
        }
        let engine = self.clone();
        tokio::task::spawn_blocking(move || engine.bulk_blocking(operations))
            .await
            .map_err(|e| SearchError::Task(e.to_string()))?
    }

    async fn get(&self, index: &str, id: &str) -> Result<Option<StoredDocument>, SearchError> {
        let engine = self.clone();
        let key = document_key(index, id);
        tokio::task::spawn_blocking(move || {
            let searcher = engine.reader.searcher();
            engine.lookup(&searcher, &key)
        })
        .await
        .map_err(|e| SearchError::Task(e.to_string()))?
    }

    async fn count(&self, index: &str) -> Result<usize, SearchError> {
        let engine = self.clone();
        let index = index.to_string();
        tokio::task::spawn_blocking(move || engine.count_blocking(&index))
            .await
            .map_err(|e| SearchError::Task(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn engine() -> TantivyEngine {
        TantivyEngine::new(&SearchIndex::in_ram().unwrap()).unwrap()
    }

    fn upsert(id: &str, version: i64, name: &str) -> BulkOperation {
        BulkOperation::Upsert {
            index: "drive".into(),
            id: id.into(),
            version,
            fields: json!({ "name": name }).as_object().cloned().unwrap(),
            overrides: Map::new(),
        }
    }

    fn delete(id: &str) -> BulkOperation {
        BulkOperation::Delete {
            index: "drive".into(),
            id: id.into(),
        }
    }

    #[tokio::test]
    async fn test_upsert_then_update() {
        let engine = engine();
        let first = engine.bulk(vec![upsert("1", 1, "draft")]).await.unwrap();
        assert_eq!(first[0].status, 201);

        let second = engine.bulk(vec![upsert("1", 2, "final")]).await.unwrap();
        assert_eq!(second[0].status, 200);

        let stored = engine.get("drive", "1").await.unwrap().unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(stored.source["name"], json!("final"));
        assert_eq!(engine.count("drive").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_out_of_order_versions_within_one_batch() {
        let engine = engine();
        engine
            .bulk(vec![upsert("1", 3, "three"), upsert("1", 1, "one"), upsert("1", 2, "two")])
            .await
            .unwrap();

        let stored = engine.get("drive", "1").await.unwrap().unwrap();
        assert_eq!(stored.version, 3);
        assert_eq!(stored.source["name"], json!("three"));
        assert_eq!(engine.count("drive").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let engine = engine();
        engine.bulk(vec![upsert("1", 1, "x")]).await.unwrap();

        let responses = engine.bulk(vec![delete("1"), delete("1"), delete("2")]).await.unwrap();
        let statuses: Vec<u16> = responses.iter().map(|r| r.status).collect();
        assert_eq!(statuses, vec![200, 404, 404]);
        assert!(responses[1].is_not_found());
        assert!(engine.get("drive", "1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_audience_and_patch_need_existing_document() {
        let engine = engine();
        let audience = BulkOperation::Audience {
            index: "drive".into(),
            id: "1".into(),
            fields: json!({"audience": {"likes": 2}}).as_object().cloned().unwrap(),
        };
        let missing = engine.bulk(vec![audience.clone()]).await.unwrap();
        assert_eq!(missing[0].status, 404);
        assert_eq!(missing[0].error.as_deref(), Some("document_missing"));

        engine.bulk(vec![upsert("1", 1, "x")]).await.unwrap();
        let patch = BulkOperation::PatchFields {
            index: "drive".into(),
            id: "1".into(),
            fields: json!({"childrenIds": [7]}).as_object().cloned().unwrap(),
        };
        let responses = engine.bulk(vec![audience, patch]).await.unwrap();
        assert!(responses.iter().all(BulkItemResponse::is_success));

        let stored = engine.get("drive", "1").await.unwrap().unwrap();
        assert_eq!(stored.source["audience"], json!({"likes": 2}));
        assert_eq!(stored.source["childrenIds"], json!([7]));
        assert_eq!(stored.version, 1);
    }

    #[tokio::test]
    async fn test_indexes_are_separate() {
        let engine = engine();
        let folder = BulkOperation::Upsert {
            index: "folder".into(),
            id: "1".into(),
            version: 1,
            fields: Map::new(),
            overrides: Map::new(),
        };
        engine.bulk(vec![upsert("1", 1, "file"), folder]).await.unwrap();
        assert_eq!(engine.count("drive").await.unwrap(), 1);
        assert_eq!(engine.count("folder").await.unwrap(), 1);
        assert!(engine.get("folder", "2").await.unwrap().is_none());
    }
}
