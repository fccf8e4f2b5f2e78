//! Mapping between stored explorer documents and Tantivy documents.

use serde_json::{Map, Value};
use tantivy::schema::Value as _;
use tantivy::{doc, TantivyDocument};

use crate::error::SearchError;
use crate::merge::{sub_deleted, SUB_RESOURCES_FIELD};
use crate::schema::SearchSchema;

/// Source field holding visibility tags.
pub const VISIBLE_BY_FIELD: &str = "visibleBy";

/// Primary key of a document.
pub fn document_key(index: &str, id: &str) -> String {
    format!("{}/{}", index, id)
}

/// A document as the engine stores it.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub index: String,
    pub id: String,
    pub version: i64,
    pub source: Map<String, Value>,
}

impl StoredDocument {
    pub fn new(index: impl Into<String>, id: impl Into<String>, version: i64) -> Self {
        Self {
            index: index.into(),
            id: id.into(),
            version,
            source: Map::new(),
        }
    }

    pub fn key(&self) -> String {
        document_key(&self.index, &self.id)
    }

    pub fn visible_by(&self) -> Vec<String> {
        match self.source.get(VISIBLE_BY_FIELD) {
            Some(Value::Array(tags)) => tags
                .iter()
                .filter_map(|t| t.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Sub-resources without their tombstones.
    pub fn live_sub_resources(&self) -> Vec<Value> {
        match self.source.get(SUB_RESOURCES_FIELD) {
            Some(Value::Array(entries)) => entries.iter().filter(|e| !sub_deleted(e)).cloned().collect(),
            _ => Vec::new(),
        }
    }

    pub fn to_tantivy(&self, schema: &SearchSchema) -> Result<TantivyDocument, SearchError> {
        let source = serde_json::to_string(&self.source)?;
        let mut document = doc!(
            schema.doc_key => self.key(),
            schema.index_name => self.index.clone(),
            schema.doc_id => self.id.clone(),
            schema.version => self.version,
            schema.source => source,
            schema.text => searchable_text(&self.source)
        );
        for tag in self.visible_by() {
            document.add_text(schema.visible_by, tag);
        }
        Ok(document)
    }

    pub fn from_tantivy(schema: &SearchSchema, document: &TantivyDocument) -> Result<Self, SearchError> {
        let text = |field| {
            document
                .get_first(field)
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_default()
        };
        let version = document
            .get_first(schema.version)
            .and_then(|v| v.as_i64())
            .unwrap_or_default();
        let raw = text(schema.source);
        let source = if raw.is_empty() {
            Map::new()
        } else {
            serde_json::from_str(&raw)?
        };

        Ok(Self {
            index: text(schema.index_name),
            id: text(schema.doc_id),
            version,
            source,
        })
    }
}

/// Top-level string values joined for full-text indexing.
fn searchable_text(source: &Map<String, Value>) -> String {
    source
        .values()
        .filter_map(|v| v.as_str())
        .collect::<Vec<_>>()
        .join(" ")
}
