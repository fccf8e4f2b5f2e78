//! Tantivy schema for explorer documents.
//!
//! Every document carries its logical index, its id and the stored JSON
//! source. `doc_key` (`index/id`) is the single-term primary key used for
//! replace and delete.

use tantivy::schema::{Field, Schema, INDEXED, STORED, STRING, TEXT};

use crate::SearchError;

/// Schema field handles for efficient access
#[derive(Debug, Clone)]
pub struct SearchSchema {
    schema: Schema,
    /// Primary key `index/id` (STRING | STORED)
    pub doc_key: Field,
    /// Logical index: "folder" or the owning application (STRING | STORED)
    pub index_name: Field,
    /// Document id within the index (STRING | STORED)
    pub doc_id: Field,
    /// Stored document version (i64, INDEXED | STORED)
    pub version: Field,
    /// Full JSON source (STORED)
    pub source: Field,
    /// Searchable text taken from top-level string fields (TEXT)
    pub text: Field,
    /// Visibility tags such as `creator:alice` (STRING | STORED, multi-valued)
    pub visible_by: Field,
}

impl SearchSchema {
    /// Get the underlying Tantivy schema
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Create a SearchSchema from an existing Tantivy Schema
    pub fn from_schema(schema: Schema) -> Result<Self, SearchError> {
        let field = |name: &str| {
            schema
                .get_field(name)
                .map_err(|_| SearchError::SchemaMismatch(format!("missing {} field", name)))
        };

        Ok(Self {
            doc_key: field("doc_key")?,
            index_name: field("index_name")?,
            doc_id: field("doc_id")?,
            version: field("version")?,
            source: field("source")?,
            text: field("text")?,
            visible_by: field("visible_by")?,
            schema,
        })
    }
}

/// Build the explorer document schema.
pub fn build_document_schema() -> SearchSchema {
    let mut schema_builder = Schema::builder();

    let doc_key = schema_builder.add_text_field("doc_key", STRING | STORED);
    let index_name = schema_builder.add_text_field("index_name", STRING | STORED);
    let doc_id = schema_builder.add_text_field("doc_id", STRING | STORED);
    let version = schema_builder.add_i64_field("version", INDEXED | STORED);
    let source = schema_builder.add_text_field("source", STORED);
    let text = schema_builder.add_text_field("text", TEXT);
    let visible_by = schema_builder.add_text_field("visible_by", STRING | STORED);

    let schema = schema_builder.build();

    SearchSchema {
        schema,
        doc_key,
        index_name,
        doc_id,
        version,
        source,
        text,
        visible_by,
    }
}
