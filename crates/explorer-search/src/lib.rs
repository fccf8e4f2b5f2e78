//! # explorer-search
//!
//! Search document store for explorer-index, embedded with Tantivy.
//!
//! Documents live in named logical indexes (`folder` for folders, the owning
//! application for resources) and are addressed by `index/id`. The full
//! `_source` JSON is stored so every write can be applied as a
//! read-modify-write under the writer lock:
//!
//! - upserts only overwrite top-level fields when the incoming version is
//!   strictly greater than the stored one
//! - `subResources` entries merge one by one on their own versions; deletes
//!   stay as tombstones in `_source` and are hidden by
//!   [`StoredDocument::live_sub_resources`]
//! - rights-derived fields (`rights`, `visibleBy`, `creatorId`) follow the
//!   document version gate
//! - audience updates and parent refreshes patch fields without a gate
//!
//! A bulk call is one commit; per-item outcomes use HTTP-like statuses.

pub mod document;
pub mod engine;
pub mod error;
pub mod index;
pub mod merge;
pub mod schema;

pub use document::{document_key, StoredDocument};
pub use engine::{BulkItemResponse, BulkOperation, SearchEngine, TantivyEngine};
pub use error::SearchError;
pub use index::{SearchIndex, SearchIndexConfig};
pub use merge::{merge_sub_resources, AUDIENCE_FIELD, SUB_RESOURCES_FIELD};
pub use schema::{build_document_schema, SearchSchema};
