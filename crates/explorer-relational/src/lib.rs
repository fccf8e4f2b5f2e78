//! Relational half of the explorer pipeline.
//!
//! Provides SQLite-backed storage through sqlx:
//! - Connection pool setup and schema bootstrap
//! - The polling queue table with its failure-cause audit trail
//! - Folder hierarchy resolution (ancestors, descendants, direct relations)
//! - Materialization of queued events into folder/resource rows, with
//!   enrichment of each event before it reaches the search index

pub mod error;
pub mod hierarchy;
pub mod materializer;
pub mod pool;
pub mod queue;
pub mod schema;

pub use error::RelationalError;
pub use hierarchy::{FolderRelations, HierarchyResolver};
pub use materializer::{Materialized, Materializer, MaterializerConfig};
pub use pool::{connect_in_memory, RelationalConfig};
pub use queue::{QueueCause, QueueTable, ReportSummary};
pub use schema::migrate;
