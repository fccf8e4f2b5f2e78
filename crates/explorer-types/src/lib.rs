//! # explorer-types
//!
//! Shared domain types for the explorer ingestion pipeline.
//!
//! This crate defines the data structures passed between pipeline stages:
//! - Events: queued units of work with action, priority and attempt tracking
//! - Outcomes: per-cycle success/failure partitions
//! - Merge results: deduplicated batches plus their grouping
//! - Settings: layered configuration
//!
//! ## Usage
//!
//! ```rust
//! use explorer_types::{IngestAction, NewEvent, Priority};
//!
//! let event = NewEvent::new("42", "blog", "post", IngestAction::Upsert, 1);
//! assert_eq!(event.priority(), Priority::Medium);
//! ```

pub mod config;
pub mod error;
pub mod event;
pub mod outcome;

pub use config::{
    EscalationSettings, IngestSettings, MaintenanceSettings, MergeStrategy, PollingSettings,
    ReaderKind, Settings, StreamSettings,
};
pub use error::ExplorerError;
pub use event::{
    IngestAction, NewEvent, Priority, QueueToken, QueuedEvent, ResourceUniqueId, FOLDER_TYPE,
    ROOT_FOLDER_ID,
};
pub use outcome::{IngestionOutcome, MergeResult};
