//! Ingestion pipeline for explorer-index.
//!
//! This crate turns queued events into search documents.
//!
//! ## Key Components
//!
//! - [`QueueReader`]: pending work and outcome reporting, over priority
//!   streams ([`StreamQueueReader`]) or the relational queue table
//!   ([`PollingQueueReader`])
//! - [`EventPublisher`]: producers for either backend
//! - [`MessageMerger`]: optional reduction of a batch before ingestion
//! - [`IndexWriter`]: one version-gated bulk write per cycle
//! - [`MessageIngester`]: materialize-then-index ([`RelationalIngester`]) or
//!   index only ([`IndexOnlyIngester`])
//!
//! ## Cycle
//!
//! 1. Fetch a batch from the reader
//! 2. Merge it
//! 3. Ingest the merged events
//! 4. Expand the outcome back to every fetched event and report it

pub mod error;
pub mod ingester;
pub mod merger;
pub mod producer;
pub mod reader;
pub mod writer;

pub use error::IndexingError;
pub use ingester::{IndexOnlyIngester, MessageIngester, RelationalIngester};
pub use merger::{expand_outcome, merger_for, CollapsingMerger, MessageMerger, NoopMerger};
pub use producer::{EventPublisher, StreamPublisher};
pub use reader::{
    ListenerSet, NewItemCallback, OutcomeReport, PollingQueueReader, QueueReader, ReaderMetrics, ReaderStatus,
    StreamQueueReader, Subscription,
};
pub use writer::IndexWriter;
