//! Scheduling for the explorer-index ingestion pipeline.
//!
//! # Components
//!
//! - [`IngestionScheduler`]: actor that drains a [`QueueReader`] through the
//!   ingestion cycle, one cycle at a time
//! - [`FailureEscalation`]: ordered handlers for events that exhausted their
//!   attempts ([`CountingHandler`], [`ReindexTrigger`])
//! - [`MaintenanceScheduler`]: cron jobs for queue upkeep with overlap
//!   prevention and a [`JobRegistry`]
//!
//! # Example
//!
//! ```ignore
//! use explorer_scheduler::{IngestionConfig, IngestionPipeline, IngestionScheduler};
//!
//! let pipeline = IngestionPipeline::new(reader, ingester).with_escalation(escalation);
//! let scheduler = IngestionScheduler::new(pipeline, IngestionConfig::from(&settings.ingest));
//! scheduler.start().await?;
//!
//! let metrics = scheduler.trigger().await?;
//! println!("{} pending", metrics.ingest.pending);
//! ```
//!
//! [`QueueReader`]: explorer_indexing::QueueReader

mod config;
mod error;
mod escalation;
mod ingestion;
pub mod jobs;
mod maintenance;
mod overlap;
mod registry;

pub use config::{IngestionConfig, MaintenanceConfig};
pub use error::SchedulerError;
pub use escalation::{
    CountingHandler, FailureEscalation, FailureHandler, HttpReindexClient, ReindexClient,
    ReindexTrigger,
};
pub use ingestion::{
    IngestMetrics, IngestionPipeline, IngestionScheduler, SchedulerMetrics, SchedulerState,
    SchedulerStatus,
};
pub use maintenance::{validate_cron_expression, MaintenanceScheduler};
pub use overlap::{OverlapGuard, RunGuard};
pub use registry::{JobRegistry, JobResult, JobStatus};
