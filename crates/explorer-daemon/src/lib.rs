//! Explorer daemon library exports.
//!
//! This crate provides the daemon binary for the explorer ingestion pipeline.
//!
//! # Modules
//!
//! - `cli`: Command-line argument parsing with clap
//! - `commands`: Command implementations (start, enqueue, status)

pub mod cli;
pub mod commands;

pub use cli::{ActionArg, Cli, Commands, ReaderArg, StoreArgs};
pub use commands::{
    enqueue_event, load_settings, publish_event, queue_status, show_status, start_daemon, Daemon,
    EnqueueRequest, QueueStatus,
};
