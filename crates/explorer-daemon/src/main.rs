//! Explorer Index Daemon
//!
//! Drains queued resource events into the relational store and the
//! search index.
//!
//! # Usage
//!
//! ```bash
//! explorer-daemon start [--reader stream|polling] [--db-path PATH] [--index-path PATH]
//! explorer-daemon enqueue RESOURCE_ID -a APP -t TYPE [--action upsert|delete|audience]
//! explorer-daemon status
//! ```
//!
//! # Configuration
//!
//! Configuration is loaded in order (later sources override earlier):
//! 1. Built-in defaults
//! 2. Config file (~/.config/explorer-index/config.toml)
//! 3. Environment variables (EXPLORER_*)
//! 4. CLI flags

use anyhow::Result;
use clap::Parser;

use explorer_daemon::{enqueue_event, show_status, start_daemon, Cli, Commands, EnqueueRequest};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start { stores } => {
            start_daemon(cli.config.as_deref(), &stores, cli.log_level.as_deref()).await?;
        }
        Commands::Enqueue {
            resource_id,
            application,
            resource_type,
            action,
            resource_version,
            payload,
            for_search,
            stores,
        } => {
            let request = EnqueueRequest {
                resource_id,
                application,
                resource_type,
                action: action.into(),
                version: resource_version,
                payload,
                for_search,
            };
            enqueue_event(cli.config.as_deref(), &stores, request).await?;
        }
        Commands::Status { stores } => {
            show_status(cli.config.as_deref(), &stores).await?;
        }
    }

    Ok(())
}
