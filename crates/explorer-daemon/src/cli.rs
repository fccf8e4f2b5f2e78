//! CLI argument parsing for the explorer daemon.
//!
//! CLI flags override every other configuration source.

use clap::{Parser, Subcommand, ValueEnum};

use explorer_types::{IngestAction, ReaderKind};

/// Explorer index ingestion daemon
#[derive(Parser, Debug)]
#[command(name = "explorer-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to config file (overrides ~/.config/explorer-index/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Set log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Queue backend selectable on the command line.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReaderArg {
    Stream,
    Polling,
}

impl From<ReaderArg> for ReaderKind {
    fn from(arg: ReaderArg) -> Self {
        match arg {
            ReaderArg::Stream => ReaderKind::Stream,
            ReaderArg::Polling => ReaderKind::Polling,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActionArg {
    Upsert,
    Delete,
    Audience,
}

impl From<ActionArg> for IngestAction {
    fn from(arg: ActionArg) -> Self {
        match arg {
            ActionArg::Upsert => IngestAction::Upsert,
            ActionArg::Delete => IngestAction::Delete,
            ActionArg::Audience => IngestAction::Audience,
        }
    }
}

/// Path and backend overrides shared by every command.
#[derive(clap::Args, Debug, Default, Clone)]
pub struct StoreArgs {
    /// Queue backend
    #[arg(long, value_enum)]
    pub reader: Option<ReaderArg>,

    /// Override the SQLite database path
    #[arg(long)]
    pub db_path: Option<String>,

    /// Override the Tantivy index directory
    #[arg(long)]
    pub index_path: Option<String>,

    /// Override the RocksDB stream directory
    #[arg(long)]
    pub stream_path: Option<String>,
}

/// Daemon commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the ingestion scheduler until interrupted
    Start {
        #[command(flatten)]
        stores: StoreArgs,
    },

    /// Publish one producer event to the queue
    Enqueue {
        /// Resource id in the owning application
        resource_id: String,

        /// Owning application
        #[arg(short, long)]
        application: String,

        /// Resource type ("folder" for folders)
        #[arg(short = 't', long)]
        resource_type: String,

        #[arg(long, value_enum, default_value = "upsert")]
        action: ActionArg,

        /// Per-resource version
        #[arg(long, default_value_t = 1)]
        resource_version: i64,

        /// Payload as a JSON object
        #[arg(long)]
        payload: Option<String>,

        /// Event comes from a search-triggered flow
        #[arg(long)]
        for_search: bool,

        #[command(flatten)]
        stores: StoreArgs,
    },

    /// Show queue depths
    Status {
        #[command(flatten)]
        stores: StoreArgs,
    },
}
