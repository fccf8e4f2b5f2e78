//! SQLite connection pool configuration.
//!
//! WAL mode with a busy timeout so the polling reader, producers and the
//! materializer can share one database file.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use tracing::info;

use crate::error::RelationalError;
use crate::schema::migrate;

/// Configuration for the SQLite connection pool
#[derive(Debug, Clone)]
pub struct RelationalConfig {
    /// Database file path
    pub database_path: String,

    /// Maximum number of connections in pool
    pub max_connections: u32,

    /// Time to wait when the database is locked
    pub busy_timeout: Duration,

    /// Time to wait for a free pooled connection
    pub acquire_timeout: Duration,
}

impl Default for RelationalConfig {
    fn default() -> Self {
        Self {
            database_path: "explorer.db".to_string(),
            max_connections: 4,
            busy_timeout: Duration::from_secs(30),
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

impl RelationalConfig {
    /// Create configuration with custom database path
    pub fn with_database_path<P: AsRef<Path>>(path: P) -> Self {
        Self {
            database_path: path.as_ref().to_string_lossy().to_string(),
            ..Self::default()
        }
    }

    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// Build SQLite connection options from configuration
    pub fn build_connection_options(&self) -> Result<SqliteConnectOptions, RelationalError> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", self.database_path))?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .create_if_missing(true)
            .busy_timeout(self.busy_timeout);
        Ok(options)
    }

    /// Create the pool and bring the schema up to date.
    pub async fn connect(&self) -> Result<SqlitePool, RelationalError> {
        info!(path = %self.database_path, "Opening relational store");

        let pool = SqlitePoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(self.acquire_timeout)
            .connect_with(self.build_connection_options()?)
            .await?;

        migrate(&pool).await?;
        Ok(pool)
    }
}

/// Single-connection in-memory pool with the schema applied.
///
/// Every query must go through the pool's only connection, so callers must
/// not hold a transaction while querying the pool directly.
pub async fn connect_in_memory() -> Result<SqlitePool, RelationalError> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    migrate(&pool).await?;
    Ok(pool)
}
