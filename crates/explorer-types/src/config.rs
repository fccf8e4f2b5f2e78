//! Configuration loading for explorer-index.
//!
//! Layered config: defaults -> config file -> env vars -> CLI flags.
//! The default config file lives at ~/.config/explorer-index/config.toml.

use std::collections::HashMap;
use std::path::PathBuf;

use config::{Config, Environment, File};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::ExplorerError;

/// Queue backend feeding the scheduler.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReaderKind {
    /// Durable priority streams with consumer groups (default)
    #[default]
    Stream,
    /// Relational queue table polled by sharded workers
    Polling,
}

/// How queued events for the same resource are combined before ingestion.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Every event is ingested on its own
    #[default]
    None,
    /// Events are collapsed per resource unique id
    Collapse,
}

/// Ingestion cycle tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestSettings {
    /// Maximum events fetched per cycle
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Attempts after which an event is dropped and escalated
    #[serde(default = "default_max_attempt")]
    pub max_attempt: u32,

    /// Upper bound between two cycles when the queue looks idle
    #[serde(default = "default_max_idle_delay_ms")]
    pub max_idle_delay_ms: u64,

    /// Resources linked into trashed folders are left out of folder membership
    #[serde(default = "default_exclude_trashed")]
    pub exclude_trashed_folders: bool,

    #[serde(default)]
    pub merge_strategy: MergeStrategy,
}

fn default_batch_size() -> usize {
    100
}

fn default_max_attempt() -> u32 {
    5
}

fn default_max_idle_delay_ms() -> u64 {
    30_000
}

fn default_exclude_trashed() -> bool {
    true
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_attempt: default_max_attempt(),
            max_idle_delay_ms: default_max_idle_delay_ms(),
            exclude_trashed_folders: default_exclude_trashed(),
            merge_strategy: MergeStrategy::default(),
        }
    }
}

/// Sharding of the polling queue across workers (`id % worker_count`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingSettings {
    #[serde(default)]
    pub worker_index: u32,

    #[serde(default = "default_worker_count")]
    pub worker_count: u32,
}

fn default_worker_count() -> u32 {
    1
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            worker_index: 0,
            worker_count: default_worker_count(),
        }
    }
}

/// Consumer group settings for the stream backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSettings {
    #[serde(default = "default_group")]
    pub group: String,

    #[serde(default = "default_consumer")]
    pub consumer: String,

    /// Pending entries idle for longer than this are re-delivered
    #[serde(default = "default_reclaim_idle_secs")]
    pub reclaim_idle_secs: u64,
}

fn default_group() -> String {
    "explorer".to_string()
}

fn default_consumer() -> String {
    "explorer-1".to_string()
}

fn default_reclaim_idle_secs() -> u64 {
    300
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            group: default_group(),
            consumer: default_consumer(),
            reclaim_idle_secs: default_reclaim_idle_secs(),
        }
    }
}

/// Permanent-failure escalation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationSettings {
    /// Flush a pending reindex group after this long without new arrivals
    #[serde(default = "default_quiet_period_ms")]
    pub quiet_period_ms: u64,

    /// Flush a pending reindex group immediately once it grows past this size
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,

    /// Reindex endpoints keyed by `application:resourceType` or `application`
    #[serde(default)]
    pub endpoints: HashMap<String, String>,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_quiet_period_ms() -> u64 {
    5_000
}

fn default_max_pending() -> usize {
    500
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

impl Default for EscalationSettings {
    fn default() -> Self {
        Self {
            quiet_period_ms: default_quiet_period_ms(),
            max_pending: default_max_pending(),
            endpoints: HashMap::new(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl EscalationSettings {
    /// Endpoint for a resource kind, preferring the most specific key.
    pub fn endpoint_for(&self, application: &str, resource_type: &str) -> Option<&str> {
        self.endpoints
            .get(&format!("{}:{}", application, resource_type))
            .or_else(|| self.endpoints.get(application))
            .map(String::as_str)
    }
}

/// Cron-driven queue maintenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceSettings {
    /// Re-deliver stream entries stuck in the pending list
    #[serde(default = "default_reclaim_cron")]
    pub reclaim_cron: String,

    /// Delete completed rows from the relational queue
    #[serde(default = "default_purge_cron")]
    pub purge_cron: String,

    #[serde(default = "default_timezone")]
    pub timezone: String,

    #[serde(default = "default_completed_retention_hours")]
    pub completed_retention_hours: u64,
}

fn default_reclaim_cron() -> String {
    "0 */5 * * * *".to_string()
}

fn default_purge_cron() -> String {
    "0 0 3 * * *".to_string()
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_completed_retention_hours() -> u64 {
    24
}

impl Default for MaintenanceSettings {
    fn default() -> Self {
        Self {
            reclaim_cron: default_reclaim_cron(),
            purge_cron: default_purge_cron(),
            timezone: default_timezone(),
            completed_retention_hours: default_completed_retention_hours(),
        }
    }
}

/// Main application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub reader: ReaderKind,

    /// Path to the RocksDB stream directory
    #[serde(default = "default_stream_path")]
    pub stream_path: String,

    /// Path to the SQLite database file
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Path to the Tantivy index directory
    #[serde(default = "default_search_index_path")]
    pub search_index_path: String,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub ingest: IngestSettings,

    #[serde(default)]
    pub polling: PollingSettings,

    #[serde(default)]
    pub stream: StreamSettings,

    #[serde(default)]
    pub escalation: EscalationSettings,

    #[serde(default)]
    pub maintenance: MaintenanceSettings,
}

fn data_dir(leaf: &str) -> String {
    ProjectDirs::from("", "", "explorer-index")
        .map(|p| p.data_local_dir().join(leaf))
        .unwrap_or_else(|| PathBuf::from("./data").join(leaf))
        .to_string_lossy()
        .to_string()
}

fn default_stream_path() -> String {
    data_dir("streams")
}

fn default_database_path() -> String {
    data_dir("explorer.db")
}

fn default_search_index_path() -> String {
    data_dir("search-index")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            reader: ReaderKind::default(),
            stream_path: default_stream_path(),
            database_path: default_database_path(),
            search_index_path: default_search_index_path(),
            log_level: default_log_level(),
            ingest: IngestSettings::default(),
            polling: PollingSettings::default(),
            stream: StreamSettings::default(),
            escalation: EscalationSettings::default(),
            maintenance: MaintenanceSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings from all sources.
    ///
    /// Precedence (lowest to highest):
    /// 1. Built-in defaults
    /// 2. ~/.config/explorer-index/config.toml
    /// 3. CLI-specified config file
    /// 4. Environment variables (EXPLORER_*, nested keys joined by `__`)
    pub fn load(cli_config_path: Option<&str>) -> Result<Self, ExplorerError> {
        let config_dir = ProjectDirs::from("", "", "explorer-index")
            .map(|p| p.config_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));

        let default_config_path = config_dir.join("config");

        let mut builder = Config::builder()
            .set_default("stream_path", default_stream_path())
            .map_err(|e| ExplorerError::Config(e.to_string()))?
            .set_default("database_path", default_database_path())
            .map_err(|e| ExplorerError::Config(e.to_string()))?
            .set_default("search_index_path", default_search_index_path())
            .map_err(|e| ExplorerError::Config(e.to_string()))?
            .set_default("log_level", default_log_level())
            .map_err(|e| ExplorerError::Config(e.to_string()))?
            .add_source(File::with_name(&default_config_path.to_string_lossy()).required(false));

        if let Some(path) = cli_config_path {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        // Format: EXPLORER_LOG_LEVEL, EXPLORER_INGEST__BATCH_SIZE, ...
        builder = builder.add_source(
            Environment::with_prefix("EXPLORER")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder
            .build()
            .map_err(|e| ExplorerError::Config(e.to_string()))?;

        let settings: Settings = config
            .try_deserialize()
            .map_err(|e| ExplorerError::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<(), ExplorerError> {
        if self.ingest.batch_size == 0 {
            return Err(ExplorerError::Config("ingest.batch_size must be > 0".into()));
        }
        if self.ingest.max_attempt == 0 {
            return Err(ExplorerError::Config("ingest.max_attempt must be > 0".into()));
        }
        if self.polling.worker_count == 0 {
            return Err(ExplorerError::Config("polling.worker_count must be > 0".into()));
        }
        if self.polling.worker_index >= self.polling.worker_count {
            return Err(ExplorerError::Config(format!(
                "polling.worker_index {} out of range for {} workers",
                self.polling.worker_index, self.polling.worker_count
            )));
        }
        Ok(())
    }
}
