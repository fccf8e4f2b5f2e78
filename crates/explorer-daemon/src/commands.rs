//! Command implementations for the explorer daemon.
//!
//! Handles:
//! - start: Load config, open stores, run the ingestion scheduler
//! - enqueue: Publish one producer event
//! - status: Print queue depths

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use tokio::signal;
use tracing::{error, info, warn};

use explorer_indexing::{
    merger_for, EventPublisher, IndexWriter, PollingQueueReader, QueueReader, RelationalIngester,
    StreamPublisher, StreamQueueReader,
};
use explorer_relational::{Materializer, MaterializerConfig, QueueTable, RelationalConfig};
use explorer_scheduler::jobs::{create_purge_job, create_reclaim_job};
use explorer_scheduler::{
    CountingHandler, FailureEscalation, HttpReindexClient, IngestionConfig, IngestionPipeline,
    IngestionScheduler, MaintenanceConfig, MaintenanceScheduler, ReindexTrigger,
};
use explorer_search::{SearchIndex, SearchIndexConfig, TantivyEngine};
use explorer_storage::StreamStore;
use explorer_types::{IngestAction, NewEvent, QueueToken, ReaderKind, Settings};

use crate::cli::StoreArgs;

/// Load settings and apply CLI overrides (highest precedence).
pub fn load_settings(
    config_path: Option<&str>,
    stores: &StoreArgs,
    log_level_override: Option<&str>,
) -> Result<Settings> {
    let mut settings = Settings::load(config_path).context("Failed to load configuration")?;
    apply_overrides(&mut settings, stores, log_level_override);
    Ok(settings)
}

fn apply_overrides(settings: &mut Settings, stores: &StoreArgs, log_level_override: Option<&str>) {
    if let Some(reader) = stores.reader {
        settings.reader = reader.into();
    }
    if let Some(db_path) = &stores.db_path {
        settings.database_path = db_path.clone();
    }
    if let Some(index_path) = &stores.index_path {
        settings.search_index_path = index_path.clone();
    }
    if let Some(stream_path) = &stores.stream_path {
        settings.stream_path = stream_path.clone();
    }
    if let Some(log_level) = log_level_override {
        settings.log_level = log_level.to_string();
    }
}

fn init_logging(log_level: &str) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")
}

fn ensure_parent(path: &str) -> Result<()> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }
    }
    Ok(())
}

fn open_stream_store(settings: &Settings) -> Result<Arc<StreamStore>> {
    fs::create_dir_all(&settings.stream_path).context("Failed to create stream directory")?;
    let store = StreamStore::open(Path::new(&settings.stream_path)).with_context(|| {
        format!(
            "Failed to open stream store at {} (is the daemon already running?)",
            settings.stream_path
        )
    })?;
    Ok(Arc::new(store))
}

async fn open_queue_table(settings: &Settings) -> Result<QueueTable> {
    ensure_parent(&settings.database_path)?;
    let pool = RelationalConfig::with_database_path(&settings.database_path)
        .connect()
        .await
        .context("Failed to open relational store")?;
    Ok(QueueTable::new(pool))
}

/// Running pipeline assembled from settings.
pub struct Daemon {
    pub scheduler: IngestionScheduler,
    pub maintenance: MaintenanceScheduler,
    pub escalated: Arc<CountingHandler>,
}

impl Daemon {
    /// Open every store and wire the pipeline. Nothing runs until
    /// [`Daemon::start`].
    pub async fn build(settings: &Settings) -> Result<Self> {
        let table = open_queue_table(settings).await?;

        fs::create_dir_all(&settings.search_index_path)
            .context("Failed to create search index directory")?;
        let index = SearchIndex::open_or_create(SearchIndexConfig::new(&settings.search_index_path))
            .context("Failed to open search index")?;
        let engine = TantivyEngine::new(&index).context("Failed to create search engine")?;

        let materializer = Materializer::new(
            table.pool().clone(),
            MaterializerConfig::default()
                .with_exclude_trashed_folders(settings.ingest.exclude_trashed_folders),
        );
        let ingester = RelationalIngester::new(materializer, IndexWriter::new(Arc::new(engine)));

        let escalated = Arc::new(CountingHandler::new());
        let reindex_client = HttpReindexClient::new(settings.escalation.clone())
            .context("Failed to build reindex client")?;
        let escalation = FailureEscalation::new()
            .with_handler(escalated.clone())
            .with_handler(Arc::new(ReindexTrigger::from_settings(
                Arc::new(reindex_client),
                &settings.escalation,
            )));

        let maintenance = MaintenanceScheduler::new(MaintenanceConfig::from(&settings.maintenance))
            .await
            .context("Failed to create maintenance scheduler")?;

        let reader: Arc<dyn QueueReader> = match settings.reader {
            ReaderKind::Stream => {
                let store = open_stream_store(settings)?;
                let reclaim_idle_ms =
                    i64::try_from(settings.stream.reclaim_idle_secs.saturating_mul(1000))
                        .unwrap_or(i64::MAX);
                let reader = Arc::new(
                    StreamQueueReader::new(
                        store,
                        settings.stream.group.clone(),
                        settings.stream.consumer.clone(),
                    )
                    .with_reclaim_idle_ms(reclaim_idle_ms),
                );
                create_reclaim_job(&maintenance, reader.clone(), &settings.maintenance).await?;
                reader
            }
            ReaderKind::Polling => {
                create_purge_job(&maintenance, table.clone(), &settings.maintenance).await?;
                Arc::new(
                    PollingQueueReader::new(table)
                        .with_shard(settings.polling.worker_index, settings.polling.worker_count),
                )
            }
        };

        let pipeline = IngestionPipeline::new(reader, Arc::new(ingester))
            .with_merger(merger_for(settings.ingest.merge_strategy))
            .with_escalation(escalation);
        let scheduler = IngestionScheduler::new(pipeline, IngestionConfig::from(&settings.ingest));

        Ok(Self {
            scheduler,
            maintenance,
            escalated,
        })
    }

    pub async fn start(&self) -> Result<()> {
        self.maintenance
            .start()
            .await
            .context("Failed to start maintenance scheduler")?;
        self.scheduler
            .start()
            .await
            .context("Failed to start ingestion scheduler")?;
        Ok(())
    }

    /// Stop ingestion first so no cycle outlives the maintenance jobs.
    pub async fn shutdown(mut self) -> Result<()> {
        self.scheduler
            .stop()
            .await
            .context("Failed to stop ingestion scheduler")?;
        if let Err(e) = self.maintenance.shutdown().await {
            warn!(error = %e, "Maintenance scheduler shutdown failed");
        }
        if let Ok(metrics) = self.scheduler.metrics().await {
            info!(
                cycles = metrics.ingest.cycles,
                succeeded = metrics.ingest.succeeded,
                failed = metrics.ingest.failed,
                dropped = metrics.ingest.dropped,
                "Final ingestion metrics"
            );
        }
        Ok(())
    }
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        }
    }
}

/// Start the ingestion daemon.
///
/// 1. Load configuration (defaults -> file -> env -> CLI)
/// 2. Open the queue, relational and search stores
/// 3. Start the ingestion and maintenance schedulers
/// 4. Stop both on SIGINT/SIGTERM
pub async fn start_daemon(
    config_path: Option<&str>,
    stores: &StoreArgs,
    log_level_override: Option<&str>,
) -> Result<()> {
    let settings = load_settings(config_path, stores, log_level_override)?;
    init_logging(&settings.log_level)?;

    info!("Explorer daemon starting...");
    info!("Configuration:");
    info!("  Reader: {:?}", settings.reader);
    info!("  Database path: {}", settings.database_path);
    info!("  Search index path: {}", settings.search_index_path);
    if settings.reader == ReaderKind::Stream {
        info!("  Stream path: {}", settings.stream_path);
    }
    info!("  Batch size: {}", settings.ingest.batch_size);
    info!("  Log level: {}", settings.log_level);

    let daemon = Daemon::build(&settings).await?;
    daemon.start().await?;

    shutdown_signal().await;

    let escalated = daemon.escalated.total();
    daemon.shutdown().await?;
    info!(escalated, "Explorer daemon stopped");
    Ok(())
}

/// Event fields collected from the command line.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub resource_id: String,
    pub application: String,
    pub resource_type: String,
    pub action: IngestAction,
    pub version: i64,
    pub payload: Option<String>,
    pub for_search: bool,
}

impl EnqueueRequest {
    fn into_event(self) -> Result<NewEvent> {
        let payload = match self.payload.as_deref() {
            Some(raw) => parse_payload(raw)?,
            None => Map::new(),
        };
        Ok(NewEvent::new(
            self.resource_id,
            self.application,
            self.resource_type,
            self.action,
            self.version,
        )
        .with_payload(payload)
        .for_search(self.for_search))
    }
}

fn parse_payload(raw: &str) -> Result<Map<String, Value>> {
    match serde_json::from_str::<Value>(raw).context("Payload is not valid JSON")? {
        Value::Object(map) => Ok(map),
        other => anyhow::bail!("Payload must be a JSON object, got {}", other),
    }
}

/// Publish one event with the publisher matching the configured reader.
pub async fn publish_event(settings: &Settings, request: EnqueueRequest) -> Result<QueueToken> {
    let event = request.into_event()?;
    let publisher: Box<dyn EventPublisher> = match settings.reader {
        ReaderKind::Stream => Box::new(StreamPublisher::new(open_stream_store(settings)?)),
        ReaderKind::Polling => Box::new(open_queue_table(settings).await?),
    };
    publisher
        .publish(event)
        .await
        .context("Failed to publish event")
}

/// `enqueue` command entry point.
pub async fn enqueue_event(
    config_path: Option<&str>,
    stores: &StoreArgs,
    request: EnqueueRequest,
) -> Result<()> {
    let settings = load_settings(config_path, stores, None)?;
    match publish_event(&settings, request).await? {
        QueueToken::Stream { stream, seq } => println!("Enqueued on stream '{}' at {}", stream, seq),
        QueueToken::Row(id) => println!("Enqueued as queue row {}", id),
        QueueToken::Derived => println!("Enqueued"),
    }
    Ok(())
}

/// Queue depths for the configured reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueStatus {
    Stream {
        group: String,
        lengths: Vec<(String, u64)>,
        pending: u64,
    },
    Polling {
        worker_index: u32,
        worker_count: u32,
        pending: u64,
    },
}

pub async fn queue_status(settings: &Settings) -> Result<QueueStatus> {
    match settings.reader {
        ReaderKind::Stream => {
            let store = open_stream_store(settings)?;
            let stats = store
                .stats(&settings.stream.group)
                .context("Failed to read stream stats")?;
            Ok(QueueStatus::Stream {
                group: settings.stream.group.clone(),
                lengths: stats.lengths.into_iter().collect(),
                pending: stats.pending,
            })
        }
        ReaderKind::Polling => {
            let table = open_queue_table(settings).await?;
            let pending = table
                .pending_count(settings.polling.worker_index, settings.polling.worker_count)
                .await
                .context("Failed to count pending rows")?;
            Ok(QueueStatus::Polling {
                worker_index: settings.polling.worker_index,
                worker_count: settings.polling.worker_count,
                pending,
            })
        }
    }
}

/// `status` command entry point.
pub async fn show_status(config_path: Option<&str>, stores: &StoreArgs) -> Result<()> {
    let settings = load_settings(config_path, stores, None)?;
    match queue_status(&settings).await? {
        QueueStatus::Stream {
            group,
            lengths,
            pending,
        } => {
            println!("Stream queue at {}", settings.stream_path);
            for (stream, len) in lengths {
                println!("  {:<10} {}", stream, len);
            }
            println!("  Unacknowledged for group '{}': {}", group, pending);
        }
        QueueStatus::Polling {
            worker_index,
            worker_count,
            pending,
        } => {
            println!("Relational queue at {}", settings.database_path);
            println!(
                "  Pending rows for shard {}/{}: {}",
                worker_index, worker_count, pending
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::ReaderArg;
    use tempfile::TempDir;

    fn temp_settings(dir: &TempDir, reader: ReaderKind) -> Settings {
        let path = |leaf: &str| dir.path().join(leaf).to_string_lossy().to_string();
        Settings {
            reader,
            stream_path: path("streams"),
            database_path: path("explorer.db"),
            search_index_path: path("index"),
            ..Default::default()
        }
    }

    fn request(id: &str) -> EnqueueRequest {
        EnqueueRequest {
            resource_id: id.to_string(),
            application: "drive".to_string(),
            resource_type: "file".to_string(),
            action: IngestAction::Upsert,
            version: 1,
            payload: Some(r#"{"name": "report.pdf"}"#.to_string()),
            for_search: false,
        }
    }

    #[test]
    fn test_overrides_take_precedence() {
        let mut settings = Settings::default();
        let stores = StoreArgs {
            reader: Some(ReaderArg::Polling),
            db_path: Some("/tmp/override.db".to_string()),
            ..Default::default()
        };
        apply_overrides(&mut settings, &stores, Some("debug"));

        assert_eq!(settings.reader, ReaderKind::Polling);
        assert_eq!(settings.database_path, "/tmp/override.db");
        assert_eq!(settings.log_level, "debug");
    }

    #[test]
    fn test_parse_payload() {
        let map = parse_payload(r#"{"creatorId": "alice"}"#).unwrap();
        assert_eq!(map["creatorId"], "alice");
        assert!(parse_payload("[1, 2]").is_err());
        assert!(parse_payload("not json").is_err());
    }

    #[tokio::test]
    async fn test_polling_enqueue_and_status() {
        let dir = TempDir::new().unwrap();
        let settings = temp_settings(&dir, ReaderKind::Polling);

        let token = publish_event(&settings, request("1")).await.unwrap();
        assert!(matches!(token, QueueToken::Row(_)));

        let status = queue_status(&settings).await.unwrap();
        assert_eq!(
            status,
            QueueStatus::Polling {
                worker_index: 0,
                worker_count: 1,
                pending: 1
            }
        );
    }

    #[tokio::test]
    async fn test_stream_enqueue_and_status() {
        let dir = TempDir::new().unwrap();
        let settings = temp_settings(&dir, ReaderKind::Stream);

        let mut delete = request("9");
        delete.action = IngestAction::Delete;
        delete.payload = None;
        let token = publish_event(&settings, delete).await.unwrap();
        assert!(matches!(token, QueueToken::Stream { ref stream, .. } if stream == "medium"));

        match queue_status(&settings).await.unwrap() {
            QueueStatus::Stream { lengths, pending, .. } => {
                assert!(lengths.contains(&("medium".to_string(), 1)));
                assert_eq!(pending, 0);
            }
            other => panic!("unexpected status {:?}", other),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_daemon_ingests_published_events() {
        let dir = TempDir::new().unwrap();
        let settings = temp_settings(&dir, ReaderKind::Polling);

        publish_event(&settings, request("1")).await.unwrap();
        publish_event(&settings, request("2")).await.unwrap();

        let daemon = Daemon::build(&settings).await.unwrap();
        daemon.start().await.unwrap();
        let metrics = daemon.scheduler.trigger().await.unwrap();
        assert_eq!(metrics.ingest.succeeded, 2);

        daemon.shutdown().await.unwrap();
        let status = queue_status(&settings).await.unwrap();
        assert!(matches!(status, QueueStatus::Polling { pending: 0, .. }));
    }
}
