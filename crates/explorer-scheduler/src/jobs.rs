//! Queue maintenance jobs.
//!
//! - **stream_reclaim**: re-delivers stream entries another consumer claimed
//!   and then abandoned
//! - **queue_purge**: deletes relational queue rows that succeeded longer
//!   ago than the retention period

use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{info, warn};

use explorer_indexing::StreamQueueReader;
use explorer_relational::QueueTable;
use explorer_types::MaintenanceSettings;

use crate::{MaintenanceScheduler, SchedulerError};

pub const RECLAIM_JOB: &str = "stream_reclaim";
pub const PURGE_JOB: &str = "queue_purge";

/// Register the idle-entry reclaim job.
///
/// The job only flags the reader and wakes its listeners; the claim itself
/// happens in the next fetch so it never races a running cycle.
pub async fn create_reclaim_job(
    scheduler: &MaintenanceScheduler,
    reader: Arc<StreamQueueReader>,
    settings: &MaintenanceSettings,
) -> Result<(), SchedulerError> {
    scheduler
        .register_job(
            RECLAIM_JOB,
            &settings.reclaim_cron,
            Some(&settings.timezone),
            move || {
                let reader = reader.clone();
                async move {
                    reader.request_reclaim();
                    Ok("reclaim requested".to_string())
                }
            },
        )
        .await?;

    info!("Registered stream reclaim job");
    Ok(())
}

/// Register the completed-row purge job.
pub async fn create_purge_job(
    scheduler: &MaintenanceScheduler,
    table: QueueTable,
    settings: &MaintenanceSettings,
) -> Result<(), SchedulerError> {
    let retention_hours = settings.completed_retention_hours;
    scheduler
        .register_job(PURGE_JOB, &settings.purge_cron, Some(&settings.timezone), move || {
            let table = table.clone();
            async move { run_purge(&table, retention_hours).await }
        })
        .await?;

    info!(retention_hours, "Registered queue purge job");
    Ok(())
}

async fn run_purge(table: &QueueTable, retention_hours: u64) -> Result<String, String> {
    let cutoff = i64::try_from(retention_hours)
        .ok()
        .and_then(Duration::try_hours)
        .and_then(|retention| Utc::now().checked_sub_signed(retention));
    let Some(cutoff) = cutoff else {
        // No row can be older than that
        warn!(retention_hours, "Retention outside the representable time range; skipping purge");
        return Ok("purged 0 rows".to_string());
    };
    table
        .purge_completed(cutoff)
        .await
        .map(|deleted| format!("purged {} rows", deleted))
        .map_err(|e| format!("Purge failed: {}", e))
}
