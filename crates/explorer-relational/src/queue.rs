//! Relational queue table.
//!
//! Rows stay `pending` until an ingestion succeeds, then flip to `success`
//! and are purged later by maintenance. Every failed attempt appends a row
//! to `explorer_queue_causes`; a row whose attempts are exhausted is deleted
//! and its last cause is flagged `dropped`.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::{Row, SqlitePool};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use explorer_types::{
    IngestAction, IngestionOutcome, NewEvent, Priority, QueueToken, QueuedEvent,
};

use crate::error::RelationalError;

/// Capacity of the change notification channel. Lagging listeners only
/// lose wake-ups, never rows.
const NOTIFY_CAPACITY: usize = 64;

/// What `report` did with an outcome.
#[derive(Debug, Clone, Default)]
pub struct ReportSummary {
    pub acknowledged: usize,
    pub requeued: usize,
    /// Events whose attempts are exhausted; removed from the queue
    pub dropped: Vec<QueuedEvent>,
}

/// One recorded failure of a queued row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueCause {
    pub attempt: i64,
    pub cause: String,
    pub detail: Option<String>,
    pub dropped: bool,
}

/// Data access for `explorer_queue`.
#[derive(Clone)]
pub struct QueueTable {
    pool: SqlitePool,
    notifier: broadcast::Sender<i64>,
}

impl QueueTable {
    pub fn new(pool: SqlitePool) -> Self {
        let (notifier, _) = broadcast::channel(NOTIFY_CAPACITY);
        Self { pool, notifier }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Listen for newly enqueued row ids.
    pub fn subscribe(&self) -> broadcast::Receiver<i64> {
        self.notifier.subscribe()
    }

    /// Insert a producer event and notify listeners.
    pub async fn enqueue(&self, event: &NewEvent) -> Result<i64, RelationalError> {
        let now_ms = Utc::now().timestamp_millis();
        let payload = serde_json::to_string(&event.payload)?;

        let result = sqlx::query(
            r#"
            INSERT INTO explorer_queue (
                resource_id, application, resource_type, action, priority,
                version, payload, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
            "#,
        )
        .bind(&event.resource_id)
        .bind(&event.application)
        .bind(&event.resource_type)
        .bind(event.action.as_str())
        .bind(event.priority().rank())
        .bind(event.version)
        .bind(payload)
        .bind(now_ms)
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        debug!(id, resource_id = %event.resource_id, action = event.action.as_str(), "Enqueued event");
        // No listener is fine; the next poll picks the row up
        let _ = self.notifier.send(id);
        Ok(id)
    }

    /// Pending rows of one shard, highest priority first, oldest first.
    pub async fn fetch_pending(
        &self,
        max: usize,
        max_attempt: u32,
        worker_index: u32,
        worker_count: u32,
    ) -> Result<Vec<QueuedEvent>, RelationalError> {
        let rows = sqlx::query(
            r#"
            SELECT id, resource_id, application, resource_type, action, priority,
                   version, payload, attempted_count, created_at
            FROM explorer_queue
            WHERE attempt_status = 'pending'
              AND attempted_count < ?1
              AND (id % ?2) = ?3
            ORDER BY priority DESC, created_at ASC, id ASC
            LIMIT ?4
            "#,
        )
        .bind(i64::from(max_attempt))
        .bind(i64::from(worker_count.max(1)))
        .bind(i64::from(worker_index))
        .bind(max as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            events.push(row_to_event(&row)?);
        }
        Ok(events)
    }

    /// Commit an ingestion outcome.
    ///
    /// Runs in one transaction: a crash before commit leaves every row
    /// pending with its previous attempt count.
    pub async fn report(
        &self,
        outcome: &IngestionOutcome,
        max_attempt: u32,
    ) -> Result<ReportSummary, RelationalError> {
        let now_ms = Utc::now().timestamp_millis();
        let mut summary = ReportSummary::default();
        let mut tx = self.pool.begin().await?;

        for event in &outcome.succeeded {
            let QueueToken::Row(id) = event.queue_token else {
                continue;
            };
            let result = sqlx::query(
                "UPDATE explorer_queue SET attempt_status = 'success', updated_at = ?1 WHERE id = ?2",
            )
            .bind(now_ms)
            .bind(id)
            .execute(&mut *tx)
            .await?;
            summary.acknowledged += result.rows_affected() as usize;
        }

        for event in &outcome.failed {
            let QueueToken::Row(id) = event.queue_token else {
                continue;
            };
            let row = sqlx::query("SELECT attempted_count FROM explorer_queue WHERE id = ?1")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
            let Some(row) = row else {
                warn!(id, "Failed row vanished before report");
                continue;
            };
            let attempted: i64 = row.try_get("attempted_count")?;
            let attempt = attempted + 1;
            let exhausted = attempt >= i64::from(max_attempt);

            sqlx::query(
                r#"
                INSERT INTO explorer_queue_causes (queue_id, attempt, cause, detail, dropped, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
            )
            .bind(id)
            .bind(attempt)
            .bind(event.error.as_deref().unwrap_or("unknown error"))
            .bind(event.error_detail.as_deref())
            .bind(exhausted)
            .bind(now_ms)
            .execute(&mut *tx)
            .await?;

            if exhausted {
                sqlx::query("DELETE FROM explorer_queue WHERE id = ?1")
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                let mut dropped = event.clone();
                dropped.attempt_count = attempt as u32;
                summary.dropped.push(dropped);
            } else {
                sqlx::query(
                    "UPDATE explorer_queue SET attempted_count = ?1, updated_at = ?2 WHERE id = ?3",
                )
                .bind(attempt)
                .bind(now_ms)
                .bind(id)
                .execute(&mut *tx)
                .await?;
                summary.requeued += 1;
            }
        }

        tx.commit().await?;

        if !summary.dropped.is_empty() {
            warn!(
                dropped = summary.dropped.len(),
                max_attempt, "Queue rows exhausted their attempts"
            );
        }
        debug!(
            acknowledged = summary.acknowledged,
            requeued = summary.requeued,
            "Reported outcome to queue table"
        );
        Ok(summary)
    }

    /// Pending rows in one shard.
    pub async fn pending_count(
        &self,
        worker_index: u32,
        worker_count: u32,
    ) -> Result<u64, RelationalError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS n FROM explorer_queue
            WHERE attempt_status = 'pending' AND (id % ?1) = ?2
            "#,
        )
        .bind(i64::from(worker_count.max(1)))
        .bind(i64::from(worker_index))
        .fetch_one(&self.pool)
        .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n.max(0) as u64)
    }

    /// Delete completed rows last updated before `older_than`.
    pub async fn purge_completed(&self, older_than: DateTime<Utc>) -> Result<u64, RelationalError> {
        let result = sqlx::query(
            "DELETE FROM explorer_queue WHERE attempt_status = 'success' AND updated_at < ?1",
        )
        .bind(older_than.timestamp_millis())
        .execute(&self.pool)
        .await?;

        let deleted = result.rows_affected();
        if deleted > 0 {
            info!(deleted, "Purged completed queue rows");
        }
        Ok(deleted)
    }

    /// Failure history of a queue row, oldest first.
    pub async fn causes_for(&self, queue_id: i64) -> Result<Vec<QueueCause>, RelationalError> {
        let rows = sqlx::query(
            r#"
            SELECT attempt, cause, detail, dropped FROM explorer_queue_causes
            WHERE queue_id = ?1 ORDER BY id ASC
            "#,
        )
        .bind(queue_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<QueueCause, RelationalError> {
                Ok(QueueCause {
                    attempt: row.try_get("attempt")?,
                    cause: row.try_get("cause")?,
                    detail: row.try_get("detail")?,
                    dropped: row.try_get("dropped")?,
                })
            })
            .collect()
    }
}

fn row_to_event(row: &sqlx::sqlite::SqliteRow) -> Result<QueuedEvent, RelationalError> {
    let id: i64 = row.try_get("id")?;
    let action: String = row.try_get("action")?;
    let action: IngestAction = action
        .parse()
        .map_err(|e: explorer_types::ExplorerError| RelationalError::InvalidPayload(e.to_string()))?;
    let payload_text: String = row.try_get("payload")?;
    let (payload, rejected) = match serde_json::from_str::<Value>(&payload_text) {
        Ok(Value::Object(map)) => (map, None),
        Ok(_) => (Map::new(), Some("Payload is not a JSON object".to_string())),
        Err(e) => (Map::new(), Some(format!("Payload is not valid JSON: {}", e))),
    };
    if let Some(reason) = &rejected {
        warn!(id, reason = %reason, "Rejecting queue row");
    }
    let created_at_ms: i64 = row.try_get("created_at")?;
    let attempted: i64 = row.try_get("attempted_count")?;

    Ok(QueuedEvent {
        resource_id: row.try_get("resource_id")?,
        application: row.try_get("application")?,
        resource_type: row.try_get("resource_type")?,
        action,
        priority: Priority::from_rank(row.try_get("priority")?),
        payload,
        queue_token: QueueToken::Row(id),
        attempt_count: attempted.max(0) as u32,
        version: row.try_get("version")?,
        predictable_id: None,
        created_at: DateTime::from_timestamp_millis(created_at_ms).unwrap_or_else(Utc::now),
        error: None,
        error_detail: None,
        overrides: Map::new(),
        rejected,
    })
}
