//! Polling queue reader over the relational queue table.
//!
//! Each worker owns the rows whose `id % worker_count == worker_index`.
//! Enqueue notifications only raise a pending flag; the first notification
//! after a fetch fires the wake-up callbacks and later ones coalesce until
//! the next fetch clears the flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use explorer_relational::QueueTable;
use explorer_types::{IngestionOutcome, QueuedEvent};

use super::{
    sort_batch, ListenerSet, NewItemCallback, OutcomeReport, QueueReader, ReaderCounters,
    ReaderMetrics, ReaderStatus, Subscription,
};
use crate::error::IndexingError;

/// Sharded reader over [`QueueTable`].
pub struct PollingQueueReader {
    table: QueueTable,
    worker_index: u32,
    worker_count: u32,
    running: AtomicBool,
    notified: Arc<AtomicBool>,
    listeners: Arc<ListenerSet>,
    counters: ReaderCounters,
    listener_task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl PollingQueueReader {
    pub fn new(table: QueueTable) -> Self {
        Self {
            table,
            worker_index: 0,
            worker_count: 1,
            running: AtomicBool::new(false),
            notified: Arc::new(AtomicBool::new(false)),
            listeners: Arc::new(ListenerSet::default()),
            counters: ReaderCounters::default(),
            listener_task: Mutex::new(None),
        }
    }

    /// Restrict this reader to one shard of the table.
    pub fn with_shard(mut self, worker_index: u32, worker_count: u32) -> Self {
        self.worker_count = worker_count.max(1);
        self.worker_index = worker_index % self.worker_count;
        self
    }

    pub fn table(&self) -> &QueueTable {
        &self.table
    }

    fn owns(id: i64, worker_index: u32, worker_count: u32) -> bool {
        id.rem_euclid(i64::from(worker_count)) == i64::from(worker_index)
    }
}

#[async_trait]
impl QueueReader for PollingQueueReader {
    fn name(&self) -> &'static str {
        "polling"
    }

    async fn start(&self) -> Result<(), IndexingError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let token = CancellationToken::new();
        let child = token.clone();
        let listeners = self.listeners.clone();
        let notified = self.notified.clone();
        let (worker_index, worker_count) = (self.worker_index, self.worker_count);
        let mut receiver = self.table.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    _ = child.cancelled() => break,
                    received = receiver.recv() => received,
                };
                let relevant = match received {
                    Ok(id) => Self::owns(id, worker_index, worker_count),
                    // Missed ids might be ours
                    Err(RecvError::Lagged(_)) => true,
                    Err(RecvError::Closed) => break,
                };
                if relevant && !notified.swap(true, Ordering::SeqCst) {
                    listeners.notify();
                }
            }
            debug!("Queue notification listener exited");
        });
        *self
            .listener_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some((token, handle));

        info!(
            worker_index = self.worker_index,
            worker_count = self.worker_count,
            "Polling reader started"
        );
        if self.pending_count().await? > 0 {
            self.notified.store(true, Ordering::SeqCst);
            self.listeners.notify();
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), IndexingError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let task = self
            .listener_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some((token, handle)) = task {
            token.cancel();
            if let Err(e) = handle.await {
                warn!(error = %e, "Queue notification listener did not exit cleanly");
            }
        }
        info!("Polling reader stopped");
        Ok(())
    }

    fn status(&self) -> ReaderStatus {
        if self.running.load(Ordering::SeqCst) {
            ReaderStatus::Running
        } else {
            ReaderStatus::Stopped
        }
    }

    async fn fetch_batch(
        &self,
        max_batch_size: usize,
        max_attempt: u32,
    ) -> Result<Vec<QueuedEvent>, IndexingError> {
        self.notified.store(false, Ordering::SeqCst);
        let mut events = self
            .table
            .fetch_pending(max_batch_size, max_attempt, self.worker_index, self.worker_count)
            .await?;
        sort_batch(&mut events);
        self.counters.record_fetch(events.len());
        debug!(count = events.len(), "Fetched queue rows");
        Ok(events)
    }

    async fn report_outcome(
        &self,
        outcome: &IngestionOutcome,
        max_attempt: u32,
    ) -> Result<OutcomeReport, IndexingError> {
        let summary = self.table.report(outcome, max_attempt).await?;
        let report = OutcomeReport {
            acknowledged: summary.acknowledged,
            requeued: summary.requeued,
            dropped: summary.dropped,
        };
        self.counters.record_report(&report);
        Ok(report)
    }

    fn on_new_item(&self, callback: NewItemCallback) -> Subscription {
        self.listeners.subscribe(callback)
    }

    async fn pending_count(&self) -> Result<u64, IndexingError> {
        Ok(self
            .table
            .pending_count(self.worker_index, self.worker_count)
            .await?)
    }

    fn metrics(&self) -> ReaderMetrics {
        self.counters.snapshot()
    }
}
