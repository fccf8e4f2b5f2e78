//! Stream-backed queue reader.
//!
//! Reads the six priority streams through one consumer group. Delivered
//! entries sit in the group's pending list until their outcome is reported:
//! successes are acknowledged and deleted, failures move to the `*_fail`
//! stream of their priority with `attemptCount + 1`, and exhausted ones are
//! acknowledged and returned as dropped.
//!
//! A background task waits on the store's append signal and fires the
//! wake-up callbacks; it never reads entries itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use explorer_storage::{fail_stream, Requeue, StorageError, StreamEntry, StreamStore, ALL_STREAMS};
use explorer_types::{IngestionOutcome, QueueToken, QueuedEvent};

use super::{
    sort_batch, ListenerSet, NewItemCallback, OutcomeReport, QueueReader, ReaderCounters,
    ReaderMetrics, ReaderStatus, Subscription,
};
use crate::error::IndexingError;

/// Consumer-group reader over [`StreamStore`].
pub struct StreamQueueReader {
    store: Arc<StreamStore>,
    group: String,
    consumer: String,
    running: AtomicBool,
    /// Re-deliver this consumer's own pending entries on the next fetch
    recover_own: Arc<AtomicBool>,
    /// Claim other consumers' idle entries on the next fetch
    reclaim_idle: Arc<AtomicBool>,
    reclaim_idle_ms: i64,
    listeners: Arc<ListenerSet>,
    counters: ReaderCounters,
    read_loop: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl StreamQueueReader {
    pub fn new(store: Arc<StreamStore>, group: impl Into<String>, consumer: impl Into<String>) -> Self {
        Self {
            store,
            group: group.into(),
            consumer: consumer.into(),
            running: AtomicBool::new(false),
            recover_own: Arc::new(AtomicBool::new(true)),
            reclaim_idle: Arc::new(AtomicBool::new(false)),
            reclaim_idle_ms: 300_000,
            listeners: Arc::new(ListenerSet::default()),
            counters: ReaderCounters::default(),
            read_loop: Mutex::new(None),
        }
    }

    pub fn with_reclaim_idle_ms(mut self, idle_ms: i64) -> Self {
        self.reclaim_idle_ms = idle_ms;
        self
    }

    pub fn store(&self) -> &Arc<StreamStore> {
        &self.store
    }

    /// Ask the next fetch to claim entries other consumers left idle.
    ///
    /// Wakes the listeners so the claim happens promptly.
    pub fn request_reclaim(&self) {
        self.reclaim_idle.store(true, Ordering::SeqCst);
        self.listeners.notify();
    }

    fn decode(store: &StreamStore, group: &str, entries: Vec<StreamEntry>) -> Vec<QueuedEvent> {
        let mut events = Vec::with_capacity(entries.len());
        for entry in entries {
            match QueuedEvent::from_bytes(&entry.payload) {
                Ok(mut event) => {
                    event.queue_token = QueueToken::Stream {
                        stream: entry.stream,
                        seq: entry.sequence,
                    };
                    events.push(event);
                }
                Err(e) => {
                    // Undecodable entries can never succeed; drop them
                    error!(
                        stream = %entry.stream,
                        sequence = entry.sequence,
                        error = %e,
                        "Discarding corrupt stream entry"
                    );
                    if let Err(e) = store.ack(group, &entry.stream, &[entry.sequence]) {
                        warn!(error = %e, "Failed to discard corrupt entry");
                    }
                }
            }
        }
        events
    }

    fn fetch_blocking(
        store: &StreamStore,
        group: &str,
        consumer: &str,
        max: usize,
        recover_own: bool,
        reclaim_idle_ms: Option<i64>,
    ) -> Result<Vec<StreamEntry>, IndexingError> {
        let mut entries = Vec::new();

        if recover_own {
            for stream in ALL_STREAMS {
                let room = max.saturating_sub(entries.len());
                entries.extend(store.claim_pending(group, stream, consumer, Some(consumer), 0, room)?);
            }
        }
        if let Some(idle_ms) = reclaim_idle_ms {
            for stream in ALL_STREAMS {
                let room = max.saturating_sub(entries.len());
                entries.extend(store.claim_pending(group, stream, consumer, None, idle_ms, room)?);
            }
        }
        for stream in ALL_STREAMS {
            let room = max.saturating_sub(entries.len());
            if room == 0 {
                break;
            }
            entries.extend(store.read_group(group, consumer, stream, room)?);
        }
        Ok(entries)
    }

    /// Settle a batch outcome in one store write.
    ///
    /// Nothing is acknowledged, requeued or dropped unless all of it is, so
    /// a failed report leaves the whole batch pending for redelivery.
    fn report_blocking(
        store: &StreamStore,
        group: &str,
        outcome: &IngestionOutcome,
        max_attempt: u32,
    ) -> Result<OutcomeReport, IndexingError> {
        let mut acks = Vec::new();
        for event in &outcome.succeeded {
            if let QueueToken::Stream { stream, seq } = &event.queue_token {
                acks.push((stream.clone(), *seq));
            }
        }
        let acknowledged = acks.len();

        let mut requeues = Vec::new();
        let mut dropped = Vec::new();
        for event in &outcome.failed {
            let QueueToken::Stream { stream, seq } = &event.queue_token else {
                warn!(resource_id = %event.resource_id, "Failed event has no stream position");
                continue;
            };
            let mut event = event.clone();
            event.attempt_count += 1;

            if event.attempt_count >= max_attempt {
                acks.push((stream.clone(), *seq));
                dropped.push(event);
                continue;
            }

            let target = fail_stream(event.priority.as_str())
                .ok_or_else(|| StorageError::UnknownStream(format!("{}_fail", event.priority.as_str())))?;
            requeues.push(Requeue {
                from_stream: stream.clone(),
                sequence: *seq,
                to_stream: target.to_string(),
                payload: event.to_bytes()?,
            });
        }

        store.settle(group, &acks, &requeues)?;

        for event in &dropped {
            warn!(
                resource_id = %event.resource_id,
                attempts = event.attempt_count,
                error = event.error.as_deref().unwrap_or(""),
                "Dropping event after final attempt"
            );
        }
        Ok(OutcomeReport {
            acknowledged,
            requeued: requeues.len(),
            dropped,
        })
    }
}

#[async_trait]
impl QueueReader for StreamQueueReader {
    fn name(&self) -> &'static str {
        "stream"
    }

    async fn start(&self) -> Result<(), IndexingError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let token = CancellationToken::new();
        let child = token.clone();
        let listeners = self.listeners.clone();
        let mut appended = self.store.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    changed = appended.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        listeners.notify();
                    }
                }
            }
            debug!("Stream read loop exited");
        });
        *self.read_loop.lock().unwrap_or_else(PoisonError::into_inner) = Some((token, handle));

        let store = self.store.clone();
        let group = self.group.clone();
        let backlog = tokio::task::spawn_blocking(move || -> Result<bool, IndexingError> {
            Ok(store.has_undelivered(&group)? || store.pending_len(&group)? > 0)
        })
        .await??;

        info!(group = %self.group, consumer = %self.consumer, backlog, "Stream reader started");
        if backlog {
            self.listeners.notify();
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), IndexingError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let read_loop = self
            .read_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some((token, handle)) = read_loop {
            token.cancel();
            if let Err(e) = handle.await {
                warn!(error = %e, "Stream read loop did not exit cleanly");
            }
        }
        info!(group = %self.group, "Stream reader stopped");
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
        _max_attempt: u32,
    ) -> Result<Vec<QueuedEvent>, IndexingError> {
        let store = self.store.clone();
        let group = self.group.clone();
        let consumer = self.consumer.clone();
        let recover_own = self.recover_own.clone();
        let reclaim_idle = self.reclaim_idle.clone();
        let reclaim_idle_ms = self.reclaim_idle_ms;

        let mut events = tokio::task::spawn_blocking(move || -> Result<Vec<QueuedEvent>, IndexingError> {
            let recover = recover_own.swap(false, Ordering::SeqCst);
            let reclaim = reclaim_idle
                .swap(false, Ordering::SeqCst)
                .then_some(reclaim_idle_ms);
            let fetched = Self::fetch_blocking(&store, &group, &consumer, max_batch_size, recover, reclaim);
            if fetched.is_err() {
                // Retry the recovery on the next fetch
                recover_own.fetch_or(recover, Ordering::SeqCst);
                if reclaim.is_some() {
                    reclaim_idle.store(true, Ordering::SeqCst);
                }
            }
            Ok(Self::decode(&store, &group, fetched?))
        })
        .await??;

        sort_batch(&mut events);
        self.counters.record_fetch(events.len());
        debug!(count = events.len(), "Fetched stream batch");
        Ok(events)
    }

    async fn report_outcome(
        &self,
        outcome: &IngestionOutcome,
        max_attempt: u32,
    ) -> Result<OutcomeReport, IndexingError> {
        let store = self.store.clone();
        let group = self.group.clone();
        let outcome = outcome.clone();

        let report = tokio::task::spawn_blocking(move || {
            Self::report_blocking(&store, &group, &outcome, max_attempt)
        })
        .await
        .map_err(IndexingError::from)
        .and_then(|report| report);
        let report = match report {
            Ok(report) => report,
            Err(e) => {
                // The batch is still pending under this consumer
                self.recover_own.store(true, Ordering::SeqCst);
                return Err(e);
            }
        };

        self.counters.record_report(&report);
        debug!(
            acknowledged = report.acknowledged,
            requeued = report.requeued,
            dropped = report.dropped.len(),
            "Reported stream outcome"
        );
        Ok(report)
    }

    fn on_new_item(&self, callback: NewItemCallback) -> Subscription {
        self.listeners.subscribe(callback)
    }

    async fn pending_count(&self) -> Result<u64, IndexingError> {
        let store = self.store.clone();
        let group = self.group.clone();
        let stats = tokio::task::spawn_blocking(move || store.stats(&group)).await??;
        Ok(stats.lengths.values().sum())
    }

    fn metrics(&self) -> ReaderMetrics {
        self.counters.snapshot()
    }
}
