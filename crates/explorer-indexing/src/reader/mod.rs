//! Queue readers.
//!
//! A reader hands out batches of pending events and takes back the outcome
//! of ingesting them. Two backends exist:
//!
//! - [`StreamQueueReader`]: RocksDB priority streams with a consumer group
//! - [`PollingQueueReader`]: the relational queue table, sharded by id
//!
//! Both are at-least-once: an event stays pending until its outcome has
//! been reported, so a crash between fetch and report re-delivers it.

mod polling;
mod stream;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use explorer_types::{IngestionOutcome, QueuedEvent};

use crate::error::IndexingError;

pub use polling::PollingQueueReader;
pub use stream::StreamQueueReader;

/// Reader lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReaderStatus {
    Running,
    Stopped,
}

/// What the reader did with a reported outcome.
#[derive(Debug, Clone, Default)]
pub struct OutcomeReport {
    pub acknowledged: usize,
    pub requeued: usize,
    /// Removed for good; hand these to failure escalation
    pub dropped: Vec<QueuedEvent>,
}

/// Counters since the reader was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReaderMetrics {
    pub fetched: u64,
    pub acknowledged: u64,
    pub requeued: u64,
    pub dropped: u64,
}

#[derive(Debug, Default)]
pub(crate) struct ReaderCounters {
    fetched: AtomicU64,
    acknowledged: AtomicU64,
    requeued: AtomicU64,
    dropped: AtomicU64,
}

impl ReaderCounters {
    pub(crate) fn record_fetch(&self, count: usize) {
        self.fetched.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_report(&self, report: &OutcomeReport) {
        self.acknowledged
            .fetch_add(report.acknowledged as u64, Ordering::Relaxed);
        self.requeued.fetch_add(report.requeued as u64, Ordering::Relaxed);
        self.dropped
            .fetch_add(report.dropped.len() as u64, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> ReaderMetrics {
        ReaderMetrics {
            fetched: self.fetched.load(Ordering::Relaxed),
            acknowledged: self.acknowledged.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Wake-up callback fired when new work may be available.
pub type NewItemCallback = Arc<dyn Fn() + Send + Sync>;

/// Registered wake-up callbacks.
///
/// Reader implementations keep one behind an `Arc` and hand out
/// [`Subscription`]s from [`QueueReader::on_new_item`].
#[derive(Default)]
pub struct ListenerSet {
    next_id: AtomicU64,
    callbacks: Mutex<HashMap<u64, NewItemCallback>>,
}

impl ListenerSet {
    pub fn subscribe(self: &Arc<Self>, callback: NewItemCallback) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, callback);
        Subscription {
            id,
            listeners: Arc::downgrade(self),
        }
    }

    fn remove(&self, id: u64) {
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    pub fn notify(&self) {
        let callbacks: Vec<NewItemCallback> = self
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for callback in callbacks {
            callback();
        }
    }

    pub fn len(&self) -> usize {
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle returned by [`QueueReader::on_new_item`].
///
/// Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    listeners: Weak<ListenerSet>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.remove(self.id);
        }
    }
}

/// Source of pending events and sink of their outcomes.
#[async_trait]
pub trait QueueReader: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &'static str;

    /// Begin watching for new items. Idempotent.
    async fn start(&self) -> Result<(), IndexingError>;

    /// Stop watching for new items. Idempotent.
    async fn stop(&self) -> Result<(), IndexingError>;

    fn status(&self) -> ReaderStatus;

    /// Pending events whose attempts are below `max_attempt`, highest
    /// priority first, then oldest first.
    async fn fetch_batch(
        &self,
        max_batch_size: usize,
        max_attempt: u32,
    ) -> Result<Vec<QueuedEvent>, IndexingError>;

    /// Acknowledge successes and requeue or drop failures.
    ///
    /// A failure whose attempt count reaches `max_attempt` is removed and
    /// returned in [`OutcomeReport::dropped`].
    async fn report_outcome(
        &self,
        outcome: &IngestionOutcome,
        max_attempt: u32,
    ) -> Result<OutcomeReport, IndexingError>;

    /// Register a wake-up callback.
    fn on_new_item(&self, callback: NewItemCallback) -> Subscription;

    /// Events still waiting to be ingested.
    async fn pending_count(&self) -> Result<u64, IndexingError>;

    fn metrics(&self) -> ReaderMetrics;
}

/// Highest priority first, then oldest first.
pub(crate) fn sort_batch(events: &mut [QueuedEvent]) {
    events.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.created_at.cmp(&b.created_at))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_subscription_drop_unsubscribes() {
        let listeners = Arc::new(ListenerSet::default());
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let subscription = listeners.subscribe(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        listeners.notify();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        subscription.unsubscribe();
        listeners.notify();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(listeners.len(), 0);
    }

    #[test]
    fn test_counters_snapshot() {
        let counters = ReaderCounters::default();
        counters.record_fetch(3);
        counters.record_report(&OutcomeReport {
            acknowledged: 2,
            requeued: 1,
            dropped: Vec::new(),
        });
        assert_eq!(
            counters.snapshot(),
            ReaderMetrics {
                fetched: 3,
                acknowledged: 2,
                requeued: 1,
                dropped: 0,
            }
        );
    }
}
