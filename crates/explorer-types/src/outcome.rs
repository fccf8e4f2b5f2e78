//! Per-cycle result types.

use std::collections::BTreeMap;

use crate::event::QueuedEvent;

/// Partition of a cycle's events into succeeded and failed.
///
/// Built per cycle and never persisted. Every failed entry carries `error`.
#[derive(Debug, Clone, Default)]
pub struct IngestionOutcome {
    pub succeeded: Vec<QueuedEvent>,
    pub failed: Vec<QueuedEvent>,
}

impl IngestionOutcome {
    pub fn new() -> Self {
        Self::default()
    }

    /// Outcome in which every event failed with the same reason.
    pub fn all_failed(events: Vec<QueuedEvent>, error: &str) -> Self {
        let failed = events
            .into_iter()
            .map(|mut event| {
                event.fail(error, None);
                event
            })
            .collect();
        Self {
            succeeded: Vec::new(),
            failed,
        }
    }

    pub fn merge(&mut self, other: IngestionOutcome) {
        self.succeeded.extend(other.succeeded);
        self.failed.extend(other.failed);
    }

    pub fn len(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }
}

/// Output of a message merger.
#[derive(Debug, Clone, Default)]
pub struct MergeResult {
    /// Events to ingest, one per logical resource when collapsing
    pub to_process: Vec<QueuedEvent>,
    /// All input events grouped by resource unique id
    pub groups: BTreeMap<String, Vec<QueuedEvent>>,
}
