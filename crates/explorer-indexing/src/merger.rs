//! Pre-ingestion message merging.
//!
//! A merger reduces a fetched batch before materialization. The default
//! [`NoopMerger`] passes every event through. [`CollapsingMerger`] folds the
//! events of one resource into a single representative; the events it
//! merged away share the representative's outcome through
//! [`expand_outcome`], so each is still acknowledged or retried.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::{error, warn};

use explorer_search::{merge_sub_resources, SUB_RESOURCES_FIELD};
use explorer_types::{IngestAction, IngestionOutcome, MergeResult, MergeStrategy, QueuedEvent};

/// Reduces a batch of events. Must not perform I/O.
pub trait MessageMerger: Send + Sync {
    fn merge(&self, events: Vec<QueuedEvent>) -> MergeResult;
}

/// Merger selected by configuration.
pub fn merger_for(strategy: MergeStrategy) -> Box<dyn MessageMerger> {
    match strategy {
        MergeStrategy::None => Box::new(NoopMerger),
        MergeStrategy::Collapse => Box::new(CollapsingMerger),
    }
}

fn group_by_resource(events: &[QueuedEvent]) -> BTreeMap<String, Vec<QueuedEvent>> {
    let mut groups: BTreeMap<String, Vec<QueuedEvent>> = BTreeMap::new();
    for event in events {
        groups
            .entry(event.unique_id().to_string())
            .or_default()
            .push(event.clone());
    }
    groups
}

/// Every event is processed on its own.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMerger;

impl MessageMerger for NoopMerger {
    fn merge(&self, events: Vec<QueuedEvent>) -> MergeResult {
        MergeResult {
            groups: group_by_resource(&events),
            to_process: events,
        }
    }
}

/// One event per resource: latest upsert wins, deletes dominate.
#[derive(Debug, Default, Clone, Copy)]
pub struct CollapsingMerger;

impl CollapsingMerger {
    /// Newer upsert as base with both sub-resource lists spliced in.
    fn merge_upserts(older: &QueuedEvent, newer: QueuedEvent) -> QueuedEvent {
        let mut merged = newer;
        merged.version = merged.version.max(older.version);

        let older_subs = match older.payload.get(SUB_RESOURCES_FIELD) {
            Some(Value::Array(entries)) => entries.clone(),
            _ => return merged,
        };
        let newer_subs = match merged.payload.remove(SUB_RESOURCES_FIELD) {
            Some(Value::Array(entries)) => entries,
            _ => Vec::new(),
        };
        let mut spliced = older_subs;
        merge_sub_resources(&mut spliced, &newer_subs, true);
        merged
            .payload
            .insert(SUB_RESOURCES_FIELD.to_string(), Value::Array(spliced));
        merged
    }

    fn collapse(group: &[QueuedEvent]) -> Vec<QueuedEvent> {
        let mut ordered: Vec<&QueuedEvent> = group.iter().collect();
        ordered.sort_by_key(|e| e.created_at);

        let mut independent = Vec::new();
        let mut result: Option<QueuedEvent> = None;
        let mut deleted = false;

        for event in ordered {
            match event.action {
                IngestAction::Audience => {
                    warn!(resource = %event.unique_id(), "Audience events are not merged");
                    independent.push(event.clone());
                }
                IngestAction::Delete => {
                    result = Some(event.clone());
                    deleted = true;
                }
                IngestAction::Upsert if deleted => {
                    error!(
                        resource = %event.unique_id(),
                        version = event.version,
                        "Upsert queued after delete; keeping the delete"
                    );
                }
                IngestAction::Upsert => {
                    result = Some(match result.take() {
                        Some(previous) => Self::merge_upserts(&previous, event.clone()),
                        None => event.clone(),
                    });
                }
            }
        }

        let mut out: Vec<QueuedEvent> = result.into_iter().collect();
        out.extend(independent);
        out
    }
}

impl MessageMerger for CollapsingMerger {
    fn merge(&self, events: Vec<QueuedEvent>) -> MergeResult {
        let groups = group_by_resource(&events);

        // Keep the batch order of each resource's first appearance
        let mut seen = std::collections::HashSet::new();
        let mut to_process = Vec::new();
        for event in &events {
            let key = event.unique_id().to_string();
            if seen.insert(key.clone()) {
                if let Some(group) = groups.get(&key) {
                    to_process.extend(Self::collapse(group));
                }
            }
        }

        MergeResult { to_process, groups }
    }
}

/// Give events merged away the outcome of their representative.
pub fn expand_outcome(merge: &MergeResult, mut outcome: IngestionOutcome) -> IngestionOutcome {
    let processed: Vec<_> = merge.to_process.iter().map(|e| &e.queue_token).collect();
    let mut extra_succeeded = Vec::new();
    let mut extra_failed = Vec::new();
    let mut expanded = std::collections::HashSet::new();

    let representatives = outcome
        .succeeded
        .iter()
        .map(|e| (e, true))
        .chain(outcome.failed.iter().map(|e| (e, false)));
    for (representative, succeeded) in representatives {
        if representative.queue_token.is_derived() || representative.action == IngestAction::Audience {
            continue;
        }
        let key = representative.unique_id().to_string();
        if !expanded.insert(key.clone()) {
            continue;
        }
        let Some(group) = merge.groups.get(&key) else {
            continue;
        };
        for member in group {
            if member.action == IngestAction::Audience || processed.contains(&&member.queue_token) {
                continue;
            }
            let mut member = member.clone();
            if succeeded {
                extra_succeeded.push(member);
            } else {
                member.fail(
                    representative.error.clone().unwrap_or_default(),
                    representative.error_detail.clone(),
                );
                extra_failed.push(member);
            }
        }
    }

    outcome.succeeded.extend(extra_succeeded);
    outcome.failed.extend(extra_failed);
    outcome
}
