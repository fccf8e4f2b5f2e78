//! Permanent-failure escalation.
//!
//! Events that exhaust their attempts are removed from the queue and handed
//! to an ordered chain of [`FailureHandler`]s. Each handler runs in its own
//! task: an error or a panic in one is logged and the next still runs.
//!
//! Two handlers ship with the crate:
//!
//! - [`CountingHandler`]: per-kind drop counters
//! - [`ReindexTrigger`]: groups dropped ids by `(application, resourceType)`
//!   and asks the owning application to reindex them, after a quiet period
//!   or as soon as a group grows past `max_pending`

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use explorer_types::{EscalationSettings, QueuedEvent};

use crate::SchedulerError;

/// Receives events that will never be retried.
#[async_trait]
pub trait FailureHandler: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    async fn handle(&self, dropped: &[QueuedEvent]) -> Result<(), SchedulerError>;

    /// Push out anything buffered. Called on scheduler stop.
    async fn flush(&self) -> Result<(), SchedulerError> {
        Ok(())
    }
}

/// Ordered chain of failure handlers.
#[derive(Default, Clone)]
pub struct FailureEscalation {
    handlers: Vec<Arc<dyn FailureHandler>>,
}

impl FailureEscalation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler; handlers run in insertion order.
    pub fn with_handler(mut self, handler: Arc<dyn FailureHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Hand dropped events to every handler.
    pub async fn escalate(&self, dropped: Vec<QueuedEvent>) {
        if dropped.is_empty() {
            return;
        }
        for event in &dropped {
            warn!(
                resource = %event.unique_id(),
                attempts = event.attempt_count,
                error = event.error.as_deref().unwrap_or("unknown"),
                detail = event.error_detail.as_deref().unwrap_or(""),
                "Event dropped after exhausting its attempts"
            );
        }

        let dropped = Arc::new(dropped);
        for handler in &self.handlers {
            let name = handler.name();
            let task_handler = handler.clone();
            let events = dropped.clone();
            match tokio::spawn(async move { task_handler.handle(&events).await }).await {
                Ok(Ok(())) => debug!(handler = name, count = dropped.len(), "Failure handler done"),
                Ok(Err(e)) => warn!(handler = name, error = %e, "Failure handler failed"),
                Err(e) => error!(handler = name, error = %e, "Failure handler panicked"),
            }
        }
    }

    /// Flush every handler, isolating failures the same way.
    pub async fn flush(&self) {
        for handler in &self.handlers {
            let name = handler.name();
            let task_handler = handler.clone();
            match tokio::spawn(async move { task_handler.flush().await }).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(handler = name, error = %e, "Failure handler flush failed"),
                Err(e) => error!(handler = name, error = %e, "Failure handler flush panicked"),
            }
        }
    }
}

/// Counts dropped events per `application:resourceType`.
#[derive(Debug, Default)]
pub struct CountingHandler {
    total: AtomicU64,
    by_kind: DashMap<String, u64>,
}

impl CountingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn count_for(&self, application: &str, resource_type: &str) -> u64 {
        self.by_kind
            .get(&format!("{}:{}", application, resource_type))
            .map(|count| *count)
            .unwrap_or(0)
    }

    /// Snapshot of all per-kind counters.
    pub fn snapshot(&self) -> HashMap<String, u64> {
        self.by_kind
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }
}

#[async_trait]
impl FailureHandler for CountingHandler {
    fn name(&self) -> &'static str {
        "counter"
    }

    async fn handle(&self, dropped: &[QueuedEvent]) -> Result<(), SchedulerError> {
        self.total.fetch_add(dropped.len() as u64, Ordering::Relaxed);
        for event in dropped {
            *self
                .by_kind
                .entry(format!("{}:{}", event.application, event.resource_type))
                .or_insert(0) += 1;
        }
        Ok(())
    }
}

/// Sends reindex requests to the application that owns the resources.
#[async_trait]
pub trait ReindexClient: Send + Sync {
    async fn request_reindex(
        &self,
        application: &str,
        resource_type: &str,
        resource_ids: Vec<String>,
    ) -> Result<(), SchedulerError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReindexRequest {
    resource_ids: Vec<String>,
}

/// POSTs `{"resourceIds": [...]}` to the endpoint configured for a kind.
pub struct HttpReindexClient {
    client: Client,
    settings: EscalationSettings,
}

impl HttpReindexClient {
    pub fn new(settings: EscalationSettings) -> Result<Self, SchedulerError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(settings.request_timeout_ms))
            .build()?;
        Ok(Self { client, settings })
    }
}

#[async_trait]
impl ReindexClient for HttpReindexClient {
    async fn request_reindex(
        &self,
        application: &str,
        resource_type: &str,
        resource_ids: Vec<String>,
    ) -> Result<(), SchedulerError> {
        let Some(endpoint) = self.settings.endpoint_for(application, resource_type) else {
            warn!(
                application,
                resource_type,
                count = resource_ids.len(),
                "No reindex endpoint configured; dropping request"
            );
            return Ok(());
        };

        let count = resource_ids.len();
        self.client
            .post(endpoint)
            .json(&ReindexRequest { resource_ids })
            .send()
            .await?
            .error_for_status()?;
        info!(application, resource_type, count, "Reindex requested");
        Ok(())
    }
}

type GroupKey = (String, String);

#[derive(Default)]
struct PendingGroup {
    ids: BTreeSet<String>,
    generation: u64,
}

struct ReindexState {
    client: Arc<dyn ReindexClient>,
    quiet_period: Duration,
    max_pending: usize,
    pending: Mutex<HashMap<GroupKey, PendingGroup>>,
}

impl ReindexState {
    /// Remove a group unless arrivals after `generation` re-armed it.
    fn take_group(&self, key: &GroupKey, generation: u64) -> Option<Vec<String>> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if pending.get(key)?.generation != generation {
            return None;
        }
        pending
            .remove(key)
            .map(|group| group.ids.into_iter().collect())
    }

    // Errors are logged, never retried
    async fn send(&self, key: GroupKey, ids: Vec<String>) {
        if ids.is_empty() {
            return;
        }
        let (application, resource_type) = key;
        let count = ids.len();
        if let Err(e) = self
            .client
            .request_reindex(&application, &resource_type, ids)
            .await
        {
            warn!(
                application = %application,
                resource_type = %resource_type,
                count,
                error = %e,
                "Reindex request failed"
            );
        }
    }
}

/// Debounced reindex requests for dropped events.
#[derive(Clone)]
pub struct ReindexTrigger {
    state: Arc<ReindexState>,
}

impl ReindexTrigger {
    pub fn new(client: Arc<dyn ReindexClient>, quiet_period: Duration, max_pending: usize) -> Self {
        Self {
            state: Arc::new(ReindexState {
                client,
                quiet_period,
                max_pending,
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn from_settings(client: Arc<dyn ReindexClient>, settings: &EscalationSettings) -> Self {
        Self::new(
            client,
            Duration::from_millis(settings.quiet_period_ms),
            settings.max_pending,
        )
    }

    /// Ids waiting for a flush, across all groups.
    pub fn pending_len(&self) -> usize {
        self.state
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|group| group.ids.len())
            .sum()
    }

    fn schedule_quiet_flush(&self, key: GroupKey, generation: u64) {
        let state = self.state.clone();
        tokio::spawn(async move {
            tokio::time::sleep(state.quiet_period).await;
            if let Some(ids) = state.take_group(&key, generation) {
                debug!(count = ids.len(), "Quiet period elapsed; flushing reindex group");
                state.send(key, ids).await;
            }
        });
    }
}

#[async_trait]
impl FailureHandler for ReindexTrigger {
    fn name(&self) -> &'static str {
        "reindex"
    }

    async fn handle(&self, dropped: &[QueuedEvent]) -> Result<(), SchedulerError> {
        let mut overflowing = Vec::new();
        let mut quiet = Vec::new();
        {
            let mut pending = self
                .state
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            for event in dropped {
                let key = (event.application.clone(), event.resource_type.clone());
                let group = pending.entry(key).or_default();
                group.ids.insert(event.resource_id.clone());
            }
            let touched: BTreeSet<GroupKey> = dropped
                .iter()
                .map(|e| (e.application.clone(), e.resource_type.clone()))
                .collect();
            for key in touched {
                let Some(group) = pending.get_mut(&key) else {
                    continue;
                };
                if group.ids.len() > self.state.max_pending {
                    if let Some(group) = pending.remove(&key) {
                        overflowing.push((key, group.ids.into_iter().collect::<Vec<_>>()));
                    }
                } else {
                    group.generation += 1;
                    quiet.push((key, group.generation));
                }
            }
        }

        for (key, generation) in quiet {
            self.schedule_quiet_flush(key, generation);
        }
        for (key, ids) in overflowing {
            debug!(count = ids.len(), "Reindex group over threshold; flushing now");
            let state = self.state.clone();
            tokio::spawn(async move { state.send(key, ids).await });
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), SchedulerError> {
        let groups: Vec<(GroupKey, PendingGroup)> = self
            .state
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (key, group) in groups {
            self.state.send(key, group.ids.into_iter().collect()).await;
        }
        Ok(())
    }
}
